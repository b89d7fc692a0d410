//! # 消费端句柄
//!
//! ## 设计思路
//!
//! 加载器从不持有展示目标的所有权，只持有一个“能力对象”：
//! 身份、当前尺寸、存活判断与投递原语。目标被销毁后句柄自然失效，
//! 任务在检查点轮询 `is_live` 发现后自行取消。
//!
//! ## 实现思路
//!
//! - `SurfaceHandle` 以 `Weak` 引用展示目标，身份取自目标自身地址，
//!   同一个目标反复发起请求得到的是同一身份，这是“旧任务自检过期”的前提。
//! - `DetachedHandle` 用于没有展示目标的加载（只关心回调），每次分配新身份。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::size::ViewScaleType;
use super::source::{DecodedBuffer, ImageSize, LoadedFrom};

/// 消费端身份。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

/// 加载结果的接收方。
///
/// `deliver` 与 `set_placeholder` 只会在投递上下文中被调用。
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> ConsumerId;

    /// 当前测量宽度；0 表示未知。
    fn width(&self) -> u32;

    /// 当前测量高度；0 表示未知。
    fn height(&self) -> u32;

    fn scale_type(&self) -> ViewScaleType {
        ViewScaleType::FitInside
    }

    fn is_live(&self) -> bool;

    /// 展示加载结果；目标已不存在时返回 `false`。
    fn deliver(&self, buffer: Arc<DecodedBuffer>, loaded_from: LoadedFrom) -> bool;

    /// 展示占位图（`None` 表示清空）。
    fn set_placeholder(&self, buffer: Option<Arc<DecodedBuffer>>) -> bool;
}

/// 可接收图片的展示目标（由宿主实现）。
pub trait Surface: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn scale_type(&self) -> ViewScaleType {
        ViewScaleType::FitInside
    }

    /// `loaded_from` 为 `None` 表示占位图或清空。
    fn show(&self, buffer: Option<Arc<DecodedBuffer>>, loaded_from: Option<LoadedFrom>);
}

/// 以弱引用指向展示目标的句柄。
pub struct SurfaceHandle<S: Surface + 'static> {
    surface: Weak<S>,
    id: ConsumerId,
}

impl<S: Surface + 'static> SurfaceHandle<S> {
    pub fn new(surface: &Arc<S>) -> Self {
        Self {
            surface: Arc::downgrade(surface),
            id: ConsumerId(Arc::as_ptr(surface) as *const () as usize as u64),
        }
    }
}

impl<S: Surface + 'static> ConsumerHandle for SurfaceHandle<S> {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn width(&self) -> u32 {
        self.surface.upgrade().map(|surface| surface.width()).unwrap_or(0)
    }

    fn height(&self) -> u32 {
        self.surface.upgrade().map(|surface| surface.height()).unwrap_or(0)
    }

    fn scale_type(&self) -> ViewScaleType {
        self.surface
            .upgrade()
            .map(|surface| surface.scale_type())
            .unwrap_or_default()
    }

    fn is_live(&self) -> bool {
        self.surface.strong_count() > 0
    }

    fn deliver(&self, buffer: Arc<DecodedBuffer>, loaded_from: LoadedFrom) -> bool {
        match self.surface.upgrade() {
            Some(surface) => {
                surface.show(Some(buffer), Some(loaded_from));
                true
            }
            None => false,
        }
    }

    fn set_placeholder(&self, buffer: Option<Arc<DecodedBuffer>>) -> bool {
        match self.surface.upgrade() {
            Some(surface) => {
                surface.show(buffer, None);
                true
            }
            None => false,
        }
    }
}

impl<S: Surface + 'static> fmt::Debug for SurfaceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

static NEXT_DETACHED_ID: AtomicU64 = AtomicU64::new(1);

/// 没有展示目标的句柄：只提供目标尺寸，结果通过监听器取得。
#[derive(Debug)]
pub struct DetachedHandle {
    id: ConsumerId,
    size: ImageSize,
    scale_type: ViewScaleType,
}

impl DetachedHandle {
    pub fn new(size: ImageSize, scale_type: ViewScaleType) -> Self {
        // 最高位置 1，避免与 SurfaceHandle 的地址身份冲突
        let raw = NEXT_DETACHED_ID.fetch_add(1, Ordering::Relaxed) | (1 << 63);
        Self {
            id: ConsumerId(raw),
            size,
            scale_type,
        }
    }
}

impl ConsumerHandle for DetachedHandle {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn width(&self) -> u32 {
        self.size.width
    }

    fn height(&self) -> u32 {
        self.size.height
    }

    fn scale_type(&self) -> ViewScaleType {
        self.scale_type
    }

    fn is_live(&self) -> bool {
        true
    }

    fn deliver(&self, _buffer: Arc<DecodedBuffer>, _loaded_from: LoadedFrom) -> bool {
        true
    }

    fn set_placeholder(&self, _buffer: Option<Arc<DecodedBuffer>>) -> bool {
        true
    }
}
