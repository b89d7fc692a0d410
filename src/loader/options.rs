//! # 单次请求选项
//!
//! `LoadOptions` 描述“这一张图怎么加载”：缓存开关、缩放策略、处理器、占位图、
//! 是否同步执行以及回调投递到哪个线程。构建完成后以 `Arc` 共享，不再修改。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::delivery::DeliveryContext;
use super::source::DecodedBuffer;

/// 解码期缩放策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageScaleType {
    /// 不降采样。
    None,
    /// 仅在超出最大位图尺寸时降采样。
    NoneSafe,
    /// 按 2 的幂降采样（解码最快）。
    #[default]
    PowerOf2,
    /// 按整数倍降采样。
    Integer,
    /// 整数倍降采样后再精确缩小到目标尺寸。
    Exact,
    /// 整数倍降采样后精确缩放到目标尺寸，允许放大。
    ExactStretched,
}

impl ImageScaleType {
    /// 解码后是否需要精确缩放。
    pub fn is_exact(self) -> bool {
        matches!(self, Self::Exact | Self::ExactStretched)
    }
}

/// 缓冲处理器：输入共享缓冲，输出新缓冲；返回 `None` 表示处理失败。
pub trait BufferProcessor: Send + Sync {
    fn process(&self, buffer: Arc<DecodedBuffer>) -> Option<Arc<DecodedBuffer>>;
}

impl<F> BufferProcessor for F
where
    F: Fn(Arc<DecodedBuffer>) -> Option<Arc<DecodedBuffer>> + Send + Sync,
{
    fn process(&self, buffer: Arc<DecodedBuffer>) -> Option<Arc<DecodedBuffer>> {
        self(buffer)
    }
}

/// 单次请求的加载选项。
#[derive(Clone)]
pub struct LoadOptions {
    /// 缓存未命中、开始加载时展示的占位图。
    pub image_on_loading: Option<Arc<DecodedBuffer>>,
    /// 资源标识为空时展示的图。
    pub image_for_empty_uri: Option<Arc<DecodedBuffer>>,
    /// 加载失败时展示的图。
    pub image_on_fail: Option<Arc<DecodedBuffer>>,
    /// 开始加载前是否清空消费端当前内容（`image_on_loading` 为空时生效）。
    pub reset_before_loading: bool,
    pub cache_in_memory: bool,
    pub cache_on_disk: bool,
    pub scale_type: ImageScaleType,
    pub delay_before_loading: Option<Duration>,
    /// 是否按 EXIF 方向信息旋转/翻转。
    pub consider_exif: bool,
    /// 透传给数据源提供者的附加信息。
    pub extra_for_provider: Option<String>,
    /// 写入内存缓存前执行。
    pub pre_processor: Option<Arc<dyn BufferProcessor>>,
    /// 写入内存缓存后、投递前执行（内存命中时同样执行）。
    pub post_processor: Option<Arc<dyn BufferProcessor>>,
    /// 在调用线程内同步完成整个流程。
    pub synchronous: bool,
    /// 回调投递上下文；为空时使用加载器默认上下文。
    pub delivery: Option<Arc<dyn DeliveryContext>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            image_on_loading: None,
            image_for_empty_uri: None,
            image_on_fail: None,
            reset_before_loading: false,
            cache_in_memory: false,
            cache_on_disk: false,
            scale_type: ImageScaleType::PowerOf2,
            delay_before_loading: None,
            consider_exif: false,
            extra_for_provider: None,
            pre_processor: None,
            post_processor: None,
            synchronous: false,
            delivery: None,
        }
    }
}

impl LoadOptions {
    /// 同时开启内存与磁盘缓存的常用组合。
    pub fn cached() -> Self {
        Self {
            cache_in_memory: true,
            cache_on_disk: true,
            ..Self::default()
        }
    }

    pub fn should_delay_before_loading(&self) -> bool {
        self.delay_before_loading.is_some_and(|delay| !delay.is_zero())
    }

    pub fn should_pre_process(&self) -> bool {
        self.pre_processor.is_some()
    }

    pub fn should_post_process(&self) -> bool {
        self.post_processor.is_some()
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("cache_in_memory", &self.cache_in_memory)
            .field("cache_on_disk", &self.cache_on_disk)
            .field("scale_type", &self.scale_type)
            .field("delay_before_loading", &self.delay_before_loading)
            .field("consider_exif", &self.consider_exif)
            .field("pre_processor", &self.pre_processor.is_some())
            .field("post_processor", &self.post_processor.is_some())
            .field("synchronous", &self.synchronous)
            .field("custom_delivery", &self.delivery.is_some())
            .finish_non_exhaustive()
    }
}
