//! # 图片加载模块（loader）
//!
//! ## 设计思路
//!
//! 该模块把“请求 → 调度 → 取数据 → 解码缩放 → 缓存 → 投递”按职责拆分为多个子模块：
//!
//! - `handler`：对外门面 `ImageLoader`，组装组件并受理请求
//! - `engine`：线程池、分发、暂停闸门、消费端关联表、按资源加锁
//! - `task`：单次加载的状态机与投递阶段
//! - `stream`：按协议打开数据流（网络 / 文件 / data / 资源目录），以及禁网、弱网包装
//! - `decoder`：读头部、算采样、解码、缩放、按 EXIF 旋转
//! - `size`：目标尺寸推导与采样率计算
//! - `consumer/listener/delivery`：结果接收方、生命周期回调、回调执行线程
//! - `config/options/error/source`：全局配置、单次选项、错误、中间数据模型
//!
//! ## 实现思路
//!
//! 对外仅暴露稳定类型，`task` 与 `lock_table` 等内部细节保持私有。
//! 缓存实现位于同级的 `crate::cache`，通过 `MemoryCache` / `DiskCache` trait 注入。
//!
//! ## 新同事快速上手
//!
//! 可以按下面顺序理解调用链：
//!
//! ```text
//! ImageLoader::request（handler.rs）
//!    ├─ 空资源标识 → 空图占位 + 完成回调
//!    ├─ 内存命中 → 直接投递 / 后处理任务
//!    ↓
//! LoaderEngine::submit（engine.rs，分发池按磁盘缓存选择工作池）
//!    ↓
//! LoadAndDeliverTask::run（task.rs）
//!    ├─ 磁盘缓存 → decoder.rs
//!    ├─ 源地址 → stream.rs → 写磁盘缓存 → decoder.rs
//!    ├─ 预处理 → 写内存缓存 → 后处理
//!    ↓
//! DeliveryContext::post（delivery.rs）→ ConsumerHandle::deliver + LoadingListener
//! ```

mod config;
mod consumer;
mod decoder;
mod delivery;
mod engine;
mod error;
mod handler;
mod listener;
mod lock_table;
mod options;
mod size;
mod source;
mod stream;
mod task;

pub use config::{ImagePerformanceProfile, LoaderConfig, ResizeFilter};
pub use consumer::{ConsumerHandle, ConsumerId, DetachedHandle, Surface, SurfaceHandle};
pub use decoder::{BaseImageDecoder, DecodeLimits, DecodingInfo, ImageDecoder};
pub use delivery::{DeliveryContext, DeliveryJob, DeliveryQueue, DeliveryThread, ImmediateDelivery};
pub use engine::{Job, NetworkMode, TaskExecutor};
pub use error::{FailReason, FailType, ImageError};
pub use handler::{ImageLoader, LoadRequest, LoaderComponents};
pub use listener::{LoadingListener, NoopListener, ProgressListener};
pub use options::{BufferProcessor, ImageScaleType, LoadOptions};
pub use size::{
    compute_exact_scale, compute_min_sample_size, compute_sample_size, define_target_size,
    generate_key, max_bitmap_size, ViewScaleType, DEFAULT_MAX_BITMAP_DIMENSION,
};
pub use source::{DecodedBuffer, ImageSize, LoadedFrom, Scheme, SourceStream};
pub use stream::{
    BaseStreamProvider, NetworkDeniedStreamProvider, NetworkSettings, SlowNetworkStreamProvider,
    StreamProvider,
};
