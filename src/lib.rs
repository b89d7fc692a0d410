//! # 图片加载库：库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    宿主（界面 / 命令行）                  │
//! │                                                          │
//! │  Surface / ConsumerHandle ── LoadingListener            │
//! │       ↑ 结果与回调经 DeliveryContext 回到宿主线程        │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↕ ImageLoader::request / load_image / load_image_sync
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            加载器 (Rust)                         │
//! │                                                          │
//! │  ┌─ error ────── LoaderError (构建期错误)                │
//! │  │                                                       │
//! │  ├─ loader ───── 调度引擎 + 加载任务                      │
//! │  │   ├─ stream    网络 / 文件 / data / 资源目录           │
//! │  │   ├─ decoder   采样 + 解码 + 缩放 + EXIF               │
//! │  │   └─ delivery  回调投递线程                            │
//! │  │                                                       │
//! │  ├─ cache ────── LRU 内存缓存 + 文件磁盘缓存              │
//! │  └─ storage ──── 磁盘缓存目录 (返回 Result)               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 加载器级错误类型 `LoaderError`（配置、目录、运行时） |
//! | [`loader`] | 请求受理、调度、数据流、解码、投递 |
//! | [`cache`] | 内存缓存与磁盘缓存的 trait 及默认实现 |
//! | [`storage`] | 磁盘缓存目录的获取、自动创建与占用统计 |

pub mod cache;
pub mod error;
pub mod loader;
pub mod storage;

pub use error::LoaderError;
pub use loader::{
    DecodedBuffer, FailReason, FailType, ImageError, ImageLoader, ImageSize, LoadOptions, LoadRequest,
    LoaderComponents, LoaderConfig, LoadingListener,
};
