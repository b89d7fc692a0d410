//! 加载过程监听。所有回调都在投递上下文中执行。

use std::sync::Arc;

use super::error::FailReason;
use super::source::DecodedBuffer;

/// 加载生命周期回调；默认实现全部为空。
pub trait LoadingListener: Send + Sync {
    fn on_loading_started(&self, _uri: &str) {}

    /// `buffer` 为 `None` 仅出现在空资源标识的请求上。
    fn on_loading_complete(&self, _uri: &str, _buffer: Option<&Arc<DecodedBuffer>>) {}

    fn on_loading_failed(&self, _uri: &str, _reason: &FailReason) {}

    fn on_loading_cancelled(&self, _uri: &str) {}
}

/// 什么都不做的监听器。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl LoadingListener for NoopListener {}

/// 写入磁盘缓存的字节进度。
pub trait ProgressListener: Send + Sync {
    fn on_progress_update(&self, uri: &str, current: u64, total: Option<u64>);
}
