//! # 两级缓存
//!
//! ## 设计思路
//!
//! 核心流程只依赖 get / put / remove / clear 语义，淘汰策略由具体实现决定：
//! - 内存缓存：缓存键（资源标识 + 目标尺寸）→ 已解码缓冲
//! - 磁盘缓存：资源标识 → 本地文件
//!
//! 两个 trait 都要求实现自身保证并发安全，按资源加锁只用来避免重复拉取，
//! 不负责保护缓存结构本身。

mod disk;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use crate::loader::{DecodedBuffer, ImageError, SourceStream};

pub use disk::FileDiskCache;
pub use memory::{
    find_cached_keys_for_uri, remove_from_cache, DistinctUriMemoryCache, LruMemoryCache,
};

/// 内存缓存。
pub trait MemoryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<DecodedBuffer>>;

    /// 写入缓存；返回是否写入成功。
    fn put(&self, key: &str, buffer: Arc<DecodedBuffer>) -> bool;

    fn remove(&self, key: &str) -> Option<Arc<DecodedBuffer>>;

    fn keys(&self) -> Vec<String>;

    fn clear(&self);
}

/// 拷贝进度回调：`(已写入字节, 总字节)`，返回 `false` 请求中止。
pub type CopyListener<'a> = dyn FnMut(u64, Option<u64>) -> bool + 'a;

/// 磁盘缓存。
pub trait DiskCache: Send + Sync {
    /// 缓存根目录。
    fn directory(&self) -> PathBuf;

    /// 已缓存文件的路径；不存在时返回 `None`。
    fn get(&self, uri: &str) -> Option<PathBuf>;

    /// 将数据流写入缓存；被进度回调中止时返回 `Ok(false)`。
    fn save_stream(
        &self,
        uri: &str,
        stream: SourceStream,
        listener: &mut CopyListener<'_>,
    ) -> Result<bool, ImageError>;

    /// 将已解码缓冲编码后写入缓存。
    fn save_buffer(&self, uri: &str, buffer: &DecodedBuffer) -> Result<bool, ImageError>;

    fn remove(&self, uri: &str) -> bool;

    /// 关闭后缓存不再读写。
    fn close(&self);

    fn clear(&self);
}
