//! # 内存缓存
//!
//! ## 实现思路
//!
//! - `LruMemoryCache`：`lru::LruCache` 不限条目数，按缓冲字节数统计总量，
//!   超出预算时从最久未使用端逐个淘汰。
//! - `DistinctUriMemoryCache`：包装任意内存缓存，同一资源只保留最近写入的一个尺寸。

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use super::MemoryCache;
use crate::loader::DecodedBuffer;

struct LruState {
    entries: LruCache<String, Arc<DecodedBuffer>>,
    size: usize,
}

/// 按字节预算淘汰的 LRU 内存缓存。
pub struct LruMemoryCache {
    max_size: usize,
    state: Mutex<LruState>,
}

impl LruMemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    /// 当前占用字节数。
    pub fn size(&self) -> usize {
        self.state().size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn state(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn trim_to_size(state: &mut LruState, max_size: usize) {
        while state.size > max_size {
            let Some((key, evicted)) = state.entries.pop_lru() else {
                break;
            };
            state.size = state.size.saturating_sub(evicted.byte_size());
            log::debug!("🧹 内存缓存淘汰 [{}]", key);
        }
    }
}

impl MemoryCache for LruMemoryCache {
    fn get(&self, key: &str) -> Option<Arc<DecodedBuffer>> {
        let mut state = self.state();
        let buffer = state.entries.get(key).cloned()?;
        if buffer.is_recycled() {
            if let Some(removed) = state.entries.pop(key) {
                state.size = state.size.saturating_sub(removed.byte_size());
            }
            return None;
        }
        Some(buffer)
    }

    fn put(&self, key: &str, buffer: Arc<DecodedBuffer>) -> bool {
        let incoming = buffer.byte_size();
        if incoming > self.max_size {
            log::warn!(
                "⚠️ 缓冲超过内存缓存容量，跳过缓存 [{}]（{} > {} 字节）",
                key,
                incoming,
                self.max_size
            );
            return false;
        }

        let mut state = self.state();
        state.size += incoming;
        if let Some(previous) = state.entries.put(key.to_string(), buffer) {
            state.size = state.size.saturating_sub(previous.byte_size());
        }
        Self::trim_to_size(&mut state, self.max_size);
        true
    }

    fn remove(&self, key: &str) -> Option<Arc<DecodedBuffer>> {
        let mut state = self.state();
        let removed = state.entries.pop(key)?;
        state.size = state.size.saturating_sub(removed.byte_size());
        Some(removed)
    }

    fn keys(&self) -> Vec<String> {
        self.state().entries.iter().map(|(key, _)| key.clone()).collect()
    }

    fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.size = 0;
    }
}

/// 同一资源只保留一个尺寸的内存缓存包装。
pub struct DistinctUriMemoryCache<C: MemoryCache> {
    inner: C,
    // put 的“先删同资源再写入”需要整体原子
    put_lock: Mutex<()>,
}

impl<C: MemoryCache> DistinctUriMemoryCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            put_lock: Mutex::new(()),
        }
    }
}

impl<C: MemoryCache> MemoryCache for DistinctUriMemoryCache<C> {
    fn get(&self, key: &str) -> Option<Arc<DecodedBuffer>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, buffer: Arc<DecodedBuffer>) -> bool {
        let _guard = self.put_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(uri) = uri_of_key(key) {
            for existing in find_cached_keys_for_uri(uri, &self.inner) {
                if existing != key {
                    self.inner.remove(&existing);
                }
            }
        }
        self.inner.put(key, buffer)
    }

    fn remove(&self, key: &str) -> Option<Arc<DecodedBuffer>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// 从缓存键 `{uri}_{w}x{h}` 中取出资源标识部分。
fn uri_of_key(key: &str) -> Option<&str> {
    let (uri, size) = key.rsplit_once('_')?;
    is_size_suffix(size).then_some(uri)
}

fn is_size_suffix(text: &str) -> bool {
    let Some((width, height)) = text.split_once('x') else {
        return false;
    };
    let numeric = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    numeric(width) && numeric(height)
}

/// 查找某个资源在内存缓存中的所有尺寸对应的键。
pub fn find_cached_keys_for_uri(uri: &str, cache: &dyn MemoryCache) -> Vec<String> {
    cache
        .keys()
        .into_iter()
        .filter(|key| {
            key.strip_prefix(uri)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(is_size_suffix)
        })
        .collect()
}

/// 移除某个资源在内存缓存中的所有尺寸。
pub fn remove_from_cache(uri: &str, cache: &dyn MemoryCache) -> usize {
    let keys = find_cached_keys_for_uri(uri, cache);
    for key in &keys {
        cache.remove(key);
    }
    keys.len()
}
