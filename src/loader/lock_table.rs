//! # 按资源加锁
//!
//! ## 设计思路
//!
//! 同一资源（不论目标尺寸）的拉取与解码必须串行，不同资源互不阻塞。
//! 锁表不能成为锁的唯一持有者，否则每个出现过的资源都会永久留下一把锁。
//!
//! ## 实现思路
//!
//! 引用计数句柄表：`handle_for` 命中则计数 +1，未命中则创建；
//! `KeyLockHandle` 被 drop 时计数 -1，归零即从表中移除。
//! 句柄在请求提交时取得，任务结束（任何退出路径）时随任务一起释放。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

#[derive(Default)]
struct Entry {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

#[derive(Default)]
struct TableInner {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TableInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 资源标识 → 互斥锁。
#[derive(Clone, Default)]
pub struct KeyLockTable {
    inner: Arc<TableInner>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得某个资源的锁句柄（不存在则创建）。
    pub fn handle_for(&self, uri: &str) -> KeyLockHandle {
        let mut entries = self.inner.entries();
        let entry = entries.entry(uri.to_string()).or_default();
        entry.holders += 1;
        KeyLockHandle {
            table: Arc::clone(&self.inner),
            uri: uri.to_string(),
            lock: Arc::clone(&entry.lock),
        }
    }

    /// 当前仍被引用的资源数量。
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 丢弃全部条目；仍在使用的句柄继续持有各自的锁，释放时不会影响新条目。
    pub fn clear(&self) {
        self.inner.entries().clear();
    }
}

impl fmt::Debug for KeyLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockTable").field("len", &self.len()).finish()
    }
}

/// 某个资源的锁句柄。
pub struct KeyLockHandle {
    table: Arc<TableInner>,
    uri: String,
    lock: Arc<Mutex<()>>,
}

impl KeyLockHandle {
    /// 阻塞直到拿到锁。锁中毒时直接接管（锁本身不保护数据）。
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 尝试立即加锁；被占用时返回 `None`。
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for KeyLockHandle {
    fn drop(&mut self) {
        let mut entries = self.table.entries();
        let remove = match entries.get_mut(&self.uri) {
            // clear() 之后可能已有同名新条目，只递减属于自己的那一个
            Some(entry) if Arc::ptr_eq(&entry.lock, &self.lock) => {
                entry.holders = entry.holders.saturating_sub(1);
                entry.holders == 0
            }
            _ => false,
        };
        if remove {
            entries.remove(&self.uri);
        }
    }
}

impl fmt::Debug for KeyLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockHandle").field("uri", &self.uri).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_uri_shares_one_lock() {
        let table = KeyLockTable::new();
        let a = table.handle_for("http://a");
        let b = table.handle_for("http://a");

        let guard = a.lock();
        assert!(b.try_lock().is_none());
        drop(guard);
        assert!(b.try_lock().is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn different_uris_do_not_block_each_other() {
        let table = KeyLockTable::new();
        let a = table.handle_for("http://a");
        let b = table.handle_for("http://b");

        let _guard = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn entries_are_evicted_when_last_handle_drops() {
        let table = KeyLockTable::new();
        let a = table.handle_for("http://a");
        let b = table.handle_for("http://a");
        drop(a);
        assert_eq!(table.len(), 1);
        drop(b);
        assert!(table.is_empty());
    }

    #[test]
    fn stale_handle_after_clear_leaves_new_entry_alone() {
        let table = KeyLockTable::new();
        let old = table.handle_for("http://a");
        table.clear();
        let fresh = table.handle_for("http://a");
        drop(old);
        assert_eq!(table.len(), 1);
        drop(fresh);
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_holders_are_serialized() {
        let table = KeyLockTable::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let handle = table.handle_for("http://same");
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                thread::spawn(move || {
                    let _guard = handle.lock();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }
}
