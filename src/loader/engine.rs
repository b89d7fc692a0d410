//! # 调度引擎
//!
//! ## 设计思路
//!
//! 引擎只负责“任务放到哪里跑”和共享状态，本身不做任何 I/O：
//! - 两个工作池：需要读磁盘/网络的任务池，磁盘缓存命中（或只需后处理）的任务池，
//!   后者不会排在慢速网络任务后面
//! - 分发池：先判断磁盘缓存是否存在，再决定投递到哪个工作池
//! - 暂停闸门、网络模式标记
//! - 消费端 → 期望缓存键的关联表（过期检测）与按资源加锁表
//!
//! ## 实现思路
//!
//! 自有工作池是只开阻塞线程的 tokio 运行时（任务通过 `spawn_blocking` 执行），
//! 阻塞线程上限即并发度，多出的任务排队。`stop` 时 `shutdown_background`
//! 丢弃排队任务并使正在执行的任务在下一个检查点发现中断；下次提交时按需重建。
//! 调用方自定义的执行器不归引擎管理，`stop` 不会关闭它们。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tokio::runtime::{Handle, Runtime};

use crate::cache::DiskCache;

use super::consumer::ConsumerId;
use super::lock_table::{KeyLockHandle, KeyLockTable};

/// 交给执行器运行的任务。
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 任务执行器；可由调用方提供以接入自有线程池。
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, job: Job);
}

/// 网络状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Normal,
    /// 禁止网络下载。
    Denied,
    /// 弱网。
    Degraded,
}

/// 基于 tokio 阻塞线程池的执行器。
struct BlockingPool {
    name: &'static str,
    threads: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl BlockingPool {
    fn new(name: &'static str, threads: usize) -> Self {
        Self {
            name,
            threads: threads.max(1),
            runtime: Mutex::new(None),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self) -> std::io::Result<Handle> {
        let mut runtime = self.runtime();
        if let Some(existing) = runtime.as_ref() {
            return Ok(existing.handle().clone());
        }

        let created = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.threads)
            .thread_name(self.name)
            .enable_time()
            .build()?;
        let handle = created.handle().clone();
        *runtime = Some(created);
        log::debug!("🧵 创建线程池 {}（{} 线程）", self.name, self.threads);
        Ok(handle)
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime().take() {
            runtime.shutdown_background();
            log::debug!("🛑 关闭线程池 {}", self.name);
        }
    }
}

impl Drop for BlockingPool {
    // 最后一个引用可能在池内线程上释放，不能阻塞等待线程退出
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TaskExecutor for BlockingPool {
    fn execute(&self, job: Job) {
        match self.handle() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(e) => {
                log::error!("❌ 线程池 {} 创建失败，任务改为就地执行：{}", self.name, e);
                job();
            }
        }
    }
}

enum Executor {
    Owned(BlockingPool),
    Custom(Arc<dyn TaskExecutor>),
}

impl Executor {
    fn execute(&self, job: Job) {
        match self {
            Self::Owned(pool) => pool.execute(job),
            Self::Custom(executor) => executor.execute(job),
        }
    }

    fn shutdown(&self) {
        if let Self::Owned(pool) = self {
            pool.shutdown();
        }
    }
}

/// 引擎的线程配置。
pub struct EngineExecutors {
    pub thread_pool_size: usize,
    pub cached_thread_pool_size: usize,
    pub distributor_pool_size: usize,
    pub task_executor: Option<Arc<dyn TaskExecutor>>,
    pub cached_task_executor: Option<Arc<dyn TaskExecutor>>,
}

/// 暂停闸门。
#[derive(Default)]
struct PauseGate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseGate {
    fn paused(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 调度引擎。
pub struct LoaderEngine {
    disk_cache: Arc<dyn DiskCache>,
    task_executor: Executor,
    cached_task_executor: Executor,
    distributor: BlockingPool,
    associations: Mutex<HashMap<ConsumerId, String>>,
    locks: KeyLockTable,
    pause: PauseGate,
    /// 当前这一代任务共享的中断标记；`stop` 时置位并换新。
    interrupt: Mutex<Arc<AtomicBool>>,
    network_denied: AtomicBool,
    slow_network: AtomicBool,
}

impl LoaderEngine {
    pub fn new(disk_cache: Arc<dyn DiskCache>, executors: EngineExecutors) -> Self {
        let task_executor = match executors.task_executor {
            Some(custom) => Executor::Custom(custom),
            None => Executor::Owned(BlockingPool::new("image-loader-task", executors.thread_pool_size)),
        };
        let cached_task_executor = match executors.cached_task_executor {
            Some(custom) => Executor::Custom(custom),
            None => Executor::Owned(BlockingPool::new(
                "image-loader-cached",
                executors.cached_thread_pool_size,
            )),
        };

        Self {
            disk_cache,
            task_executor,
            cached_task_executor,
            distributor: BlockingPool::new("image-loader-distributor", executors.distributor_pool_size),
            associations: Mutex::new(HashMap::new()),
            locks: KeyLockTable::new(),
            pause: PauseGate::default(),
            interrupt: Mutex::new(Arc::new(AtomicBool::new(false))),
            network_denied: AtomicBool::new(false),
            slow_network: AtomicBool::new(false),
        }
    }

    /// 提交需要加载的任务：磁盘缓存存在时进缓存池，否则进 I/O 池。
    pub fn submit(self: &Arc<Self>, uri: String, job: Job) {
        let engine = Arc::clone(self);
        self.distributor.execute(Box::new(move || {
            if engine.disk_cache.get(&uri).is_some() {
                engine.cached_task_executor.execute(job);
            } else {
                engine.task_executor.execute(job);
            }
        }));
    }

    /// 提交已知内存命中、只需后处理的任务。
    pub fn submit_cache_hit(&self, job: Job) {
        self.cached_task_executor.execute(job);
    }

    fn associations(&self) -> MutexGuard<'_, HashMap<ConsumerId, String>> {
        self.associations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 记录消费端当前期望的缓存键（覆盖旧记录）。
    pub fn associate(&self, consumer: ConsumerId, cache_key: String) {
        self.associations().insert(consumer, cache_key);
    }

    pub fn is_associated(&self, consumer: ConsumerId, cache_key: &str) -> bool {
        self.associations()
            .get(&consumer)
            .is_some_and(|expected| expected == cache_key)
    }

    /// 关联仍匹配时移除并返回 `true`；已被新请求覆盖时保持不动并返回 `false`。
    pub fn complete_association(&self, consumer: ConsumerId, cache_key: &str) -> bool {
        let mut associations = self.associations();
        if associations.get(&consumer).is_some_and(|expected| expected == cache_key) {
            associations.remove(&consumer);
            return true;
        }
        false
    }

    pub fn cancel_association(&self, consumer: ConsumerId) {
        self.associations().remove(&consumer);
    }

    pub fn loading_key_for(&self, consumer: ConsumerId) -> Option<String> {
        self.associations().get(&consumer).cloned()
    }

    pub fn key_lock(&self, uri: &str) -> KeyLockHandle {
        self.locks.handle_for(uri)
    }

    pub fn pause(&self) {
        *self.pause.paused() = true;
    }

    pub fn resume(&self) {
        *self.pause.paused() = false;
        self.pause.condvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.paused()
    }

    /// 暂停时阻塞直到恢复或被中断；返回是否被中断。
    pub fn wait_if_paused(&self, interrupted: &AtomicBool) -> bool {
        let mut paused = self.pause.paused();
        while *paused && !interrupted.load(Ordering::Acquire) {
            paused = self
                .pause
                .condvar
                .wait(paused)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        interrupted.load(Ordering::Acquire)
    }

    /// 新任务应持有的中断标记。
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn set_network_mode(&self, mode: NetworkMode) {
        self.network_denied.store(mode == NetworkMode::Denied, Ordering::Release);
        self.slow_network.store(mode == NetworkMode::Degraded, Ordering::Release);
    }

    pub fn deny_network_downloads(&self, deny: bool) {
        self.network_denied.store(deny, Ordering::Release);
    }

    pub fn handle_slow_network(&self, slow: bool) {
        self.slow_network.store(slow, Ordering::Release);
    }

    /// 网络被禁优先于弱网。
    pub fn network_mode(&self) -> NetworkMode {
        if self.network_denied.load(Ordering::Acquire) {
            NetworkMode::Denied
        } else if self.slow_network.load(Ordering::Acquire) {
            NetworkMode::Degraded
        } else {
            NetworkMode::Normal
        }
    }

    /// 中断当前所有任务，关闭自有线程池，清空关联表与锁表。
    pub fn stop(&self) {
        {
            let mut interrupt = self.interrupt.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            interrupt.store(true, Ordering::Release);
            *interrupt = Arc::new(AtomicBool::new(false));
        }

        // 持锁通知，避免与 wait_if_paused 的检查之间丢失唤醒
        {
            let _paused = self.pause.paused();
            self.pause.condvar.notify_all();
        }

        self.distributor.shutdown();
        self.task_executor.shutdown();
        self.cached_task_executor.shutdown();

        self.associations().clear();
        self.locks.clear();
        log::info!("🛑 加载引擎已停止");
    }
}

impl fmt::Debug for LoaderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderEngine")
            .field("paused", &self.is_paused())
            .field("network_mode", &self.network_mode())
            .field("associations", &self.associations().len())
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileDiskCache;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn engine(dir: &std::path::Path) -> Arc<LoaderEngine> {
        let disk_cache = Arc::new(FileDiskCache::new(dir, 0).expect("create disk cache"));
        Arc::new(LoaderEngine::new(
            disk_cache,
            EngineExecutors {
                thread_pool_size: 2,
                cached_thread_pool_size: 2,
                distributor_pool_size: 1,
                task_executor: None,
                cached_task_executor: None,
            },
        ))
    }

    #[test]
    fn association_is_overwritten_by_newer_request() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        let consumer = ConsumerId::from_raw(7);

        engine.associate(consumer, "a_1x1".to_string());
        engine.associate(consumer, "b_1x1".to_string());

        assert!(!engine.is_associated(consumer, "a_1x1"));
        assert!(!engine.complete_association(consumer, "a_1x1"));
        assert!(engine.complete_association(consumer, "b_1x1"));
        assert_eq!(engine.loading_key_for(consumer), None);
    }

    #[test]
    fn submitted_jobs_run_on_worker_threads() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        let (tx, rx) = mpsc::channel();

        engine.submit("http://host/a.png".to_string(), Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).expect("send");
        }));

        let name = rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        assert_eq!(name.as_deref(), Some("image-loader-task"));
    }

    #[test]
    fn pause_gate_blocks_until_resume() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        engine.pause();

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&engine);
        let flag = engine.interrupt_flag();
        let worker = thread::spawn(move || {
            let interrupted = waiter.wait_if_paused(&flag);
            tx.send(interrupted).expect("send");
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        engine.resume();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(false));
        worker.join().expect("worker panicked");
    }

    #[test]
    fn stop_interrupts_paused_waiters() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        engine.pause();

        let flag = engine.interrupt_flag();
        let waiter = Arc::clone(&engine);
        let worker = thread::spawn(move || waiter.wait_if_paused(&flag));

        thread::sleep(Duration::from_millis(50));
        engine.stop();
        assert!(worker.join().expect("worker panicked"));
        assert!(!engine.interrupt_flag().load(Ordering::Acquire));
    }

    #[test]
    fn owned_pools_are_recreated_after_stop() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        engine.stop();

        let (tx, rx) = mpsc::channel();
        engine.submit_cache_hit(Box::new(move || tx.send(()).expect("send")));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn denied_mode_wins_over_degraded() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = engine(dir.path());
        engine.handle_slow_network(true);
        assert_eq!(engine.network_mode(), NetworkMode::Degraded);
        engine.deny_network_downloads(true);
        assert_eq!(engine.network_mode(), NetworkMode::Denied);
        engine.set_network_mode(NetworkMode::Normal);
        assert_eq!(engine.network_mode(), NetworkMode::Normal);
    }
}
