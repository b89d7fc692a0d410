//! # 回调投递上下文
//!
//! ## 设计思路
//!
//! 结果展示与监听回调不能在工作线程里直接执行：宿主往往要求“只在某个线程上改展示状态”。
//! `DeliveryContext` 就是“把这段代码放到线程 X 上跑”的抽象，具体线程由宿主决定。
//!
//! ## 实现思路
//!
//! - `ImmediateDelivery`：就地执行（同步请求、测试）
//! - `DeliveryQueue`：投递到队列，由宿主在自己的线程里调用 `run_pending` 消费
//! - `DeliveryThread`：独立的单线程投递器，加载器未指定上下文时的默认值

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// 投递到上下文执行的任务。
pub type DeliveryJob = Box<dyn FnOnce() + Send + 'static>;

/// “在指定线程上执行”的原语。
pub trait DeliveryContext: Send + Sync {
    fn post(&self, job: DeliveryJob);
}

/// 在调用线程上立即执行。
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDelivery;

impl DeliveryContext for ImmediateDelivery {
    fn post(&self, job: DeliveryJob) {
        job();
    }
}

/// 由宿主线程主动消费的投递队列。
pub struct DeliveryQueue {
    sender: Sender<DeliveryJob>,
    receiver: Mutex<Receiver<DeliveryJob>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// 执行当前已排队的全部任务，返回执行数量。
    pub fn run_pending(&self) -> usize {
        let receiver = self.receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut executed = 0;
        while let Ok(job) = receiver.try_recv() {
            job();
            executed += 1;
        }
        executed
    }

    /// 在 `timeout` 内持续消费，直到 `done` 返回真；返回 `done` 的最终结果。
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let receiver = self.receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return done();
            }
            match receiver.recv_timeout(remaining) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => return done(),
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryContext for DeliveryQueue {
    fn post(&self, job: DeliveryJob) {
        if self.sender.send(job).is_err() {
            log::warn!("⚠️ 投递队列已关闭，丢弃回调");
        }
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue").finish_non_exhaustive()
    }
}

/// 独立的单线程投递器。
///
/// 单个回调 panic 不会终止投递线程。
pub struct DeliveryThread {
    sender: Sender<DeliveryJob>,
}

impl DeliveryThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<DeliveryJob>();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in receiver {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("❌ 投递回调发生 panic");
                }
            }
            log::debug!("投递线程退出");
        })?;
        Ok(Self { sender })
    }
}

impl DeliveryContext for DeliveryThread {
    fn post(&self, job: DeliveryJob) {
        if self.sender.send(job).is_err() {
            log::warn!("⚠️ 投递线程已退出，丢弃回调");
        }
    }
}

impl fmt::Debug for DeliveryThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryThread").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn queue_runs_jobs_only_when_pumped() {
        let queue = DeliveryQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            queue.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delivery_thread_survives_panicking_job() {
        let delivery = DeliveryThread::spawn("delivery-test").expect("spawn delivery thread");
        let (tx, rx) = mpsc::channel();
        delivery.post(Box::new(|| panic!("boom")));
        delivery.post(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).expect("send name");
        }));

        let name = rx.recv_timeout(Duration::from_secs(2)).expect("second job ran");
        assert_eq!(name.as_deref(), Some("delivery-test"));
    }

    #[test]
    fn immediate_delivery_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&ran);
        ImmediateDelivery.post(Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
