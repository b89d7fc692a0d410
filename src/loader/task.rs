//! # 加载任务
//!
//! ## 设计思路
//!
//! 一次缓存未命中的请求对应一个 `LoadAndDeliverTask`，在工作线程上按固定步骤推进：
//!
//! ```text
//! 暂停闸门 → 有效性检查 → 可选延迟 → 资源锁 → 内存缓存复查
//!   → 磁盘缓存 / 源地址 → 预处理 + 写内存缓存 → 后处理 → 释放锁 → 投递
//! ```
//!
//! 每个检查点都可能得出“任务已无意义”（消费端失效、已被新请求覆盖、引擎被停止），
//! 此时只触发取消回调，不再触发失败回调。
//!
//! ## 实现思路
//!
//! - 步骤内部用 `Result<_, TaskStop>` 串联，`?` 即提前终止
//! - 整个加载过程包在 `catch_unwind` 里，解码器等组件 panic 归为 `Unknown` 失败
//! - 投递阶段统一走 `deliver_result`，内存命中 + 后处理的快捷任务也复用它

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::cache::{DiskCache, MemoryCache};

use super::config::LoaderConfig;
use super::consumer::ConsumerHandle;
use super::decoder::{DecodingInfo, ImageDecoder};
use super::delivery::DeliveryContext;
use super::engine::{LoaderEngine, NetworkMode};
use super::error::{FailReason, FailType, ImageError};
use super::listener::{LoadingListener, ProgressListener};
use super::lock_table::KeyLockHandle;
use super::options::{BufferProcessor, ImageScaleType, LoadOptions};
use super::size::ViewScaleType;
use super::source::{DecodedBuffer, ImageSize, LoadedFrom, Scheme};
use super::stream::StreamProvider;

/// 三种网络状态各自使用的数据流提供者。
pub(crate) struct StreamProviders {
    pub normal: Arc<dyn StreamProvider>,
    pub denied: Arc<dyn StreamProvider>,
    pub degraded: Arc<dyn StreamProvider>,
}

impl StreamProviders {
    fn for_mode(&self, mode: NetworkMode) -> &Arc<dyn StreamProvider> {
        match mode {
            NetworkMode::Normal => &self.normal,
            NetworkMode::Denied => &self.denied,
            NetworkMode::Degraded => &self.degraded,
        }
    }
}

/// 所有任务共享的组件。
pub(crate) struct LoaderContext {
    pub config: Arc<LoaderConfig>,
    pub engine: Arc<LoaderEngine>,
    pub memory_cache: Arc<dyn MemoryCache>,
    pub disk_cache: Arc<dyn DiskCache>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub providers: StreamProviders,
    /// 写入磁盘缓存前对缩小后的缓冲做的处理。
    pub disk_cache_processor: Option<Arc<dyn BufferProcessor>>,
}

/// 单次加载的请求信息。
pub(crate) struct LoadingInfo {
    pub uri: String,
    pub cache_key: String,
    pub target_size: ImageSize,
    pub consumer: Arc<dyn ConsumerHandle>,
    pub options: Arc<LoadOptions>,
    pub listener: Arc<dyn LoadingListener>,
    pub progress: Option<Arc<dyn ProgressListener>>,
    pub delivery: Arc<dyn DeliveryContext>,
}

enum TaskStop {
    Cancelled,
    Failed(ImageError),
}

impl From<ImageError> for TaskStop {
    fn from(error: ImageError) -> Self {
        if error.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Failed(error)
        }
    }
}

type Loaded = (Option<Arc<DecodedBuffer>>, LoadedFrom);

/// 缓存未命中时的完整加载任务。
pub(crate) struct LoadAndDeliverTask {
    ctx: Arc<LoaderContext>,
    info: LoadingInfo,
    lock: KeyLockHandle,
    interrupted: Arc<AtomicBool>,
}

impl LoadAndDeliverTask {
    pub fn new(ctx: Arc<LoaderContext>, info: LoadingInfo) -> Self {
        let lock = ctx.engine.key_lock(&info.uri);
        let interrupted = ctx.engine.interrupt_flag();
        Self {
            ctx,
            info,
            lock,
            interrupted,
        }
    }

    pub fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.load()));
        let sync = self.info.options.synchronous;
        match outcome {
            Ok(Ok((buffer, loaded_from))) => {
                let Self { ctx, info, .. } = self;
                deliver_result(ctx.engine.clone(), info, buffer, loaded_from, sync);
            }
            Ok(Err(TaskStop::Cancelled)) => self.fire_cancel(),
            Ok(Err(TaskStop::Failed(error))) => self.fire_fail(error),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("❌ 加载任务 panic: {} ({})", message, self.info.cache_key);
                self.fire_fail(ImageError::Unknown(message));
            }
        }
    }

    fn load(&self) -> Result<Loaded, TaskStop> {
        if self.wait_if_paused() {
            return Err(TaskStop::Cancelled);
        }
        self.check_task_not_actual()?;

        if let Some(delay) = self.info.options.delay_before_loading.filter(|d| !d.is_zero()) {
            log::debug!("⏳ 延迟 {:?} 后加载 {}", delay, self.info.cache_key);
            thread::sleep(delay);
            self.check_interrupted()?;
            self.check_task_not_actual()?;
        }

        log::debug!("▶️ 开始加载 {}", self.info.cache_key);
        let _guard = match self.lock.try_lock() {
            Some(guard) => guard,
            None => {
                log::debug!("⏸️ 同一资源正在加载，等待 {}", self.info.cache_key);
                self.lock.lock()
            }
        };
        self.check_task_not_actual()?;

        let mut loaded_from = LoadedFrom::Network;
        let mut buffer = match self.ctx.memory_cache.get(&self.info.cache_key) {
            Some(cached) => {
                log::debug!("🎯 等待后命中内存缓存 {}", self.info.cache_key);
                loaded_from = LoadedFrom::MemoryCache;
                Some(cached)
            }
            None => {
                let decoded = self.try_load_buffer(&mut loaded_from)?;
                self.check_task_not_actual()?;
                self.check_interrupted()?;
                self.pre_process_and_cache(decoded)
            }
        };

        if let Some(post) = self.info.options.post_processor.as_ref() {
            if let Some(current) = buffer.take() {
                log::debug!("🔧 后处理 {}", self.info.cache_key);
                buffer = post.process(current);
                if buffer.is_none() {
                    log::error!("❌ 后处理器返回空结果 {}", self.info.cache_key);
                }
            }
        }

        self.check_task_not_actual()?;
        self.check_interrupted()?;
        Ok((buffer, loaded_from))
    }

    fn pre_process_and_cache(&self, decoded: Arc<DecodedBuffer>) -> Option<Arc<DecodedBuffer>> {
        let processed = match self.info.options.pre_processor.as_ref() {
            Some(pre) => {
                log::debug!("🔧 预处理 {}", self.info.cache_key);
                let processed = pre.process(decoded);
                if processed.is_none() {
                    log::error!("❌ 预处理器返回空结果 {}", self.info.cache_key);
                }
                processed
            }
            None => Some(decoded),
        };

        if let Some(buffer) = processed.as_ref() {
            if self.info.options.cache_in_memory {
                log::debug!("💾 写入内存缓存 {}", self.info.cache_key);
                self.ctx.memory_cache.put(&self.info.cache_key, Arc::clone(buffer));
            }
        }
        processed
    }

    fn try_load_buffer(&self, loaded_from: &mut LoadedFrom) -> Result<Arc<DecodedBuffer>, TaskStop> {
        if let Some(path) = self.ctx.disk_cache.get(&self.info.uri) {
            log::debug!("📂 从磁盘缓存加载 {}", self.info.cache_key);
            *loaded_from = LoadedFrom::DiskCache;
            self.check_task_not_actual()?;

            let file_uri = Scheme::File.wrap(&path.to_string_lossy());
            match self.decode(&file_uri) {
                Ok(buffer) if buffer.has_valid_dimensions() => return Ok(Arc::new(buffer)),
                Ok(_) => {
                    log::warn!("⚠️ 磁盘缓存解码结果尺寸为 0，改从源地址加载 {}", self.info.cache_key);
                }
                Err(e) => {
                    log::warn!("⚠️ 磁盘缓存解码失败，改从源地址加载 {}: {}", self.info.cache_key, e);
                    if e.fail_type() == FailType::DecodingError {
                        self.ctx.disk_cache.remove(&self.info.uri);
                    }
                }
            }
        }

        log::debug!("🌐 从源地址加载 {}", self.info.cache_key);
        *loaded_from = LoadedFrom::Network;
        self.check_interrupted()?;

        let mut uri_for_decoding = self.info.uri.clone();
        if self.info.options.cache_on_disk && self.try_cache_on_disk() {
            if let Some(path) = self.ctx.disk_cache.get(&self.info.uri) {
                uri_for_decoding = Scheme::File.wrap(&path.to_string_lossy());
            }
        }
        self.check_task_not_actual()?;

        let buffer = self.decode(&uri_for_decoding)?;
        if !buffer.has_valid_dimensions() {
            return Err(TaskStop::Failed(ImageError::Decode(format!(
                "解码结果尺寸无效：{}",
                buffer.size()
            ))));
        }
        Ok(Arc::new(buffer))
    }

    /// 下载源数据写入磁盘缓存；任何失败都只记日志，调用方改为直接解码源地址。
    fn try_cache_on_disk(&self) -> bool {
        log::debug!("💾 写入磁盘缓存 {}", self.info.cache_key);
        let saved = match self.download_to_disk() {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("⚠️ 写入磁盘缓存失败 {}: {}", self.info.cache_key, e);
                return false;
            }
        };

        if saved {
            if let Some(ceiling) = self.ctx.config.disk_cache_ceiling() {
                log::debug!("📐 按 {} 缩小磁盘缓存 {}", ceiling, self.info.cache_key);
                if let Err(e) = self.resize_and_save(ceiling) {
                    log::warn!("⚠️ 缩小磁盘缓存失败 {}: {}", self.info.cache_key, e);
                }
            }
        }
        saved
    }

    fn download_to_disk(&self) -> Result<bool, ImageError> {
        let stream = self
            .provider()
            .open(&self.info.uri, self.info.options.extra_for_provider.as_deref())?;
        self.ctx
            .disk_cache
            .save_stream(&self.info.uri, stream, &mut |current, total| self.on_bytes_copied(current, total))
    }

    fn resize_and_save(&self, ceiling: ImageSize) -> Result<bool, ImageError> {
        let Some(path) = self.ctx.disk_cache.get(&self.info.uri) else {
            return Ok(false);
        };
        let stream = self.provider().open(&Scheme::File.wrap(&path.to_string_lossy()), None)?;
        let info = DecodingInfo {
            cache_key: self.info.cache_key.clone(),
            target_size: ceiling,
            view_scale_type: ViewScaleType::FitInside,
            scale_type: ImageScaleType::Integer,
            consider_exif: self.info.options.consider_exif,
        };
        let mut buffer = Arc::new(self.ctx.decoder.decode(stream, &info)?);
        if let Some(processor) = self.ctx.disk_cache_processor.as_ref() {
            log::debug!("🔧 磁盘缓存处理 {}", self.info.cache_key);
            match processor.process(buffer) {
                Some(processed) => buffer = processed,
                None => {
                    log::error!("❌ 磁盘缓存处理器返回空结果 {}", self.info.cache_key);
                    return Ok(false);
                }
            }
        }
        self.ctx.disk_cache.save_buffer(&self.info.uri, &buffer)
    }

    fn on_bytes_copied(&self, current: u64, total: Option<u64>) -> bool {
        if self.info.options.synchronous {
            return true;
        }
        if self.is_interrupted() || self.is_task_not_actual() {
            return false;
        }
        if let Some(progress) = self.info.progress.as_ref() {
            let progress = Arc::clone(progress);
            let uri = self.info.uri.clone();
            self.info.delivery.post(Box::new(move || {
                progress.on_progress_update(&uri, current, total);
            }));
        }
        true
    }

    fn decode(&self, uri: &str) -> Result<DecodedBuffer, ImageError> {
        let stream = self
            .provider()
            .open(uri, self.info.options.extra_for_provider.as_deref())?;
        let info = DecodingInfo {
            cache_key: self.info.cache_key.clone(),
            target_size: self.info.target_size,
            view_scale_type: self.info.consumer.scale_type(),
            scale_type: self.info.options.scale_type,
            consider_exif: self.info.options.consider_exif,
        };
        self.ctx.decoder.decode(stream, &info)
    }

    fn provider(&self) -> &Arc<dyn StreamProvider> {
        self.ctx.providers.for_mode(self.ctx.engine.network_mode())
    }

    fn wait_if_paused(&self) -> bool {
        if self.ctx.engine.is_paused() {
            log::debug!("⏸️ 加载已暂停，等待恢复 {}", self.info.cache_key);
            if self.ctx.engine.wait_if_paused(&self.interrupted) {
                log::debug!("🛑 等待期间任务被中断 {}", self.info.cache_key);
                return true;
            }
            log::debug!("▶️ 加载已恢复 {}", self.info.cache_key);
        }
        self.is_interrupted()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn check_interrupted(&self) -> Result<(), TaskStop> {
        if self.is_interrupted() {
            log::debug!("🛑 任务被中断 {}", self.info.cache_key);
            return Err(TaskStop::Cancelled);
        }
        Ok(())
    }

    fn is_task_not_actual(&self) -> bool {
        !self.info.consumer.is_live()
            || !self
                .ctx
                .engine
                .is_associated(self.info.consumer.id(), &self.info.cache_key)
    }

    fn check_task_not_actual(&self) -> Result<(), TaskStop> {
        if !self.info.consumer.is_live() {
            log::debug!("🗑️ 消费端已失效，取消任务 {}", self.info.cache_key);
            return Err(TaskStop::Cancelled);
        }
        if !self
            .ctx
            .engine
            .is_associated(self.info.consumer.id(), &self.info.cache_key)
        {
            log::debug!("🔁 消费端已被新请求复用，取消任务 {}", self.info.cache_key);
            return Err(TaskStop::Cancelled);
        }
        Ok(())
    }

    fn fire_fail(&self, error: ImageError) {
        if self.is_interrupted() || self.is_task_not_actual() {
            self.fire_cancel();
            return;
        }
        log::warn!("❌ 加载失败 {}: {}", self.info.cache_key, error);

        let reason = FailReason::from_error(error);
        let consumer = Arc::clone(&self.info.consumer);
        let listener = Arc::clone(&self.info.listener);
        let engine = Arc::clone(&self.ctx.engine);
        let options = Arc::clone(&self.info.options);
        let uri = self.info.uri.clone();
        let cache_key = self.info.cache_key.clone();
        self.info.delivery.post(Box::new(move || {
            engine.complete_association(consumer.id(), &cache_key);
            if options.image_on_fail.is_some() {
                consumer.set_placeholder(options.image_on_fail.clone());
            }
            listener.on_loading_failed(&uri, &reason);
        }));
    }

    fn fire_cancel(&self) {
        let listener = Arc::clone(&self.info.listener);
        let uri = self.info.uri.clone();
        self.info.delivery.post(Box::new(move || listener.on_loading_cancelled(&uri)));
    }
}

/// 内存命中但需要后处理的请求。
pub(crate) struct ProcessAndDeliverTask {
    engine: Arc<LoaderEngine>,
    info: LoadingInfo,
    buffer: Arc<DecodedBuffer>,
}

impl ProcessAndDeliverTask {
    pub fn new(engine: Arc<LoaderEngine>, info: LoadingInfo, buffer: Arc<DecodedBuffer>) -> Self {
        Self { engine, info, buffer }
    }

    pub fn run(self) {
        let Self { engine, info, buffer } = self;
        log::debug!("🔧 内存命中后处理 {}", info.cache_key);

        let processed = match info.options.post_processor.as_ref() {
            Some(post) => {
                let post = Arc::clone(post);
                match panic::catch_unwind(AssertUnwindSafe(|| post.process(buffer))) {
                    Ok(processed) => processed,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        log::error!("❌ 后处理器 panic: {} ({})", message, info.cache_key);
                        None
                    }
                }
            }
            None => Some(buffer),
        };
        if processed.is_none() {
            log::error!("❌ 后处理器返回空结果 {}", info.cache_key);
        }

        let sync = info.options.synchronous;
        deliver_result(engine, info, processed, LoadedFrom::MemoryCache, sync);
    }
}

/// 投递阶段：在投递上下文中确认消费端仍然需要这个结果，再展示并回调。
pub(crate) fn deliver_result(
    engine: Arc<LoaderEngine>,
    info: LoadingInfo,
    buffer: Option<Arc<DecodedBuffer>>,
    loaded_from: LoadedFrom,
    sync: bool,
) {
    let delivery = Arc::clone(&info.delivery);
    let job = move || {
        let LoadingInfo {
            uri,
            cache_key,
            consumer,
            options,
            listener,
            ..
        } = info;

        if !consumer.is_live() {
            log::debug!("🗑️ 消费端已失效，放弃投递 {}", cache_key);
            listener.on_loading_cancelled(&uri);
            return;
        }
        if !engine.complete_association(consumer.id(), &cache_key) {
            log::debug!("🔁 消费端已被新请求复用，放弃投递 {}", cache_key);
            listener.on_loading_cancelled(&uri);
            return;
        }

        match buffer {
            Some(buffer) => {
                log::debug!("🖼️ 投递结果 [{}] {}", loaded_from.as_str(), cache_key);
                consumer.deliver(Arc::clone(&buffer), loaded_from);
                listener.on_loading_complete(&uri, Some(&buffer));
            }
            None => {
                if options.image_on_fail.is_some() {
                    consumer.set_placeholder(options.image_on_fail.clone());
                }
                listener.on_loading_failed(&uri, &FailReason::new(FailType::DecodingError, None));
            }
        }
    };

    if sync {
        job();
    } else {
        delivery.post(Box::new(job));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
