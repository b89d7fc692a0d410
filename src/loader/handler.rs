//! # 加载器门面
//!
//! ## 设计思路
//!
//! `ImageLoader` 是对外的唯一入口，持有缓存、解码器、数据流提供者与调度引擎。
//! 请求是“资源标识 + 消费端 + 选项 + 监听器”，结果通过投递上下文回到消费端。
//!
//! 组件全部可替换：`LoaderComponents` 中留空的部分使用默认实现，
//! 测试和宿主可以只注入自己关心的那一个。
//!
//! ## 实现思路
//!
//! - 空资源标识：直接展示空图占位并回调完成（缓冲为空）
//! - 内存命中：无后处理时直接投递；有后处理时交给缓存池跑 `ProcessAndDeliverTask`
//! - 未命中：展示加载占位，提交 `LoadAndDeliverTask`；同步请求在调用线程上执行
//! - 同步加载复用同一条链路，只是把投递上下文换成就地执行，并用监听器收集结果

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{
    remove_from_cache, DiskCache, DistinctUriMemoryCache, FileDiskCache, LruMemoryCache, MemoryCache,
};
use crate::error::LoaderError;
use crate::storage::{self, StorageInfo};

use super::config::LoaderConfig;
use super::consumer::{ConsumerHandle, DetachedHandle, Surface, SurfaceHandle};
use super::decoder::{BaseImageDecoder, ImageDecoder};
use super::delivery::{DeliveryContext, DeliveryThread, ImmediateDelivery};
use super::engine::{EngineExecutors, LoaderEngine, NetworkMode, TaskExecutor};
use super::error::{FailReason, ImageError};
use super::listener::{LoadingListener, NoopListener, ProgressListener};
use super::options::{BufferProcessor, LoadOptions};
use super::size::{define_target_size, generate_key, ViewScaleType};
use super::source::{DecodedBuffer, ImageSize, LoadedFrom};
use super::stream::{
    BaseStreamProvider, NetworkDeniedStreamProvider, SlowNetworkStreamProvider, StreamProvider,
};
use super::task::{deliver_result, LoadAndDeliverTask, LoaderContext, LoadingInfo, ProcessAndDeliverTask, StreamProviders};

const DELIVERY_THREAD_NAME: &str = "image-loader-delivery";

/// 可替换的组件；留空的使用默认实现。
#[derive(Default)]
pub struct LoaderComponents {
    pub memory_cache: Option<Arc<dyn MemoryCache>>,
    pub disk_cache: Option<Arc<dyn DiskCache>>,
    pub decoder: Option<Arc<dyn ImageDecoder>>,
    /// 正常网络状态下的提供者；禁网与弱网包装都基于它。
    pub stream_provider: Option<Arc<dyn StreamProvider>>,
    /// 默认投递上下文；留空时启动独立投递线程。
    pub delivery: Option<Arc<dyn DeliveryContext>>,
    pub task_executor: Option<Arc<dyn TaskExecutor>>,
    pub cached_task_executor: Option<Arc<dyn TaskExecutor>>,
    pub disk_cache_processor: Option<Arc<dyn BufferProcessor>>,
    pub default_options: Option<LoadOptions>,
}

/// 一次加载请求。
pub struct LoadRequest {
    uri: String,
    consumer: Arc<dyn ConsumerHandle>,
    options: Option<Arc<LoadOptions>>,
    target_size: Option<ImageSize>,
    listener: Option<Arc<dyn LoadingListener>>,
    progress: Option<Arc<dyn ProgressListener>>,
}

impl LoadRequest {
    pub fn new(uri: impl Into<String>, consumer: Arc<dyn ConsumerHandle>) -> Self {
        Self {
            uri: uri.into(),
            consumer,
            options: None,
            target_size: None,
            listener: None,
            progress: None,
        }
    }

    pub fn with_options(mut self, options: Arc<LoadOptions>) -> Self {
        self.options = Some(options);
        self
    }

    /// 覆盖由消费端推导出的目标尺寸。
    pub fn with_target_size(mut self, size: ImageSize) -> Self {
        self.target_size = Some(size);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn LoadingListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// 图片加载器。
pub struct ImageLoader {
    ctx: Arc<LoaderContext>,
    default_options: Arc<LoadOptions>,
    default_delivery: Arc<dyn DeliveryContext>,
    destroyed: AtomicBool,
}

impl ImageLoader {
    /// 使用默认组件创建加载器。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use image_loader::{ImageLoader, LoaderConfig};
    ///
    /// let loader = ImageLoader::new(LoaderConfig::default())?;
    /// # Ok::<(), image_loader::LoaderError>(())
    /// ```
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        Self::with_components(config, LoaderComponents::default())
    }

    /// 使用自定义组件创建加载器。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use image_loader::{ImageLoader, LoaderComponents, LoaderConfig};
    /// use image_loader::loader::DeliveryQueue;
    ///
    /// let queue = Arc::new(DeliveryQueue::new());
    /// let components = LoaderComponents {
    ///     delivery: Some(queue.clone()),
    ///     ..LoaderComponents::default()
    /// };
    /// let loader = ImageLoader::with_components(LoaderConfig::default(), components)?;
    /// # Ok::<(), image_loader::LoaderError>(())
    /// ```
    pub fn with_components(config: LoaderConfig, components: LoaderComponents) -> Result<Self, LoaderError> {
        config.validate()?;
        let config = Arc::new(config);

        let memory_cache = match components.memory_cache {
            Some(cache) => cache,
            None => default_memory_cache(&config),
        };
        let disk_cache: Arc<dyn DiskCache> = match components.disk_cache {
            Some(cache) => cache,
            None => {
                let dir = storage::resolve_cache_dir(config.disk_cache_dir.as_deref())?;
                Arc::new(FileDiskCache::new(dir, config.disk_cache_size)?)
            }
        };
        let decoder: Arc<dyn ImageDecoder> = match components.decoder {
            Some(decoder) => decoder,
            None => Arc::new(BaseImageDecoder::new(&config)),
        };
        let (normal, degraded): (Arc<dyn StreamProvider>, Arc<dyn StreamProvider>) =
            match components.stream_provider {
                Some(provider) => {
                    let degraded = SlowNetworkStreamProvider::new(Arc::clone(&provider), config.max_file_size);
                    (provider, Arc::new(degraded))
                }
                None => (
                    Arc::new(BaseStreamProvider::new(&config)),
                    Arc::new(SlowNetworkStreamProvider::with_relaxed_network(&config)),
                ),
            };
        let providers = StreamProviders {
            denied: Arc::new(NetworkDeniedStreamProvider::new(Arc::clone(&normal))),
            degraded,
            normal,
        };
        let default_delivery: Arc<dyn DeliveryContext> = match components.delivery {
            Some(delivery) => delivery,
            None => Arc::new(
                DeliveryThread::spawn(DELIVERY_THREAD_NAME)
                    .map_err(|e| LoaderError::Runtime(format!("启动投递线程失败: {}", e)))?,
            ),
        };

        let engine = Arc::new(LoaderEngine::new(
            Arc::clone(&disk_cache),
            EngineExecutors {
                thread_pool_size: config.thread_pool_size,
                cached_thread_pool_size: config.cached_thread_pool_size,
                distributor_pool_size: config.distributor_pool_size,
                task_executor: components.task_executor,
                cached_task_executor: components.cached_task_executor,
            },
        ));

        log::info!(
            "🚀 ImageLoader 初始化完成：工作线程 {}，缓存线程 {}，内存缓存 {} 字节，磁盘缓存 {}",
            config.thread_pool_size,
            config.cached_thread_pool_size,
            config.memory_cache_size,
            disk_cache.directory().display()
        );

        Ok(Self {
            ctx: Arc::new(LoaderContext {
                config,
                engine,
                memory_cache,
                disk_cache,
                decoder,
                providers,
                disk_cache_processor: components.disk_cache_processor,
            }),
            default_options: Arc::new(components.default_options.unwrap_or_default()),
            default_delivery,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.ctx.config
    }

    /// 提交一次加载请求。
    ///
    /// 内存命中也不会在调用线程上直接交给消费者：结果与关联校验一起投递到
    /// `DeliveryContext`，宿主需要驱动投递上下文后才能看到图片。
    /// 同步请求（`LoadOptions::synchronous`）例外，命中时在返回前完成投递。
    pub fn request(&self, request: LoadRequest) {
        let LoadRequest {
            uri,
            consumer,
            options,
            target_size,
            listener,
            progress,
        } = request;
        let options = options.unwrap_or_else(|| Arc::clone(&self.default_options));
        let listener: Arc<dyn LoadingListener> = listener.unwrap_or_else(|| Arc::new(NoopListener));
        let delivery: Arc<dyn DeliveryContext> = if options.synchronous {
            Arc::new(ImmediateDelivery)
        } else {
            options
                .delivery
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.default_delivery))
        };

        if self.destroyed.load(Ordering::Acquire) {
            log::error!("❌ 加载器已销毁，拒绝请求 {}", uri);
            let reason = FailReason::from_error(ImageError::Unknown("加载器已销毁".to_string()));
            delivery.post(Box::new(move || listener.on_loading_failed(&uri, &reason)));
            return;
        }

        let engine = &self.ctx.engine;
        if uri.trim().is_empty() {
            engine.cancel_association(consumer.id());
            delivery.post(Box::new(move || {
                listener.on_loading_started(&uri);
                consumer.set_placeholder(options.image_for_empty_uri.clone());
                listener.on_loading_complete(&uri, None);
            }));
            return;
        }

        let target_size = target_size
            .unwrap_or_else(|| define_target_size(consumer.as_ref(), self.ctx.config.fallback_target_size()));
        let cache_key = generate_key(&uri, target_size);
        engine.associate(consumer.id(), cache_key.clone());

        {
            let listener = Arc::clone(&listener);
            let uri = uri.clone();
            delivery.post(Box::new(move || listener.on_loading_started(&uri)));
        }

        let sync = options.synchronous;
        let info = LoadingInfo {
            uri,
            cache_key,
            target_size,
            consumer,
            options,
            listener,
            progress,
            delivery,
        };

        if let Some(buffer) = self.ctx.memory_cache.get(&info.cache_key) {
            log::debug!("🎯 命中内存缓存 {}", info.cache_key);
            if info.options.should_post_process() {
                let task = ProcessAndDeliverTask::new(Arc::clone(engine), info, buffer);
                if sync {
                    task.run();
                } else {
                    engine.submit_cache_hit(Box::new(move || task.run()));
                }
            } else {
                deliver_result(Arc::clone(engine), info, Some(buffer), LoadedFrom::MemoryCache, sync);
            }
            return;
        }

        let placeholder = if info.options.image_on_loading.is_some() {
            Some(info.options.image_on_loading.clone())
        } else if info.options.reset_before_loading {
            Some(None)
        } else {
            None
        };
        if let Some(placeholder) = placeholder {
            let consumer = Arc::clone(&info.consumer);
            info.delivery.post(Box::new(move || {
                consumer.set_placeholder(placeholder);
            }));
        }

        let uri = info.uri.clone();
        let task = LoadAndDeliverTask::new(Arc::clone(&self.ctx), info);
        if sync {
            task.run();
        } else {
            engine.submit(uri, Box::new(move || task.run()));
        }
    }

    /// 把图片加载到宿主的展示目标上。
    pub fn display<S: Surface + 'static>(
        &self,
        uri: &str,
        surface: &Arc<S>,
        options: Option<Arc<LoadOptions>>,
        listener: Option<Arc<dyn LoadingListener>>,
    ) {
        let mut request = LoadRequest::new(uri, Arc::new(SurfaceHandle::new(surface)));
        if let Some(options) = options {
            request = request.with_options(options);
        }
        if let Some(listener) = listener {
            request = request.with_listener(listener);
        }
        self.request(request);
    }

    /// 没有展示目标的加载：结果只通过监听器返回。
    ///
    /// 未指定尺寸时使用配置的最大尺寸。
    pub fn load_image(
        &self,
        uri: &str,
        target_size: Option<ImageSize>,
        options: Option<Arc<LoadOptions>>,
        listener: Arc<dyn LoadingListener>,
    ) {
        let size = target_size.unwrap_or_else(|| self.ctx.config.fallback_target_size());
        let consumer = Arc::new(DetachedHandle::new(size, ViewScaleType::Crop));
        let mut request = LoadRequest::new(uri, consumer)
            .with_target_size(size)
            .with_listener(listener);
        if let Some(options) = options {
            request = request.with_options(options);
        }
        self.request(request);
    }

    /// 在调用线程上完成加载并返回结果。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use image_loader::{ImageLoader, ImageSize, LoaderConfig};
    ///
    /// let loader = ImageLoader::new(LoaderConfig::default())?;
    /// let buffer = loader.load_image_sync("file:///tmp/a.png", Some(ImageSize::new(64, 64)), None)?;
    /// println!("{}x{}", buffer.width(), buffer.height());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load_image_sync(
        &self,
        uri: &str,
        target_size: Option<ImageSize>,
        options: Option<&LoadOptions>,
    ) -> Result<Arc<DecodedBuffer>, ImageError> {
        let mut options = options.cloned().unwrap_or_else(|| (*self.default_options).clone());
        options.synchronous = true;

        let collector = Arc::new(SyncResultListener::default());
        self.load_image(uri, target_size, Some(Arc::new(options)), collector.clone());
        collector.take()
    }

    /// 取消消费端当前的请求；已在执行的任务会在下一个检查点放弃。
    pub fn cancel(&self, consumer: &dyn ConsumerHandle) {
        self.ctx.engine.cancel_association(consumer.id());
    }

    /// 消费端当前期望的缓存键。
    pub fn loading_key_for(&self, consumer: &dyn ConsumerHandle) -> Option<String> {
        self.ctx.engine.loading_key_for(consumer.id())
    }

    pub fn pause(&self) {
        self.ctx.engine.pause();
    }

    pub fn resume(&self) {
        self.ctx.engine.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.engine.is_paused()
    }

    /// 中断全部任务；之后仍可继续提交新请求。
    pub fn stop(&self) {
        self.ctx.engine.stop();
    }

    /// 停止并关闭磁盘缓存；之后的请求直接以失败回调。
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.engine.stop();
        self.ctx.disk_cache.close();
        log::info!("🗑️ ImageLoader 已销毁");
    }

    pub fn set_network_mode(&self, mode: NetworkMode) {
        self.ctx.engine.set_network_mode(mode);
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.ctx.engine.network_mode()
    }

    pub fn deny_network_downloads(&self, deny: bool) {
        self.ctx.engine.deny_network_downloads(deny);
    }

    pub fn handle_slow_network(&self, slow: bool) {
        self.ctx.engine.handle_slow_network(slow);
    }

    pub fn memory_cache(&self) -> &Arc<dyn MemoryCache> {
        &self.ctx.memory_cache
    }

    pub fn disk_cache(&self) -> &Arc<dyn DiskCache> {
        &self.ctx.disk_cache
    }

    pub fn clear_memory_cache(&self) {
        self.ctx.memory_cache.clear();
    }

    pub fn clear_disk_cache(&self) {
        self.ctx.disk_cache.clear();
    }

    /// 从内存（全部尺寸）与磁盘缓存中移除一个资源；返回移除的内存条目数。
    pub fn remove(&self, uri: &str) -> usize {
        let removed = remove_from_cache(uri, self.ctx.memory_cache.as_ref());
        self.ctx.disk_cache.remove(uri);
        removed
    }

    pub fn disk_cache_dir(&self) -> PathBuf {
        self.ctx.disk_cache.directory()
    }

    pub fn disk_cache_info(&self) -> Result<StorageInfo, LoaderError> {
        storage::cache_dir_info(&self.ctx.disk_cache.directory())
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn default_memory_cache(config: &LoaderConfig) -> Arc<dyn MemoryCache> {
    let lru = LruMemoryCache::new(config.memory_cache_size);
    if config.deny_cache_multiple_sizes_in_memory {
        Arc::new(DistinctUriMemoryCache::new(lru))
    } else {
        Arc::new(lru)
    }
}

/// 同步加载时收集结果的监听器。
#[derive(Default)]
struct SyncResultListener {
    result: Mutex<Option<Result<Arc<DecodedBuffer>, ImageError>>>,
}

impl SyncResultListener {
    fn set(&self, result: Result<Arc<DecodedBuffer>, ImageError>) {
        *self.result.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
    }

    fn take(&self) -> Result<Arc<DecodedBuffer>, ImageError> {
        self.result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .unwrap_or_else(|| Err(ImageError::Unknown("同步加载没有产生结果".to_string())))
    }
}

impl LoadingListener for SyncResultListener {
    fn on_loading_complete(&self, _uri: &str, buffer: Option<&Arc<DecodedBuffer>>) {
        match buffer {
            Some(buffer) => self.set(Ok(Arc::clone(buffer))),
            None => self.set(Err(ImageError::InvalidFormat("资源标识为空".to_string()))),
        }
    }

    fn on_loading_failed(&self, _uri: &str, reason: &FailReason) {
        let error = match reason.cause.as_deref() {
            Some(cause) => cause.clone(),
            None => ImageError::Decode(reason.to_string()),
        };
        self.set(Err(error));
    }

    fn on_loading_cancelled(&self, uri: &str) {
        self.set(Err(ImageError::Cancelled(uri.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DeliveryQueue;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    use crate::loader::SourceStream;

    struct PngProvider {
        opened: AtomicUsize,
    }

    impl StreamProvider for PngProvider {
        fn open(&self, _uri: &str, _extra: Option<&str>) -> Result<SourceStream, ImageError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let image = image::RgbaImage::from_pixel(32, 16, image::Rgba([10, 20, 30, 255]));
            let mut bytes = Vec::new();
            image::DynamicImage::ImageRgba8(image)
                .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .map_err(ImageError::from)?;
            Ok(SourceStream::from_bytes(bytes))
        }
    }

    fn loader(dir: &std::path::Path, provider: Arc<PngProvider>, delivery: Arc<DeliveryQueue>) -> ImageLoader {
        let config = LoaderConfig {
            disk_cache_dir: Some(dir.to_path_buf()),
            ..LoaderConfig::default()
        };
        ImageLoader::with_components(
            config,
            LoaderComponents {
                stream_provider: Some(provider),
                delivery: Some(delivery),
                ..LoaderComponents::default()
            },
        )
        .expect("create loader")
    }

    #[test]
    fn sync_load_decodes_and_caches_in_memory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let provider = Arc::new(PngProvider { opened: AtomicUsize::new(0) });
        let loader = loader(dir.path(), provider.clone(), Arc::new(DeliveryQueue::new()));

        let options = LoadOptions::cached();
        let first = loader
            .load_image_sync("http://host/a.png", Some(ImageSize::new(32, 16)), Some(&options))
            .expect("first load");
        assert_eq!((first.width(), first.height()), (32, 16));

        let second = loader
            .load_image_sync("http://host/a.png", Some(ImageSize::new(32, 16)), Some(&options))
            .expect("second load");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_uri_completes_without_buffer() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let provider = Arc::new(PngProvider { opened: AtomicUsize::new(0) });
        let loader = loader(dir.path(), provider.clone(), Arc::new(DeliveryQueue::new()));

        let result = loader.load_image_sync("  ", None, None);
        assert!(matches!(result, Err(ImageError::InvalidFormat(_))));
        assert_eq!(provider.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn requests_after_destroy_fail() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let provider = Arc::new(PngProvider { opened: AtomicUsize::new(0) });
        let queue = Arc::new(DeliveryQueue::new());
        let loader = loader(dir.path(), provider, queue.clone());
        loader.destroy();

        let result = loader.load_image_sync("http://host/a.png", None, None);
        assert!(matches!(result, Err(ImageError::Unknown(_))));
        assert_eq!(queue.run_pending(), 0);
    }
}
