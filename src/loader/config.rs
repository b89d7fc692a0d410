//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `LoaderConfig`，加载器构建后不再变化。
//! 其中性能档位（quality / balanced / speed）作为高层语义，映射到底层参数组合。
//!
//! ## 实现思路
//!
//! - `Default` 提供可直接使用的平衡配置。
//! - 支持从 JSON 读取（缺失字段取默认值），读取后必须经过 `validate`。
//! - `ImagePerformanceProfile` 负责档位字符串解析与反向输出。
//! - `apply_performance_profile` 将档位转换为具体阈值；
//!   `infer_performance_profile` 从当前配置反推档位。

use std::path::{Path, PathBuf};

use fast_image_resize as fr;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

use super::source::ImageSize;

/// 降采样滤镜（可序列化），分别映射到 `image` 与 `fast_image_resize` 的滤镜。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl ResizeFilter {
    pub fn to_image_filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Gaussian => FilterType::Gaussian,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }

    pub fn to_fast_filter(self) -> fr::FilterType {
        match self {
            Self::Nearest => fr::FilterType::Box,
            Self::Triangle => fr::FilterType::Bilinear,
            Self::CatmullRom => fr::FilterType::CatmullRom,
            Self::Gaussian => fr::FilterType::Mitchell,
            Self::Lanczos3 => fr::FilterType::Lanczos3,
        }
    }
}

/// 加载器配置。
///
/// 字段覆盖了线程池、两级缓存、数据源读取与解码限制四个方面。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// 需要读磁盘/网络的任务池线程数。
    pub thread_pool_size: usize,
    /// 磁盘缓存命中任务池线程数。
    pub cached_thread_pool_size: usize,
    /// 分发线程数（判断磁盘缓存是否存在并路由任务）。
    pub distributor_pool_size: usize,
    /// 内存缓存容量（字节）。
    pub memory_cache_size: usize,
    /// 同一资源在内存缓存中只保留一个尺寸。
    pub deny_cache_multiple_sizes_in_memory: bool,
    /// 磁盘缓存目录；为空时使用系统缓存目录。
    pub disk_cache_dir: Option<PathBuf>,
    /// 磁盘缓存容量（字节），0 表示不限。
    pub disk_cache_size: u64,
    /// 写入磁盘缓存的图片宽度上限，0 表示不限。
    pub max_image_width_for_disk_cache: u32,
    /// 写入磁盘缓存的图片高度上限，0 表示不限。
    pub max_image_height_for_disk_cache: u32,
    /// 消费端尺寸未知时使用的目标宽度。
    pub max_image_width: u32,
    /// 消费端尺寸未知时使用的目标高度。
    pub max_image_height: u32,
    /// 探测到的最大位图边长（低于 2048 时按 2048 处理）。
    pub max_texture_dimension: Option<u32>,
    /// 读取原始字节时允许的最大体积（字节）。
    pub max_file_size: u64,
    /// 网络下载超时时间（秒）。
    pub download_timeout: u64,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout: u64,
    /// 下载首包超时时间（毫秒）。
    pub stream_first_byte_timeout_ms: u64,
    /// 下载分块读取超时时间（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 是否允许访问内网或本地地址。
    pub allow_private_network: bool,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    pub resize_filter: ResizeFilter,
    /// `assets://` 资源的根目录。
    pub assets_dir: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 3,
            cached_thread_pool_size: 3,
            distributor_pool_size: 2,
            memory_cache_size: 32 * 1024 * 1024,
            deny_cache_multiple_sizes_in_memory: false,
            disk_cache_dir: None,
            disk_cache_size: 0,
            max_image_width_for_disk_cache: 0,
            max_image_height_for_disk_cache: 0,
            max_image_width: 1920,
            max_image_height: 1080,
            max_texture_dimension: None,
            max_file_size: 50 * 1024 * 1024,
            download_timeout: 30,
            connect_timeout: 8,
            stream_first_byte_timeout_ms: 10_000,
            stream_chunk_timeout_ms: 15_000,
            max_redirects: 5,
            allow_private_network: true,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            resize_filter: ResizeFilter::Triangle,
            assets_dir: None,
        }
    }
}

/// 性能档位（面向使用者的高层语义）。
///
/// - `Quality`：尽量保真
/// - `Balanced`：质量与性能平衡
/// - `Speed`：优先加载速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePerformanceProfile {
    Quality,
    Balanced,
    Speed,
}

impl ImagePerformanceProfile {
    /// 从外部字符串解析档位。
    ///
    /// # 示例
    /// ```rust
    /// use image_loader::loader::ImagePerformanceProfile;
    ///
    /// let p = ImagePerformanceProfile::from_str("balanced")?;
    /// assert_eq!(p.as_str(), "balanced");
    /// # Ok::<(), image_loader::LoaderError>(())
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(profile: &str) -> Result<Self, LoaderError> {
        match profile.trim().to_lowercase().as_str() {
            "quality" => Ok(Self::Quality),
            "balanced" => Ok(Self::Balanced),
            "speed" => Ok(Self::Speed),
            other => Err(LoaderError::Config(format!(
                "未知性能档位：{}（可选：quality / balanced / speed）",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Balanced => "balanced",
            Self::Speed => "speed",
        }
    }
}

impl LoaderConfig {
    /// 从 JSON 文本读取配置并校验。
    pub fn from_json_str(json: &str) -> Result<Self, LoaderError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件读取配置并校验。
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// 范围校验；不合法时返回具体字段说明。
    pub fn validate(&self) -> Result<(), LoaderError> {
        if !(1..=64).contains(&self.thread_pool_size) {
            return Err(LoaderError::Config("thread_pool_size 必须在 1~64 之间".to_string()));
        }
        if !(1..=64).contains(&self.cached_thread_pool_size) {
            return Err(LoaderError::Config("cached_thread_pool_size 必须在 1~64 之间".to_string()));
        }
        if !(1..=16).contains(&self.distributor_pool_size) {
            return Err(LoaderError::Config("distributor_pool_size 必须在 1~16 之间".to_string()));
        }
        if self.memory_cache_size == 0 {
            return Err(LoaderError::Config("memory_cache_size 不能为 0".to_string()));
        }
        if self.max_image_width == 0 || self.max_image_height == 0 {
            return Err(LoaderError::Config("max_image_width / max_image_height 不能为 0".to_string()));
        }
        if self.max_decoded_bytes < 8 * 1024 * 1024 {
            return Err(LoaderError::Config("max_decoded_bytes 不能小于 8MB".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(LoaderError::Config("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=600).contains(&self.download_timeout) {
            return Err(LoaderError::Config("download_timeout 必须在 1~600 秒之间".to_string()));
        }
        if !(500..=120_000).contains(&self.stream_first_byte_timeout_ms) {
            return Err(LoaderError::Config(
                "stream_first_byte_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(LoaderError::Config(
                "stream_chunk_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if self.max_redirects > 20 {
            return Err(LoaderError::Config("max_redirects 不能超过 20".to_string()));
        }
        Ok(())
    }

    /// 消费端尺寸未知时的兜底目标尺寸。
    pub fn fallback_target_size(&self) -> ImageSize {
        ImageSize::new(self.max_image_width, self.max_image_height)
    }

    /// 磁盘缓存尺寸上限；0 视为该边不限。
    pub fn disk_cache_ceiling(&self) -> Option<ImageSize> {
        if self.max_image_width_for_disk_cache == 0 && self.max_image_height_for_disk_cache == 0 {
            return None;
        }

        let unbounded = |value: u32| if value == 0 { u32::MAX } else { value };
        Some(ImageSize::new(
            unbounded(self.max_image_width_for_disk_cache),
            unbounded(self.max_image_height_for_disk_cache),
        ))
    }

    /// 基于当前参数反推性能档位。
    pub fn infer_performance_profile(&self) -> ImagePerformanceProfile {
        match self.resize_filter {
            ResizeFilter::Nearest => ImagePerformanceProfile::Speed,
            ResizeFilter::CatmullRom | ResizeFilter::Lanczos3 => ImagePerformanceProfile::Quality,
            ResizeFilter::Triangle | ResizeFilter::Gaussian => ImagePerformanceProfile::Balanced,
        }
    }

    /// 应用指定性能档位到实际参数。
    pub fn apply_performance_profile(&mut self, profile: ImagePerformanceProfile) {
        match profile {
            ImagePerformanceProfile::Quality => {
                self.resize_filter = ResizeFilter::Lanczos3;
                self.memory_cache_size = 64 * 1024 * 1024;
                self.thread_pool_size = 2;
            }
            ImagePerformanceProfile::Balanced => {
                self.resize_filter = ResizeFilter::Triangle;
                self.memory_cache_size = 32 * 1024 * 1024;
                self.thread_pool_size = 3;
            }
            ImagePerformanceProfile::Speed => {
                self.resize_filter = ResizeFilter::Nearest;
                self.memory_cache_size = 16 * 1024 * 1024;
                self.thread_pool_size = 5;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        LoaderConfig::default().validate().expect("default config must validate");
    }

    #[test]
    fn profile_roundtrip() {
        for profile in [
            ImagePerformanceProfile::Quality,
            ImagePerformanceProfile::Balanced,
            ImagePerformanceProfile::Speed,
        ] {
            let mut config = LoaderConfig::default();
            config.apply_performance_profile(profile);
            assert_eq!(config.infer_performance_profile(), profile);
            assert_eq!(
                ImagePerformanceProfile::from_str(profile.as_str()).expect("parse profile"),
                profile
            );
        }
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(matches!(
            ImagePerformanceProfile::from_str("turbo"),
            Err(LoaderError::Config(_))
        ));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = LoaderConfig::from_json_str(
            r#"{ "thread_pool_size": 5, "resize_filter": "lanczos3", "max_image_width_for_disk_cache": 800 }"#,
        )
        .expect("parse config");

        assert_eq!(config.thread_pool_size, 5);
        assert_eq!(config.resize_filter, ResizeFilter::Lanczos3);
        assert_eq!(config.max_image_height, LoaderConfig::default().max_image_height);
        assert_eq!(
            config.disk_cache_ceiling(),
            Some(ImageSize::new(800, u32::MAX))
        );
    }

    #[test]
    fn json_with_invalid_range_fails_validation() {
        let result = LoaderConfig::from_json_str(r#"{ "connect_timeout": 0 }"#);
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            LoaderConfig::from_json_str("{ not json"),
            Err(LoaderError::Config(_))
        ));
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("loader.json");
        std::fs::write(&path, r#"{ "memory_cache_size": 1048576 }"#).expect("write config");

        let config = LoaderConfig::from_json_file(&path).expect("load config");
        assert_eq!(config.memory_cache_size, 1024 * 1024);
    }

    #[test]
    fn zero_disk_ceiling_means_unconstrained() {
        assert_eq!(LoaderConfig::default().disk_cache_ceiling(), None);
    }
}
