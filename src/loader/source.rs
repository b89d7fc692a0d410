//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入类型”和“流水线中间结果”解耦：
//! - `Scheme` 表示资源标识的来源语义（网络 / 文件 / Data URL / 资源包）
//! - `SourceStream` 表示已打开但未解码的字节流
//! - `DecodedBuffer` 表示已解码、已按目标尺寸降采样的 RGBA 像素
//!
//! `DecodedBuffer` 一旦进入内存缓存即为共享只读数据（`Arc`），
//! 任何处理器都必须产出新的缓冲而不是原地修改。

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use image::{DynamicImage, RgbaImage};

use super::ImageError;

/// 资源标识的协议前缀。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    File,
    Data,
    Assets,
    Unknown,
}

impl Scheme {
    fn prefix(self) -> &'static str {
        match self {
            Self::Http => "http://",
            Self::Https => "https://",
            Self::File => "file://",
            Self::Data => "data:",
            Self::Assets => "assets://",
            Self::Unknown => "",
        }
    }

    /// 识别资源标识的协议。
    ///
    /// 没有协议前缀的绝对路径按本地文件处理。
    pub fn of_uri(uri: &str) -> Self {
        let lower = uri.trim_start().to_ascii_lowercase();
        for scheme in [Self::Http, Self::Https, Self::File, Self::Data, Self::Assets] {
            if lower.starts_with(scheme.prefix()) {
                return scheme;
            }
        }

        if uri.starts_with('/') {
            return Self::File;
        }

        Self::Unknown
    }

    /// 为路径补上协议前缀。
    pub fn wrap(self, path: &str) -> String {
        format!("{}{}", self.prefix(), path)
    }

    /// 去掉协议前缀，返回剩余部分。
    pub fn crop<'a>(self, uri: &'a str) -> &'a str {
        let prefix = self.prefix();
        let trimmed = uri.trim_start();
        match trimmed.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(prefix) => &trimmed[prefix.len()..],
            _ => trimmed,
        }
    }

    pub fn is_network(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

/// 像素尺寸（宽 × 高）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 按旋转角度构造：90/270 度时交换宽高。
    pub fn with_rotation(width: u32, height: u32, rotation: u32) -> Self {
        if rotation % 180 == 0 {
            Self::new(width, height)
        } else {
            Self::new(height, width)
        }
    }

    /// 按采样率缩小，与解码器整数降采样的取整方式一致。
    pub fn scale_down(self, sample_size: u32) -> Self {
        let sample_size = sample_size.max(1);
        Self::new(
            (self.width / sample_size).max(1),
            (self.height / sample_size).max(1),
        )
    }

    /// 按浮点比例缩放。
    pub fn scale(self, scale: f32) -> Self {
        Self::new(
            ((self.width as f32 * scale) as u32).max(1),
            ((self.height as f32 * scale) as u32).max(1),
        )
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 结果来源：内存缓存、磁盘缓存或源站拉取。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadedFrom {
    MemoryCache,
    DiskCache,
    Network,
}

impl LoadedFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MemoryCache => "memory_cache",
            Self::DiskCache => "disk_cache",
            Self::Network => "network",
        }
    }
}

/// 提供者打开的字节流，附带可选的内容长度（用于进度回调）。
pub struct SourceStream {
    reader: Box<dyn Read + Send>,
    content_length: Option<u64>,
}

impl SourceStream {
    pub fn new(reader: Box<dyn Read + Send>, content_length: Option<u64>) -> Self {
        Self {
            reader,
            content_length,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(Box::new(io::Cursor::new(bytes)), Some(len))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// 读取全部字节，超过 `max_len` 即失败。
    pub fn read_all_with_limit(mut self, max_len: u64) -> Result<Vec<u8>, ImageError> {
        if let Some(len) = self.content_length {
            if len > max_len {
                return Err(ImageError::ResourceLimit(format!(
                    "图片数据过大：{:.2} MB（限制：{:.2} MB）",
                    len as f64 / 1024.0 / 1024.0,
                    max_len as f64 / 1024.0 / 1024.0
                )));
            }
        }

        let capacity = self
            .content_length
            .map(|len| len.min(max_len) as usize)
            .unwrap_or(16 * 1024);
        let mut bytes = Vec::with_capacity(capacity);
        (&mut self.reader)
            .take(max_len.saturating_add(1))
            .read_to_end(&mut bytes)?;

        if bytes.len() as u64 > max_len {
            return Err(ImageError::ResourceLimit("读取后数据超过大小限制".to_string()));
        }

        Ok(bytes)
    }
}

impl Read for SourceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// 解码结果：RGBA 像素 + 尺寸 + 回收标记。
pub struct DecodedBuffer {
    width: u32,
    height: u32,
    /// RGBA 字节数组（`width * height * 4`）。
    pixels: Vec<u8>,
    recycled: AtomicBool,
}

impl DecodedBuffer {
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| ImageError::ResourceLimit("图片尺寸导致内存溢出风险".to_string()))?;

        if pixels.len() != expected_len {
            return Err(ImageError::Decode(format!(
                "像素数据长度异常：{}（期望 {}）",
                pixels.len(),
                expected_len
            )));
        }

        Ok(Self {
            width,
            height,
            pixels,
            recycled: AtomicBool::new(false),
        })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            width,
            height,
            pixels: rgba.into_raw(),
            recycled: AtomicBool::new(false),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// 内存占用估算（字节），供内存缓存做容量统计。
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    pub fn has_valid_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// 标记为已回收；已回收的缓冲不会再从内存缓存中返回。
    pub fn recycle(&self) {
        self.recycled.store(true, Ordering::Release);
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled.load(Ordering::Acquire)
    }

    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

impl fmt::Debug for DecodedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .field("recycled", &self.is_recycled())
            .finish()
    }
}
