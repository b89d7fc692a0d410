//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载加载链路中的所有错误来源，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! 对外回调不直接暴露 `ImageError` 的细分分支，而是归并为 `FailType`，
//! 调用方只需关心“网络被禁 / IO / 解码 / 内存 / 未知”五类。

use std::fmt;
use std::sync::Arc;

/// 图片加载统一错误类型。
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    #[error("网络错误：{0}")]
    Network(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("文件错误：{0}")]
    FileSystem(String),

    #[error("格式错误：{0}")]
    InvalidFormat(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("网络访问被禁止：{0}")]
    NetworkDenied(String),

    #[error("任务已取消：{0}")]
    Cancelled(String),

    #[error("未知错误：{0}")]
    Unknown(String),
}

impl ImageError {
    /// 归并为对外的失败类型。
    ///
    /// `Cancelled` 不属于失败，调用方不应把它交给失败回调；
    /// 这里仍给出 `Unknown` 以保证映射是全函数。
    pub fn fail_type(&self) -> FailType {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::FileSystem(_) => FailType::IoError,
            Self::InvalidFormat(_) | Self::Decode(_) => FailType::DecodingError,
            Self::ResourceLimit(_) => FailType::OutOfMemory,
            Self::NetworkDenied(_) => FailType::NetworkDenied,
            Self::Cancelled(_) | Self::Unknown(_) => FailType::Unknown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<std::io::Error> for ImageError {
    fn from(error: std::io::Error) -> Self {
        // 读取器内部产生的业务错误经 io::Error 包装后原样还原
        if error.get_ref().is_some_and(|inner| inner.is::<ImageError>()) {
            if let Some(Ok(inner)) = error.into_inner().map(|inner| inner.downcast::<ImageError>()) {
                return *inner;
            }
            return Self::Unknown("读取器错误还原失败".to_string());
        }

        match error.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(error.to_string()),
            std::io::ErrorKind::InvalidData => Self::InvalidFormat(error.to_string()),
            _ => Self::FileSystem(error.to_string()),
        }
    }
}

impl ImageError {
    /// 包装为 `io::Error`，供 `Read` 实现向上传递。
    pub(crate) fn into_io(self) -> std::io::Error {
        let kind = match &self {
            Self::Timeout(_) => std::io::ErrorKind::TimedOut,
            Self::InvalidFormat(_) => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }
}

impl From<image::ImageError> for ImageError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::Limits(e) => Self::ResourceLimit(format!("解码超出限制：{}", e)),
            image::ImageError::IoError(e) => Self::FileSystem(format!("读取图片数据失败：{}", e)),
            image::ImageError::Unsupported(e) => Self::InvalidFormat(format!("不支持的图片格式：{}", e)),
            other => Self::Decode(format!("图片解码失败：{}", other)),
        }
    }
}

impl From<ImageError> for String {
    fn from(error: ImageError) -> Self {
        error.to_string()
    }
}

/// 失败回调携带的分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailType {
    NetworkDenied,
    IoError,
    DecodingError,
    OutOfMemory,
    Unknown,
}

impl FailType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkDenied => "network_denied",
            Self::IoError => "io_error",
            Self::DecodingError => "decoding_error",
            Self::OutOfMemory => "out_of_memory",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败原因：分类 + 可选的底层错误。
#[derive(Debug, Clone)]
pub struct FailReason {
    pub fail_type: FailType,
    pub cause: Option<Arc<ImageError>>,
}

impl FailReason {
    pub fn new(fail_type: FailType, cause: Option<ImageError>) -> Self {
        Self {
            fail_type,
            cause: cause.map(Arc::new),
        }
    }

    pub fn from_error(error: ImageError) -> Self {
        Self::new(error.fail_type(), Some(error))
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.fail_type, cause),
            None => write!(f, "{}", self.fail_type),
        }
    }
}
