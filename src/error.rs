//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 加载链路内部的错误统一用 `ImageError` 表达（最终归并为失败回调的 `FailType`）；
//! 而“构建加载器”这一层的错误（配置非法、运行时创建失败、目录不可用）
//! 与单张图片无关，单独定义 `LoaderError`。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ImageError` / `std::io::Error` 提供 `From` 转换，无需手动 map。

use crate::loader::ImageError;

/// 加载器级错误类型
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// 图片加载流水线错误
    #[error("{0}")]
    Image(#[from] ImageError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 配置解析或校验失败
    #[error("配置无效: {0}")]
    Config(String),

    /// 缓存目录不可用
    #[error("存储目录不可用: {0}")]
    Storage(String),

    /// 工作线程池创建失败
    #[error("运行时创建失败: {0}")]
    Runtime(String),
}

impl From<serde_json::Error> for LoaderError {
    fn from(error: serde_json::Error) -> Self {
        Self::Config(format!("JSON 解析失败: {}", error))
    }
}
