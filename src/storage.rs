//! 磁盘缓存目录管理模块
//!
//! # 设计思路
//!
//! 统一决定磁盘缓存放在哪里，支持调用方自定义目录，
//! 并在目录不存在时自动创建。
//!
//! # 实现思路
//!
//! - 优先使用配置中的自定义目录。
//! - 未设置时依次尝试 `XDG_CACHE_HOME`、`$HOME/.cache`，最后回退到系统临时目录，
//!   统一加上 `image-loader` 子目录。
//! - 目录不存在时自动 `create_dir_all`，避免上层判断。
//! - 所有可能失败的操作均返回 `Result`，不使用 `expect()` / `unwrap()`。

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LoaderError;

const CACHE_DIR_NAME: &str = "image-loader";

/// 缓存目录信息
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub path: String,
    pub total_size: u64,
    pub file_count: u64,
}

/// 获取磁盘缓存目录
///
/// # 参数
/// * `custom_dir` - 自定义目录（可选）
///
/// # 返回
/// - `Ok(PathBuf)`：可用的缓存目录
/// - `Err(LoaderError::Storage)`：无法创建目录
pub fn resolve_cache_dir(custom_dir: Option<&Path>) -> Result<PathBuf, LoaderError> {
    if let Some(dir) = custom_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                LoaderError::Storage(format!("创建自定义目录 '{}' 失败: {}", dir.display(), e))
            })?;
        }
        return Ok(dir.to_path_buf());
    }

    let cache_dir = default_cache_root().join(CACHE_DIR_NAME);
    if !cache_dir.exists() {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            LoaderError::Storage(format!("创建缓存目录 '{}' 失败: {}", cache_dir.display(), e))
        })?;
    }
    Ok(cache_dir)
}

fn default_cache_root() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".cache");
    }
    std::env::temp_dir()
}

/// 获取缓存目录信息（路径 + 占用大小 + 文件数）
pub fn cache_dir_info(dir: &Path) -> Result<StorageInfo, LoaderError> {
    let mut total_size: u64 = 0;
    let mut file_count: u64 = 0;

    if dir.exists() {
        let entries = fs::read_dir(dir).map_err(|e| {
            LoaderError::Storage(format!("读取缓存目录 '{}' 失败: {}", dir.display(), e))
        })?;
        for entry in entries.flatten() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total_size += metadata.len();
                    file_count += 1;
                }
            }
        }
    }

    Ok(StorageInfo {
        path: dir.to_string_lossy().to_string(),
        total_size,
        file_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_dir_is_created() {
        let root = tempfile::tempdir().expect("create temp dir");
        let custom = root.path().join("nested").join("cache");

        let resolved = resolve_cache_dir(Some(&custom)).expect("resolve cache dir");
        assert_eq!(resolved, custom);
        assert!(custom.is_dir());
    }

    #[test]
    fn info_counts_files() {
        let root = tempfile::tempdir().expect("create temp dir");
        fs::write(root.path().join("a"), [0u8; 10]).expect("write a");
        fs::write(root.path().join("b"), [0u8; 5]).expect("write b");
        fs::create_dir(root.path().join("sub")).expect("create sub dir");

        let info = cache_dir_info(root.path()).expect("read info");
        assert_eq!(info.file_count, 2);
        assert_eq!(info.total_size, 15);
    }

    #[test]
    fn missing_dir_reports_empty() {
        let root = tempfile::tempdir().expect("create temp dir");
        let info = cache_dir_info(&root.path().join("absent")).expect("read info");
        assert_eq!(info.file_count, 0);
        assert_eq!(info.total_size, 0);
    }
}
