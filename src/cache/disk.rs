//! # 磁盘缓存
//!
//! ## 设计思路
//!
//! 资源标识 → 缓存目录下的一个文件。文件名取资源标识的 SHA-256，
//! 与标识中的特殊字符、长度都无关。
//!
//! ## 实现思路
//!
//! - 写入先落到同目录的临时文件，完成后原子重命名到最终位置，
//!   读者永远看不到写了一半的文件（尺寸上限重编码覆盖同样走这条路）。
//! - 拷贝进度回调可请求中止，但只有在完成度低于 75% 时才真正中止。
//! - 配置了容量时，写入后按修改时间从旧到新淘汰，直到总量回到预算内。

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use image::ImageFormat;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::{CopyListener, DiskCache};
use crate::loader::{DecodedBuffer, ImageError, SourceStream};

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const TEMP_PREFIX: &str = ".partial-";
/// 完成度达到该百分比后忽略中止请求。
const CONTINUE_LOADING_PERCENTAGE: u64 = 75;

/// 基于文件系统的磁盘缓存。
pub struct FileDiskCache {
    dir: PathBuf,
    /// 容量上限（字节），0 表示不限。
    max_size: u64,
    closed: AtomicBool,
    // 淘汰与清空互斥，避免两边同时遍历删除
    maintenance: Mutex<()>,
}

impl FileDiskCache {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, ImageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            ImageError::FileSystem(format!("创建缓存目录 '{}' 失败：{}", dir.display(), e))
        })?;

        Ok(Self {
            dir,
            max_size,
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(()),
        })
    }

    fn file_for(&self, uri: &str) -> PathBuf {
        let digest = Sha256::digest(uri.as_bytes());
        let name: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
        self.dir.join(name)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ImageError> {
        if self.is_closed() {
            return Err(ImageError::FileSystem("磁盘缓存已关闭".to_string()));
        }
        Ok(())
    }

    fn temp_file(&self) -> Result<NamedTempFile, ImageError> {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| ImageError::FileSystem(format!("创建临时缓存文件失败：{}", e)))
    }

    fn commit(&self, temp: NamedTempFile, target: &Path) -> Result<(), ImageError> {
        temp.persist(target)
            .map_err(|e| ImageError::FileSystem(format!("缓存文件落盘失败：{}", e.error)))?;
        self.trim_to_size(target);
        Ok(())
    }

    fn cached_files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter_map(|entry| {
                // 进行中的写入
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    return None;
                }
                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((entry.path(), metadata.len(), modified))
            })
            .collect()
    }

    /// 当前缓存文件总大小（字节）。
    pub fn total_size(&self) -> u64 {
        self.cached_files().iter().map(|(_, len, _)| *len).sum()
    }

    /// 按修改时间淘汰旧文件直到不超预算，`keep` 为刚写入的条目，不参与淘汰。
    fn trim_to_size(&self, keep: &Path) {
        if self.max_size == 0 {
            return;
        }

        let _guard = self.maintenance.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut files = self.cached_files();
        let mut total: u64 = files.iter().map(|(_, len, _)| *len).sum();
        if total <= self.max_size {
            return;
        }

        files.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in files {
            if total <= self.max_size {
                break;
            }
            if path == keep {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    total = total.saturating_sub(len);
                    log::debug!("🧹 磁盘缓存淘汰: {}", path.display());
                }
                Err(e) => log::warn!("⚠️ 删除缓存文件失败 {}: {}", path.display(), e),
            }
        }
    }
}

/// 进度回调请求中止时，是否真的中止。
fn should_stop_copying(listener: &mut CopyListener<'_>, current: u64, total: Option<u64>) -> bool {
    if listener(current, total) {
        return false;
    }

    match total {
        Some(total) if total > 0 => current.saturating_mul(100) / total < CONTINUE_LOADING_PERCENTAGE,
        _ => true,
    }
}

impl DiskCache for FileDiskCache {
    fn directory(&self) -> PathBuf {
        self.dir.clone()
    }

    fn get(&self, uri: &str) -> Option<PathBuf> {
        if self.is_closed() {
            return None;
        }

        let path = self.file_for(uri);
        let metadata = fs::metadata(&path).ok()?;
        (metadata.is_file() && metadata.len() > 0).then_some(path)
    }

    fn save_stream(
        &self,
        uri: &str,
        mut stream: SourceStream,
        listener: &mut CopyListener<'_>,
    ) -> Result<bool, ImageError> {
        self.ensure_open()?;

        let total = stream.content_length();
        let mut temp = self.temp_file()?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let mut chunk = vec![0u8; COPY_BUFFER_SIZE];
            let mut current: u64 = 0;

            if should_stop_copying(listener, current, total) {
                return Ok(false);
            }

            loop {
                let read = stream.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                writer.write_all(&chunk[..read])?;
                current += read as u64;

                if should_stop_copying(listener, current, total) {
                    log::debug!("⏹️ 写入磁盘缓存被中止（{} 字节）", current);
                    return Ok(false);
                }
            }
            writer.flush()?;
        }

        self.commit(temp, &self.file_for(uri))?;
        Ok(true)
    }

    fn save_buffer(&self, uri: &str, buffer: &DecodedBuffer) -> Result<bool, ImageError> {
        self.ensure_open()?;

        let image = buffer
            .to_image()
            .ok_or_else(|| ImageError::Decode("缓冲像素长度与尺寸不一致".to_string()))?;
        let mut temp = self.temp_file()?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            image.write_to(&mut writer, ImageFormat::Png)?;
            writer.flush()?;
        }

        self.commit(temp, &self.file_for(uri))?;
        Ok(true)
    }

    fn remove(&self, uri: &str) -> bool {
        fs::remove_file(self.file_for(uri)).is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn clear(&self) {
        let _guard = self.maintenance.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (path, _, _) in self.cached_files() {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("⚠️ 删除缓存文件失败 {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use std::io::Cursor;

    fn stream_of(bytes: &[u8]) -> SourceStream {
        SourceStream::from_bytes(bytes.to_vec())
    }

    #[test]
    fn saved_stream_is_readable_by_uri() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");

        let saved = cache
            .save_stream("http://host/a.png", stream_of(b"payload"), &mut |_, _| true)
            .expect("save stream");
        assert!(saved);

        let path = cache.get("http://host/a.png").expect("cached file");
        assert_eq!(fs::read(path).expect("read cached file"), b"payload");
        assert!(cache.get("http://host/b.png").is_none());
    }

    #[test]
    fn abort_is_honoured_only_before_three_quarters() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");

        let early = cache
            .save_stream("early", stream_of(&[7u8; 1000]), &mut |_, _| false)
            .expect("save stream");
        assert!(!early);
        assert!(cache.get("early").is_none());

        let mut seen = 0u64;
        let payload = vec![1u8; COPY_BUFFER_SIZE * 4];
        let late = cache
            .save_stream("late", stream_of(&payload), &mut |current, _| {
                seen = current;
                current < (COPY_BUFFER_SIZE * 3) as u64
            })
            .expect("save stream");
        assert!(late);
        assert_eq!(seen, payload.len() as u64);
        assert!(cache.get("late").is_some());
    }

    #[test]
    fn unknown_length_abort_is_honoured() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");
        let stream = SourceStream::new(Box::new(Cursor::new(vec![1u8; 10])), None);

        let saved = cache.save_stream("x", stream, &mut |_, _| false).expect("save stream");
        assert!(!saved);
    }

    #[test]
    fn saved_buffer_is_png() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");
        let buffer = DecodedBuffer::from_rgba(2, 3, vec![255; 24]).expect("valid buffer");

        cache.save_buffer("img", &buffer).expect("save buffer");
        let bytes = fs::read(cache.get("img").expect("cached file")).expect("read file");
        let decoded = image::load_from_memory(&bytes).expect("decode png");
        assert_eq!((decoded.width(), decoded.height()), (2, 3));
    }

    #[test]
    fn budget_evicts_oldest_files() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 150).expect("create cache");

        cache.save_stream("first", stream_of(&[0u8; 100]), &mut |_, _| true).expect("save first");
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.save_stream("second", stream_of(&[0u8; 100]), &mut |_, _| true).expect("save second");

        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
        assert!(cache.total_size() <= 150);
    }

    #[test]
    fn oversized_entry_survives_its_own_commit() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 50).expect("create cache");

        cache.save_stream("small", stream_of(&[0u8; 40]), &mut |_, _| true).expect("save small");
        cache.save_stream("big", stream_of(&[0u8; 120]), &mut |_, _| true).expect("save big");

        assert!(cache.get("small").is_none());
        let path = cache.get("big").expect("just written entry kept");
        assert_eq!(fs::read(path).expect("read big").len(), 120);
    }

    #[test]
    fn closed_cache_rejects_reads_and_writes() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");
        cache.save_stream("a", stream_of(b"x"), &mut |_, _| true).expect("save");
        cache.close();

        assert!(cache.get("a").is_none());
        assert!(matches!(
            cache.save_stream("b", stream_of(b"x"), &mut |_, _| true),
            Err(ImageError::FileSystem(_))
        ));
    }

    #[test]
    fn clear_and_remove_delete_files() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = FileDiskCache::new(dir.path(), 0).expect("create cache");
        cache.save_stream("a", stream_of(b"x"), &mut |_, _| true).expect("save a");
        cache.save_stream("b", stream_of(b"y"), &mut |_, _| true).expect("save b");

        assert!(cache.remove("a"));
        assert!(cache.get("a").is_none());
        cache.clear();
        assert!(cache.get("b").is_none());
        assert_eq!(cache.total_size(), 0);
    }
}
