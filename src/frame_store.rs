use crate::frame::Frame;
use crate::model::SampleLocator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where captured image bytes go before the sample record is written.
#[async_trait]
pub trait FrameStore: Send + Sync {
    async fn put(&self, session_id: &str, frame: &Frame) -> Result<SampleLocator>;
}

pub const DEFAULT_MIN_FREE_DISK_BYTES: u64 = 1_073_741_824; // 1 GiB

/// One image file per sample under `<root>/<session_id>/`.
#[derive(Debug)]
pub struct DiskFrameStore {
    root: PathBuf,
    min_free_disk_bytes: u64,
    sequence: AtomicU64,
}

impl DiskFrameStore {
    pub fn new(root: impl Into<PathBuf>, min_free_disk_bytes: u64) -> Self {
        Self {
            root: root.into(),
            min_free_disk_bytes,
            sequence: AtomicU64::new(0),
        }
    }

    fn file_path(&self, session_id: &str, frame: &Frame) -> PathBuf {
        let index = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let filename = format!(
            "capture-{}-{:06}.{}",
            frame.captured_at.format("%Y%m%dT%H%M%S%.3fZ"),
            index,
            frame.extension()
        );
        self.root.join(session_id).join(filename)
    }
}

#[async_trait]
impl FrameStore for DiskFrameStore {
    async fn put(&self, session_id: &str, frame: &Frame) -> Result<SampleLocator> {
        let dir = self.root.join(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create capture directory {}", dir.display()))?;
        ensure_disk_headroom(&dir, self.min_free_disk_bytes)?;

        let path = self.file_path(session_id, frame);
        tokio::fs::write(&path, &frame.bytes)
            .await
            .with_context(|| format!("failed to write capture {}", path.display()))?;

        Ok(SampleLocator::new(path.display().to_string()))
    }
}

/// Keeps frames in memory; locators look like `memory://<session>/<n>`.
#[derive(Debug, Default)]
pub struct MemoryFrameStore {
    frames: Mutex<HashMap<SampleLocator, Vec<u8>>>,
    sequence: AtomicU64,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, locator: &SampleLocator) -> Option<Vec<u8>> {
        self.frames
            .lock()
            .expect("frame store poisoned")
            .get(locator)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("frame store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FrameStore for MemoryFrameStore {
    async fn put(&self, session_id: &str, frame: &Frame) -> Result<SampleLocator> {
        let index = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let locator = SampleLocator::new(format!("memory://{session_id}/{index}"));
        self.frames
            .lock()
            .expect("frame store poisoned")
            .insert(locator.clone(), frame.bytes.clone());
        Ok(locator)
    }
}

#[derive(Debug)]
pub struct StorageCapacityError {
    pub path: PathBuf,
    pub available_bytes: u64,
    pub required_bytes: u64,
}

impl std::fmt::Display for StorageCapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Insufficient disk space in {}: need at least {:.1} MB free but only {:.1} MB available",
            self.path.display(),
            bytes_to_mb(self.required_bytes),
            bytes_to_mb(self.available_bytes)
        )
    }
}

impl std::error::Error for StorageCapacityError {}

pub fn ensure_disk_headroom(dir: &Path, min_free_bytes: u64) -> Result<()> {
    if min_free_bytes == 0 {
        return Ok(());
    }

    let available = available_bytes(dir)
        .with_context(|| format!("failed to determine free space under {}", dir.display()))?;

    if available < min_free_bytes {
        return Err(StorageCapacityError {
            path: dir.to_path_buf(),
            available_bytes: available,
            required_bytes: min_free_bytes,
        }
        .into());
    }

    Ok(())
}

fn bytes_to_mb(bytes: u64) -> f64 {
    const MB: f64 = 1024.0 * 1024.0;
    (bytes as f64) / MB
}

#[cfg(target_family = "unix")]
fn available_bytes(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte")
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_family = "unix"))]
fn available_bytes(_path: &Path) -> std::io::Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{DiskFrameStore, FrameStore, MemoryFrameStore, ensure_disk_headroom};
    use crate::frame::Frame;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[test]
    fn passes_when_threshold_zero() {
        let dir = tempdir().expect("tempdir");
        ensure_disk_headroom(dir.path(), 0).expect("zero threshold succeeds");
    }

    #[test]
    fn fails_when_threshold_exceeds_available() {
        let dir = tempdir().expect("tempdir");
        let err = ensure_disk_headroom(dir.path(), u64::MAX).expect_err("guard should fail");
        assert!(err.to_string().contains("Insufficient disk space"));
    }

    #[tokio::test]
    async fn writes_one_timestamped_file_per_frame() {
        let temp = tempdir().expect("tempdir");
        let store = DiskFrameStore::new(temp.path().join("captures"), 0);
        let captured_at = Utc.with_ymd_and_hms(2026, 3, 4, 9, 15, 2).unwrap();
        let frame = Frame {
            bytes: b"not-an-image".to_vec(),
            captured_at,
        };

        let first = store.put("s1", &frame).await.expect("first write");
        let second = store.put("s1", &frame).await.expect("second write");

        assert_ne!(first, second);
        assert!(
            first
                .as_str()
                .ends_with("capture-20260304T091502.000Z-000001.png")
        );
        assert_eq!(std::fs::read(first.as_str()).expect("file"), b"not-an-image");
        let count = std::fs::read_dir(temp.path().join("captures").join("s1"))
            .expect("session dir")
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn disk_guard_rejects_writes_without_headroom() {
        let temp = tempdir().expect("tempdir");
        let store = DiskFrameStore::new(temp.path(), u64::MAX);
        let err = store
            .put("s1", &Frame::new(b"x".to_vec()))
            .await
            .expect_err("guard should fail");
        assert!(err.to_string().contains("Insufficient disk space"));
    }

    #[tokio::test]
    async fn memory_store_keeps_bytes_by_locator() {
        let store = MemoryFrameStore::new();
        let locator = store
            .put("s1", &Frame::new(b"bytes".to_vec()))
            .await
            .expect("put");
        assert_eq!(locator.as_str(), "memory://s1/1");
        assert_eq!(store.get(&locator), Some(b"bytes".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
