use crate::error::{TrackerError, TrackerResult};
use crate::frame::{CaptureError, Frame, FrameSource};
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A frame source that at most one session may hold at a time.
///
/// The in-process claim is released when the [`FrameLease`] drops. When a lock
/// file is configured the claim is also visible to other processes, and a lock
/// left behind by a crashed process can be reclaimed with [`Self::reclaim`].
#[derive(Clone)]
pub struct SharedFrameSource {
    source: Arc<dyn FrameSource>,
    holder: Arc<Mutex<Option<String>>>,
    lock_path: Option<PathBuf>,
}

impl SharedFrameSource {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            holder: Arc::new(Mutex::new(None)),
            lock_path: None,
        }
    }

    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Session holding a live lease in this process.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().expect("frame holder poisoned").clone()
    }

    /// Session named by the lock file when no lease is live in this process.
    pub fn lock_file_holder(&self) -> anyhow::Result<Option<String>> {
        if self.holder().is_some() {
            return Ok(None);
        }
        match &self.lock_path {
            Some(path) => read_lock(path),
            None => Ok(None),
        }
    }

    pub fn claim(&self, session_id: &str) -> TrackerResult<FrameLease> {
        let mut holder = self.holder.lock().expect("frame holder poisoned");
        if let Some(current) = holder.as_ref() {
            return Err(TrackerError::CaptureUnavailable(format!(
                "frame source is held by session {current}"
            )));
        }

        if let Some(path) = &self.lock_path {
            match create_lock(path, session_id)? {
                LockOutcome::Acquired => {}
                LockOutcome::HeldBy(other) => {
                    return Err(TrackerError::CaptureUnavailable(format!(
                        "frame source is held by session {other} ({})",
                        path.display()
                    )));
                }
            }
        }

        *holder = Some(session_id.to_string());
        tracing::debug!(session_id, source = self.source.name(), "frame source claimed");
        Ok(FrameLease {
            source: Arc::clone(&self.source),
            holder: Arc::clone(&self.holder),
            lock_path: self.lock_path.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Drop an orphaned lock file that names `session_id`.
    ///
    /// Only lock files are reclaimed: a lease that is still alive in this
    /// process is never taken away from its holder.
    pub fn reclaim(&self, session_id: &str) -> anyhow::Result<bool> {
        let Some(path) = &self.lock_path else {
            return Ok(false);
        };
        if self.holder().is_some() {
            return Ok(false);
        }
        if read_lock(path)?.as_deref() != Some(session_id) {
            return Ok(false);
        }

        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove capture lock {}", path.display()))?;
        self.source.release();
        tracing::warn!(session_id, "reclaimed frame source left attached to an inactive session");
        Ok(true)
    }
}

/// Exclusive access to the frame source for one session.
pub struct FrameLease {
    source: Arc<dyn FrameSource>,
    holder: Arc<Mutex<Option<String>>>,
    lock_path: Option<PathBuf>,
    session_id: String,
}

impl FrameLease {
    pub async fn acquire(&self) -> Result<Frame, CaptureError> {
        self.source.acquire().await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_path
            && matches!(read_lock(path), Ok(Some(ref id)) if *id == self.session_id)
            && let Err(err) = std::fs::remove_file(path)
        {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove capture lock");
        }

        let mut holder = self.holder.lock().expect("frame holder poisoned");
        if holder.as_deref() == Some(self.session_id.as_str()) {
            *holder = None;
        }
        drop(holder);

        self.source.release();
        tracing::debug!(session_id = %self.session_id, "frame source released");
    }
}

enum LockOutcome {
    Acquired,
    HeldBy(String),
}

fn create_lock(path: &Path, session_id: &str) -> anyhow::Result<LockOutcome> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(session_id.as_bytes())
                .with_context(|| format!("failed to write capture lock {}", path.display()))?;
            Ok(LockOutcome::Acquired)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let holder = read_lock(path)?.unwrap_or_else(|| "unknown".to_string());
            Ok(LockOutcome::HeldBy(holder))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to create capture lock {}", path.display()))
        }
    }
}

fn read_lock(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let id = content.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read capture lock {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SharedFrameSource;
    use crate::error::TrackerError;
    use crate::frame::SyntheticFrameSource;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn second_claim_fails_until_lease_drops() {
        let synthetic = Arc::new(SyntheticFrameSource::from_frames(Vec::new()));
        let shared = SharedFrameSource::new(synthetic.clone());

        let lease = shared.claim("s1").expect("first claim");
        assert_eq!(shared.holder().as_deref(), Some("s1"));
        let err = shared.claim("s2").err().expect("second claim fails");
        assert!(matches!(err, TrackerError::CaptureUnavailable(_)));

        drop(lease);
        assert_eq!(synthetic.released(), 1);
        assert!(shared.holder().is_none());
        shared.claim("s2").expect("claim after release");
    }

    #[test]
    fn lock_file_blocks_other_processes_and_is_removed_on_release() {
        let temp = tempdir().expect("tempdir");
        let lock = temp.path().join("capture.lock");
        let shared = SharedFrameSource::new(Arc::new(SyntheticFrameSource::default()))
            .with_lock_file(&lock);

        let lease = shared.claim("s1").expect("claim");
        assert_eq!(std::fs::read_to_string(&lock).expect("lock"), "s1");

        // A second installation handle sees the lock file.
        let other = SharedFrameSource::new(Arc::new(SyntheticFrameSource::default()))
            .with_lock_file(&lock);
        assert_eq!(other.lock_file_holder().expect("read").as_deref(), Some("s1"));
        assert!(other.claim("s2").is_err());

        drop(lease);
        assert!(!lock.exists());
        other.claim("s2").expect("claim after release");
    }

    #[test]
    fn reclaims_orphaned_lock_file() {
        let temp = tempdir().expect("tempdir");
        let lock = temp.path().join("capture.lock");
        std::fs::write(&lock, "crashed-session").expect("write stale lock");

        let synthetic = Arc::new(SyntheticFrameSource::default());
        let shared = SharedFrameSource::new(synthetic.clone()).with_lock_file(&lock);

        assert!(!shared.reclaim("someone-else").expect("reclaim"));
        assert!(shared.reclaim("crashed-session").expect("reclaim"));
        assert!(!lock.exists());
        assert_eq!(synthetic.released(), 1);
        shared.claim("fresh").expect("claim after reclaim");
    }
}
