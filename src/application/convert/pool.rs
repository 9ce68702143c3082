use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::types::ConvertError;

/// Bounded set of browser sessions. A session is a permit plus a private
/// scratch directory used as the browser profile and I/O area.
#[derive(Debug, Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    scratch_root: PathBuf,
    size: usize,
}

impl SessionPool {
    pub fn new(size: usize, scratch_root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&scratch_root)?;
        let size = size.max(1);
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            scratch_root,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free session. The lease returns it when dropped.
    pub async fn acquire(&self) -> Result<SessionLease, ConvertError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConvertError::engine_unavailable("session pool closed"))?;

        let scratch = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&self.scratch_root)
            .map_err(|err| {
                ConvertError::engine_unavailable(format!("failed to create session dir: {err}"))
            })?;

        debug!(
            target = "application::convert::pool",
            scratch = %scratch.path().display(),
            available = self.permits.available_permits(),
            "browser session leased"
        );

        Ok(SessionLease {
            scratch,
            _permit: permit,
        })
    }
}

/// Exclusive use of one browser session.
#[derive(Debug)]
pub struct SessionLease {
    scratch: TempDir,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        debug!(
            target = "application::convert::pool",
            scratch = %self.scratch.path().display(),
            "browser session released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lease_returns_permit_and_removes_scratch_on_drop() {
        let root = tempfile::tempdir().expect("root");
        let pool = SessionPool::new(1, root.path().join("sessions")).expect("pool");

        let lease = pool.acquire().await.expect("lease");
        let scratch = lease.scratch_dir().to_path_buf();
        assert!(scratch.is_dir());
        assert_eq!(pool.available(), 0);

        drop(lease);

        assert_eq!(pool.available(), 1);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn acquire_waits_for_free_session() {
        let root = tempfile::tempdir().expect("root");
        let pool = SessionPool::new(1, root.path().to_path_buf()).expect("pool");

        let held = pool.acquire().await.expect("first lease");
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "second lease must wait");

        drop(held);
        let next = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("lease after release");
        assert!(next.is_ok());
    }

    #[test]
    fn zero_size_is_clamped() {
        let root = tempfile::tempdir().expect("root");
        let pool = SessionPool::new(0, root.path().to_path_buf()).expect("pool");
        assert_eq!(pool.size(), 1);
    }
}
