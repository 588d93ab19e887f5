use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::Result;

/// Serializes emulator launches.
///
/// Launches share one temp-directory namespace and race on FIFO creation, so
/// every environment on a host is handed the same lock. The returned guard
/// releases it on drop.
pub trait LaunchLock: Send + Sync {
    fn acquire(&self) -> Result<LaunchGuard<'_>>;
}

/// Held for the duration of a launch.
pub struct LaunchGuard<'a> {
    _local: Option<MutexGuard<'a, ()>>,
    file: Option<File>,
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Cross-process lock: an exclusive `flock` on a well-known file, plus an
/// in-process mutex so threads of one process queue up without contending on
/// the file.
pub struct FileLaunchLock {
    path: PathBuf,
    local: Mutex<()>,
}

impl FileLaunchLock {
    pub const DEFAULT_NAME: &'static str = "nes-pipe-env.launch.lock";

    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            local: Mutex::new(()),
        }
    }

    /// Lock file in the system temp directory, shared by every process.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join(Self::DEFAULT_NAME))
    }

    pub fn shared() -> Arc<dyn LaunchLock> {
        Arc::new(Self::in_temp_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LaunchLock for FileLaunchLock {
    fn acquire(&self) -> Result<LaunchGuard<'_>> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        debug!(path = %self.path.display(), "launch lock acquired");
        Ok(LaunchGuard {
            _local: Some(local),
            file: Some(file),
        })
    }
}

/// In-process lock for environments that all live in one process.
#[derive(Default)]
pub struct ProcessLaunchLock {
    inner: Mutex<()>,
}

impl LaunchLock for ProcessLaunchLock {
    fn acquire(&self) -> Result<LaunchGuard<'_>> {
        let local = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(LaunchGuard {
            _local: Some(local),
            file: None,
        })
    }
}

/// Single-instance scenarios and tests.
#[derive(Default)]
pub struct NoopLaunchLock;

impl LaunchLock for NoopLaunchLock {
    fn acquire(&self) -> Result<LaunchGuard<'_>> {
        Ok(LaunchGuard {
            _local: None,
            file: None,
        })
    }
}
