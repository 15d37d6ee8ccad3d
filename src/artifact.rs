use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

use crate::error::DownloadError;

/// Counts job directories that could not be removed. Each one is disk space
/// that will not come back until the next startup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupTracker {
    failures: Arc<AtomicU64>,
}

impl CleanupTracker {
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record(&self, error: &DownloadError) {
        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(cleanup_failures = total, "{error}");
    }
}

/// The job directory holding one request's temp-file sink.
///
/// Removed by [`TempArtifact::remove`] once the relay is over, or on drop if
/// the response body goes away first.
#[derive(Debug)]
pub struct TempArtifact {
    dir: PathBuf,
    tracker: CleanupTracker,
    armed: bool,
}

impl TempArtifact {
    pub async fn create(dir: PathBuf, tracker: CleanupTracker) -> Result<Self, DownloadError> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(DownloadError::io("Could not prepare the temporary download"))?;
        debug!("Created job directory {:?}", dir);

        Ok(Self {
            dir,
            tracker,
            armed: true,
        })
    }

    /// Wraps `dir` without creating it.
    #[cfg(test)]
    pub(crate) fn existing(dir: PathBuf, tracker: CleanupTracker) -> Self {
        Self {
            dir,
            tracker,
            armed: true,
        }
    }

    pub async fn remove(mut self) {
        self.armed = false;
        if let Err(error) = remove_job_dir(&self.dir).await {
            self.tracker.record(&error);
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed abandoned job directory {:?}", self.dir),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => self.tracker.record(&DownloadError::Cleanup {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}

/// Removes a job directory. A directory that is already gone is not an error.
pub async fn remove_job_dir(dir: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!("Removed job directory {:?}", dir);
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DownloadError::Cleanup {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Deletes entries of the work directory older than `max_age`, which can only
/// be left behind by a crash mid-request.
pub async fn sweep_stale_jobs(work_dir: &Path, max_age: Duration) {
    if max_age.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open work directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate work directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => debug!("Swept stale job {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale job {:?}: {error}", path),
        }
    }
}
