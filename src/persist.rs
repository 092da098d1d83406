//! Atomic snapshot files (write temp, then rename over the target)

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{OverseerError, Result};
use crate::retry::{with_backoff, RetryPolicy};

/// Replace `path` with `bytes` so readers never observe a partial file
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| OverseerError::io(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, bytes)
        .await
        .map_err(|e| OverseerError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| OverseerError::io(path, e))
}

/// Writes revisioned snapshots of an in-memory table.
///
/// Snapshots are taken under the owner's lock but written after it is
/// released, so two writers can race. The revision gate makes each write an
/// idempotent replay: a snapshot older than the last one on disk is dropped.
pub struct SnapshotWriter {
    path: PathBuf,
    policy: RetryPolicy,
    written: Mutex<u64>,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `bytes` as revision `revision`. Returns `false` when skipped as stale.
    pub async fn write(&self, revision: u64, bytes: Vec<u8>) -> Result<bool> {
        let mut written = self.written.lock().await;
        if revision <= *written {
            debug!(
                path = %self.path.display(),
                revision,
                latest = *written,
                "Skipping stale snapshot"
            );
            return Ok(false);
        }

        let resource = self.path.display().to_string();
        with_backoff(self.policy, &resource, || write_atomic(&self.path, &bytes)).await?;
        *written = revision;
        Ok(true)
    }
}
