//! File-backed snapshot store
//!
//! The snapshot is one JSON document holding the sync state and the entry
//! graph. Saving writes `<path>.<digest>` next to the target, where `digest`
//! is the first 16 hex characters of the SHA-256 of the continuation token,
//! then renames it over `<path>`. The rename is atomic on the same
//! filesystem, so a crash mid-write leaves the previous snapshot intact.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use cloudmirror_core::config::SyncConfig;
use cloudmirror_core::domain::SnapshotError;
use cloudmirror_core::ports::{ISnapshotStore, Snapshot};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

/// Hex characters of the token digest used as the temporary file suffix
const DIGEST_HEX_LEN: usize = 16;

/// Snapshot store writing a single JSON file
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured `sync.snapshot_path`
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.snapshot_path.clone())
    }

    /// Canonical location of the published snapshot
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary file a snapshot with `token` is staged in
    pub fn staging_path(&self, token: Option<&str>) -> PathBuf {
        let digest = Sha256::digest(token.unwrap_or_default().as_bytes());
        let mut suffix = String::with_capacity(DIGEST_HEX_LEN);
        for byte in digest.iter().take(DIGEST_HEX_LEN / 2) {
            let _ = write!(suffix, "{byte:02x}");
        }

        let mut staging = self.path.as_os_str().to_owned();
        staging.push(".");
        staging.push(suffix);
        PathBuf::from(staging)
    }

    fn io_error(path: &Path, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait::async_trait]
impl ISnapshotStore for FileSnapshotStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot published yet");
                return Ok(None);
            }
            Err(err) => return Err(Self::io_error(&self.path, err)),
        };

        let snapshot: Snapshot = serde_json::from_slice(&content)?;
        debug!(
            entries = snapshot.graph.len(),
            has_token = snapshot.state.continuation_token.is_some(),
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(path = %self.path.display()))]
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Self::io_error(parent, err))?;
        }

        let token = snapshot
            .state
            .continuation_token
            .as_ref()
            .map(|t| t.as_str());
        let staging = self.staging_path(token);
        let data = serde_json::to_vec(snapshot)?;

        debug!(staging = %staging.display(), bytes = data.len(), "Writing staged snapshot");
        tokio::fs::write(&staging, &data)
            .await
            .map_err(|err| Self::io_error(&staging, err))?;

        if let Err(err) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Self::io_error(&self.path, err));
        }

        debug!(entries = snapshot.graph.len(), "Snapshot published");
        Ok(())
    }
}
