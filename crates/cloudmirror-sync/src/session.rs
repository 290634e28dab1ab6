//! Mirror session
//!
//! A [`Session`] owns the configuration, the retrying invoker and the
//! [`EntrySynchronizer`]. Queries read the mirrored graph, syncing once when
//! an entry is not known yet. Mutations call the remote first and only fold
//! the authoritative response into the graph once the call succeeded.

use std::sync::Arc;

use cloudmirror_core::config::Config;
use cloudmirror_core::domain::{
    ContentHash, DomainError, Entry, EntryGraph, EntryId, EntryName, MirrorError, Properties,
};
use cloudmirror_core::ports::{
    ByteRange, IRemoteStorageService, ISnapshotStore, MetadataPatch, RemoteRecord, Snapshot,
    UploadRequest,
};
use cloudmirror_remote::{ChunkedDownloadStream, ChunkedUploadSession, RetryingInvoker};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::synchronizer::{EntrySynchronizer, SyncReport};

/// Mime type of uploads driven from a reader
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Read buffer used by [`Session::upload`]
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Mirror of one remote account
pub struct Session {
    config: Config,
    invoker: RetryingInvoker,
    synchronizer: EntrySynchronizer,
}

impl Session {
    /// Build a session with an empty graph. Nothing is fetched yet.
    pub fn new(
        config: Config,
        remote: Arc<dyn IRemoteStorageService>,
        store: Arc<dyn ISnapshotStore>,
    ) -> Self {
        let invoker = RetryingInvoker::from_config(remote, &config.retry);
        let synchronizer = EntrySynchronizer::new(invoker.clone(), store);
        Self {
            config,
            invoker,
            synchronizer,
        }
    }

    /// Restore the persisted snapshot, if any, then sync.
    ///
    /// An unreadable snapshot is logged and ignored; the sync then starts
    /// from a full listing.
    ///
    /// # Errors
    /// Failures of the initial sync.
    pub async fn open(
        config: Config,
        remote: Arc<dyn IRemoteStorageService>,
        store: Arc<dyn ISnapshotStore>,
    ) -> Result<Self, MirrorError> {
        let mut session = Self::new(config, remote, store);
        match session.synchronizer.load().await {
            Ok(true) => debug!("Starting from persisted snapshot"),
            Ok(false) => debug!("No snapshot, starting from a full listing"),
            Err(err) => warn!(error = %err, "Ignoring unreadable snapshot"),
        }
        session.sync().await?;
        Ok(session)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &EntryGraph {
        self.synchronizer.graph()
    }

    pub fn synchronizer(&self) -> &EntrySynchronizer {
        &self.synchronizer
    }

    pub async fn sync(&mut self) -> Result<SyncReport, MirrorError> {
        self.synchronizer.sync().await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn root(&mut self) -> Result<&Entry, MirrorError> {
        if self.graph().root().is_none() {
            self.sync().await?;
        }
        self.graph().root().ok_or_else(|| MirrorError::NotFound {
            operation: "root".to_string(),
            id: EntryId::root_alias().to_string(),
        })
    }

    /// Entry by id, syncing once if it is not known yet.
    pub async fn entry(&mut self, id: &EntryId) -> Result<&Entry, MirrorError> {
        if !self.graph().contains(id) {
            debug!(id = %id, "Entry not mirrored, syncing");
            self.sync().await?;
        }
        self.graph().get(id).ok_or_else(|| MirrorError::NotFound {
            operation: "entry".to_string(),
            id: id.to_string(),
        })
    }

    pub async fn children(&mut self, id: &EntryId) -> Result<Vec<&Entry>, MirrorError> {
        self.require_folder(id).await?;
        Ok(self.graph().children(id))
    }

    /// Absolute path of `id`; `None` when the entry is unreachable.
    pub async fn path_of(&mut self, id: &EntryId) -> Result<Option<String>, MirrorError> {
        self.entry(id).await?;
        Ok(self.graph().path_of(id))
    }

    /// Entry at `path`, syncing once if nothing is found.
    pub async fn resolve_path(&mut self, path: &str) -> Result<Option<&Entry>, MirrorError> {
        if self.graph().resolve_path(path).is_none() {
            self.sync().await?;
        }
        Ok(self.graph().resolve_path(path))
    }

    pub async fn size_of(&mut self, id: &EntryId) -> Result<u64, MirrorError> {
        self.entry(id).await?;
        Ok(self.graph().size_of(id).unwrap_or_default())
    }

    /// Content hash as reported by the remote.
    pub async fn content_hash(&mut self, id: &EntryId) -> Result<ContentHash, MirrorError> {
        let entry = self.entry(id).await?;
        if !entry.is_file() {
            return Err(MirrorError::NotAFile { id: id.clone() });
        }
        entry
            .hash()
            .cloned()
            .ok_or_else(|| MirrorError::HashUnavailable { id: id.clone() })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create the folder `name` under `parent`.
    ///
    /// # Errors
    /// - `TargetExists` if `parent` already holds an entry named `name`
    /// - `NotAFolder` if `parent` is a file
    #[tracing::instrument(skip(self), fields(parent = %parent))]
    pub async fn create_folder(
        &mut self,
        parent: &EntryId,
        name: &str,
    ) -> Result<Entry, MirrorError> {
        let name = EntryName::new(name.to_string())?;
        self.require_folder(parent).await?;
        if self.graph().child_by_name(parent, name.as_str()).is_some() {
            return Err(MirrorError::TargetExists {
                parent: parent.clone(),
                name: name.into(),
            });
        }

        let remote = self.invoker.remote();
        let record = self
            .invoker
            .invoke_required("create_folder", &name, || {
                remote.create_folder(parent, name.as_str())
            })
            .await?;

        let entry = self.fold(record)?;
        info!(id = %entry.id(), name = %entry.name(), "Folder created");
        Ok(entry)
    }

    /// Create every folder of `path` under `parent`, returning the leaf.
    ///
    /// Existing intermediate folders are reused. Missing intermediates are
    /// created only when `recursive` is set.
    ///
    /// # Errors
    /// - `TargetExists` if the leaf already exists
    /// - `NotAFolder` if an intermediate is a file
    /// - `NotFound` if an intermediate is missing and `recursive` is unset
    pub async fn create_folder_path(
        &mut self,
        parent: &EntryId,
        path: &str,
        recursive: bool,
    ) -> Result<Entry, MirrorError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, intermediates)) = segments.split_last() else {
            return Err(DomainError::InvalidPath(path.to_string()).into());
        };

        self.require_folder(parent).await?;
        let mut current = parent.clone();
        for segment in intermediates {
            let existing = self
                .graph()
                .child_by_name(&current, segment)
                .map(|entry| (entry.id().clone(), entry.is_folder()));

            current = match existing {
                Some((id, true)) => id,
                Some((id, false)) => return Err(MirrorError::NotAFolder { id }),
                None if recursive => self.create_folder(&current, segment).await?.id().clone(),
                None => {
                    return Err(MirrorError::NotFound {
                        operation: "create_folder_path".to_string(),
                        id: format!("{current}/{segment}"),
                    })
                }
            };
        }

        self.create_folder(&current, leaf).await
    }

    /// Delete `id` and forget its subtree. Returns the forgotten ids.
    ///
    /// An entry the remote no longer knows is treated as deleted.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn delete(&mut self, id: &EntryId) -> Result<Vec<EntryId>, MirrorError> {
        self.entry(id).await?;
        if self.graph().root_id() == Some(id) {
            return Err(DomainError::ValidationFailed("the root cannot be deleted".to_string()).into());
        }

        let remote = self.invoker.remote();
        let deleted = self
            .invoker
            .invoke("delete_entry", || remote.delete_entry(id))
            .await?;
        if deleted.is_none() {
            debug!(id = %id, "Entry was already gone on the remote");
        }

        let removed = self.synchronizer.forget(id);
        info!(id = %id, removed = removed.len(), "Entry deleted");
        Ok(removed)
    }

    /// Move `id` under `new_parent`, optionally renaming it.
    ///
    /// Moving to the current parent under the current name changes nothing
    /// and makes no remote call.
    ///
    /// # Errors
    /// - `InvalidMove` for the root, or a folder moved into its own subtree
    /// - `TargetNotEmpty` if a non-empty folder holds the target name
    /// - `TargetExists` if another entry holds the target name and
    ///   `overwrite` is unset
    #[tracing::instrument(skip(self), fields(id = %id, new_parent = %new_parent))]
    pub async fn move_entry(
        &mut self,
        id: &EntryId,
        new_parent: &EntryId,
        new_name: Option<&str>,
        overwrite: bool,
    ) -> Result<Entry, MirrorError> {
        let entry = self.entry(id).await?.clone();
        if self.graph().root_id() == Some(id) {
            return Err(MirrorError::InvalidMove {
                id: id.clone(),
                target: new_parent.clone(),
            });
        }
        self.require_folder(new_parent).await?;

        let name = match new_name {
            Some(name) => String::from(EntryName::new(name.to_string())?),
            None => entry.name().to_string(),
        };
        let current_parent = entry.parent_id().cloned();
        let parent_changed = current_parent.as_ref() != Some(new_parent);
        let name_changed = name != entry.name();

        if !parent_changed && !name_changed {
            debug!("Entry already in place");
            return Ok(entry);
        }
        if parent_changed
            && (new_parent == id || self.graph().ancestors_of(new_parent).contains(id))
        {
            return Err(MirrorError::InvalidMove {
                id: id.clone(),
                target: new_parent.clone(),
            });
        }

        self.clear_target(Some(id), new_parent, &name, overwrite).await?;

        let patch = MetadataPatch {
            name: name_changed.then(|| name.clone()),
            properties: None,
        };
        let add_parent = parent_changed.then_some(new_parent);
        let remove_parent = if parent_changed {
            current_parent.as_ref()
        } else {
            None
        };

        let remote = self.invoker.remote();
        let record = self
            .invoker
            .invoke_required("update_metadata", id, || {
                remote.update_metadata(id, &patch, add_parent, remove_parent)
            })
            .await?;

        let moved = self.fold(record)?;
        info!(name = %moved.name(), "Entry moved");
        Ok(moved)
    }

    /// Rename `id` within its current parent.
    pub async fn rename(
        &mut self,
        id: &EntryId,
        new_name: &str,
        overwrite: bool,
    ) -> Result<Entry, MirrorError> {
        let parent = self.entry(id).await?.parent_id().cloned();
        let Some(parent) = parent else {
            return Err(MirrorError::InvalidMove {
                id: id.clone(),
                target: id.clone(),
            });
        };
        self.move_entry(id, &parent, Some(new_name), overwrite).await
    }

    /// Replace the opaque properties of `id`.
    pub async fn set_properties(
        &mut self,
        id: &EntryId,
        properties: Properties,
    ) -> Result<Entry, MirrorError> {
        self.entry(id).await?;
        let patch = MetadataPatch {
            name: None,
            properties: Some(properties),
        };

        let remote = self.invoker.remote();
        let record = self
            .invoker
            .invoke_required("update_metadata", id, || {
                remote.update_metadata(id, &patch, None, None)
            })
            .await?;
        self.fold(record)
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Prepare an upload of `size` bytes named `name` under `parent`.
    ///
    /// An existing entry with that name is deleted first when `overwrite` is
    /// set; otherwise the upload is refused.
    pub async fn begin_upload(
        &mut self,
        parent: &EntryId,
        name: &str,
        size: u64,
        mime_type: &str,
        overwrite: bool,
    ) -> Result<ChunkedUploadSession, MirrorError> {
        let name = String::from(EntryName::new(name.to_string())?);
        self.require_folder(parent).await?;
        self.clear_target(None, parent, &name, overwrite).await?;

        let request = UploadRequest {
            name,
            parent_id: parent.clone(),
            total_size: size,
            mime_type: mime_type.to_string(),
        };
        debug!(name = %request.name, size, "Upload prepared");
        Ok(ChunkedUploadSession::new(
            request,
            self.config.transfer.chunk_size_bytes(),
        ))
    }

    /// Feed `bytes` to an upload; returns the new file once completed.
    pub async fn append_upload(
        &mut self,
        upload: &mut ChunkedUploadSession,
        bytes: &[u8],
    ) -> Result<Option<Entry>, MirrorError> {
        match upload.append(&self.invoker, bytes).await? {
            Some(record) => Ok(Some(self.fold(record)?)),
            None => Ok(None),
        }
    }

    /// Upload `size` bytes read from `reader`.
    ///
    /// # Errors
    /// - `UploadIncomplete` if the reader ends before `size` bytes
    /// - `UploadOverflow` if the reader yields more than `size` bytes
    /// - `LocalIo` if reading fails
    #[tracing::instrument(skip(self, reader), fields(parent = %parent))]
    pub async fn upload<R>(
        &mut self,
        parent: &EntryId,
        name: &str,
        size: u64,
        mut reader: R,
        overwrite: bool,
    ) -> Result<Entry, MirrorError>
    where
        R: AsyncRead + Unpin,
    {
        let mut upload = self
            .begin_upload(parent, name, size, DEFAULT_MIME_TYPE, overwrite)
            .await?;

        if size == 0 {
            if let Some(entry) = self.append_upload(&mut upload, &[]).await? {
                return Ok(entry);
            }
        }

        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(usize::MAX).clamp(1, READ_BUFFER_SIZE)];
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                return Err(MirrorError::UploadIncomplete {
                    name: upload.name().to_string(),
                    bytes_sent: upload.bytes_sent(),
                });
            }
            if let Some(entry) = self.append_upload(&mut upload, &buf[..read]).await? {
                return Ok(entry);
            }
        }
    }

    /// Open a download of `id` from `offset`, at most `length` bytes.
    ///
    /// The range is clamped to the end of the file; starting exactly at the
    /// end yields an empty stream.
    pub async fn download(
        &mut self,
        id: &EntryId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ChunkedDownloadStream, MirrorError> {
        let size = self
            .entry(id)
            .await?
            .file_size()
            .ok_or_else(|| MirrorError::NotAFile { id: id.clone() })?;
        if offset > size {
            return Err(MirrorError::InvalidRange {
                id: id.clone(),
                offset,
                size,
            });
        }

        let available = size - offset;
        let length = length.map_or(available, |length| length.min(available));
        ChunkedDownloadStream::open(&self.invoker, id, ByteRange::new(offset, Some(length))).await
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Sync until `predicate` holds on the graph.
    ///
    /// # Errors
    /// `ConsistencyTimeout` after `sync.consistency_attempts` passes.
    pub async fn wait_for_consistency<P>(
        &mut self,
        description: &str,
        predicate: P,
    ) -> Result<(), MirrorError>
    where
        P: Fn(&EntryGraph) -> bool,
    {
        if predicate(self.graph()) {
            return Ok(());
        }

        let attempts = self.config.sync.consistency_attempts;
        let interval = self.config.sync.consistency_interval();
        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            self.sync().await?;
            if predicate(self.graph()) {
                debug!(description, attempt, "Remote state became visible");
                return Ok(());
            }
        }

        warn!(description, attempts, "Remote state never became visible");
        Err(MirrorError::ConsistencyTimeout {
            description: description.to_string(),
            attempts,
        })
    }

    pub async fn wait_until_visible(&mut self, id: &EntryId) -> Result<(), MirrorError> {
        let description = format!("{id} to become visible");
        self.wait_for_consistency(&description, |graph| graph.is_attached(id))
            .await
    }

    pub async fn wait_until_removed(&mut self, id: &EntryId) -> Result<(), MirrorError> {
        let description = format!("{id} to be removed");
        self.wait_for_consistency(&description, |graph| !graph.contains(id))
            .await
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        self.synchronizer.snapshot()
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.synchronizer.restore(snapshot);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn require_folder(&mut self, id: &EntryId) -> Result<(), MirrorError> {
        if self.entry(id).await?.is_folder() {
            Ok(())
        } else {
            Err(MirrorError::NotAFolder { id: id.clone() })
        }
    }

    /// Make room for `name` under `parent`. An entry being moved does not
    /// conflict with itself.
    async fn clear_target(
        &mut self,
        mover: Option<&EntryId>,
        parent: &EntryId,
        name: &str,
        overwrite: bool,
    ) -> Result<(), MirrorError> {
        let existing = self
            .graph()
            .child_by_name(parent, name)
            .filter(|entry| Some(entry.id()) != mover)
            .map(|entry| (entry.id().clone(), entry.has_children()));

        match existing {
            None => Ok(()),
            Some((_, true)) => Err(MirrorError::TargetNotEmpty {
                parent: parent.clone(),
                name: name.to_string(),
            }),
            Some(_) if !overwrite => Err(MirrorError::TargetExists {
                parent: parent.clone(),
                name: name.to_string(),
            }),
            Some((target, false)) => {
                info!(target = %target, name, "Replacing existing entry");
                self.delete(&target).await.map(drop)
            }
        }
    }

    fn fold(&mut self, record: RemoteRecord) -> Result<Entry, MirrorError> {
        let id = self.synchronizer.fold_record(record);
        self.graph()
            .get(&id)
            .cloned()
            .ok_or_else(|| MirrorError::NotFound {
                operation: "fold".to_string(),
                id: id.to_string(),
            })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("invoker", &self.invoker)
            .field("synchronizer", &self.synchronizer)
            .finish()
    }
}
