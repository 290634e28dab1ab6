//! Remote storage port (driven/secondary port)
//!
//! This module defines the interface to the cloud-storage service that owns
//! the authoritative file/folder graph. Adapters implement the wire protocol
//! (HTTP, authentication, JSON encoding); the mirror only ever sees the flat
//! records and pages defined here.
//!
//! ## Design Notes
//!
//! - Every call returns `Result<Option<T>, RemoteError>`. `Ok(None)` is a
//!   null/empty answer without an error (the remote occasionally returns
//!   these while it is settling) and is retried by the invoker.
//! - Adapters classify failures into [`RemoteError`]; they never retry.
//! - Uses `#[async_trait]` for async trait methods.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::domain::entry::{Entry, Properties};
use crate::domain::errors::RemoteError;
use crate::domain::newtypes::{ContentHash, ContinuationToken, EntryId};

/// Field set requested on every record fetch
pub const RECORD_FIELDS: &[&str] = &[
    "id",
    "name",
    "parents",
    "size",
    "contentHash",
    "mimeType",
    "createdTime",
    "modifiedTime",
    "trashed",
    "properties",
];

// ============================================================================
// Records
// ============================================================================

/// Folder or file, as reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    Folder,
    File {
        /// MIME type reported by the remote
        mime_type: String,
    },
}

/// A flat remote record
///
/// This is a port-level DTO. The synchronizer folds records into the
/// [`EntryGraph`](crate::domain::EntryGraph); it never stores them as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntryId,
    pub name: String,
    /// `None` only for the account root
    pub parent_id: Option<EntryId>,
    pub kind: RecordKind,
    /// Size in bytes; 0 for folders
    pub size: u64,
    pub hash: Option<ContentHash>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Soft-deleted (in the remote trash)
    pub trashed: bool,
    pub properties: Properties,
}

impl RemoteRecord {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, RecordKind::Folder)
    }

    /// Build a fresh, unlinked entry carrying this record's metadata
    pub fn to_entry(&self) -> Entry {
        let entry = match &self.kind {
            RecordKind::Folder => Entry::new_folder(
                self.id.clone(),
                self.name.clone(),
                self.parent_id.clone(),
                self.created_at,
                self.modified_at,
            ),
            RecordKind::File { mime_type } => Entry::new_file(
                self.id.clone(),
                self.name.clone(),
                self.parent_id.clone(),
                self.created_at,
                self.modified_at,
                self.size,
                self.hash.clone(),
                mime_type.clone(),
            ),
        };
        entry.with_properties(self.properties.clone())
    }
}

/// One element of the change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// The entry was deleted
    Tombstone(EntryId),
    /// Current state of a changed entry
    Live(RemoteRecord),
}

// ============================================================================
// Pages
// ============================================================================

/// One page of a full listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub records: Vec<RemoteRecord>,
    /// Token for the next page (None on the last page)
    pub next_page_token: Option<String>,
}

/// One page of the change feed
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    /// Token for the next page (None on the last page)
    pub next_page_token: Option<String>,
    /// Marker for the next incremental pass (present on the last page)
    pub new_marker: Option<ContinuationToken>,
}

// ============================================================================
// Mutations
// ============================================================================

/// Fields to change on an existing entry; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub name: Option<String>,
    pub properties: Option<Properties>,
}

/// Parameters for starting a resumable upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub name: String,
    pub parent_id: EntryId,
    pub total_size: u64,
    pub mime_type: String,
}

/// Handle of a resumable upload opened by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChannel {
    /// Session locator as issued by the remote
    pub location: String,
}

/// Answer to one uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk stored; the remote expects the next chunk at `next_offset`
    Accepted { next_offset: u64 },
    /// Upload finalized
    Completed(RemoteRecord),
}

// ============================================================================
// Downloads
// ============================================================================

/// A byte range of a file; `length == None` means to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Everything from `offset` to the end of the file
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    /// True if the range selects no bytes
    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    /// Inclusive last byte, if bounded and non-empty
    pub fn last_byte(&self) -> Option<u64> {
        match self.length {
            Some(0) | None => None,
            Some(len) => Some(self.offset + len - 1),
        }
    }
}

impl fmt::Display for ByteRange {
    /// Formats as an inclusive HTTP range: `bytes=50-149`, or `bytes=50-`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_byte() {
            Some(last) => write!(f, "bytes={}-{}", self.offset, last),
            None => write!(f, "bytes={}-", self.offset),
        }
    }
}

/// Body of a download, consumed once
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

// ============================================================================
// IRemoteStorageService trait
// ============================================================================

/// Port trait for the remote storage service
///
/// ## Implementation Notes
///
/// - Do not retry: the invoker owns retry, backoff and credential refresh.
/// - Map "no such entry" to `RemoteError::NotFound` and an expired change
///   marker to `RemoteError::Gone`.
/// - Fetches receive the field set to request; callers pass [`RECORD_FIELDS`].
#[async_trait::async_trait]
pub trait IRemoteStorageService: Send + Sync {
    /// Forces a refresh of the access credentials
    async fn refresh_credentials(&self) -> Result<(), RemoteError>;

    /// Returns the current position of the change history
    async fn get_change_marker(&self) -> Result<Option<ContinuationToken>, RemoteError>;

    /// Fetches one record; `id` may be [`EntryId::root_alias`]
    async fn get_entry(
        &self,
        id: &EntryId,
        fields: &[&str],
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Fetches one page of the full listing (`None` for the first page)
    async fn list_entries(
        &self,
        page_token: Option<&str>,
        fields: &[&str],
    ) -> Result<Option<ListPage>, RemoteError>;

    /// Fetches one page of changes; the first page token is the continuation token
    async fn list_changes(
        &self,
        page_token: &str,
        fields: &[&str],
    ) -> Result<Option<ChangePage>, RemoteError>;

    async fn create_folder(
        &self,
        parent_id: &EntryId,
        name: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Deletes an entry and its subtree; `Some(())` on success
    async fn delete_entry(&self, id: &EntryId) -> Result<Option<()>, RemoteError>;

    /// Applies `patch` and optionally moves the entry between parents
    async fn update_metadata(
        &self,
        id: &EntryId,
        patch: &MetadataPatch,
        add_parent: Option<&EntryId>,
        remove_parent: Option<&EntryId>,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Opens a resumable upload
    async fn start_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<Option<UploadChannel>, RemoteError>;

    /// Sends the chunk starting at `offset`
    async fn upload_chunk(
        &self,
        channel: &UploadChannel,
        offset: u64,
        total_size: u64,
        bytes: Bytes,
    ) -> Result<Option<ChunkOutcome>, RemoteError>;

    /// Starts a single range-qualified download
    async fn open_download(
        &self,
        id: &EntryId,
        range: ByteRange,
    ) -> Result<Option<ByteStream>, RemoteError>;
}
