//! Error taxonomy
//!
//! - [`DomainError`] - validation of names, ids, paths and graph links
//! - [`RemoteError`] - classification of a failed remote call, produced by adapters
//! - [`SnapshotError`] - persistence failures of the snapshot store
//! - [`MirrorError`] - everything a mirror operation can surface to its caller

use thiserror::Error;

use super::newtypes::EntryId;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid entry name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid content hash
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid remote entry ID
    #[error("Invalid entry ID: {0}")]
    InvalidEntryId(String),

    /// Invalid continuation token
    #[error("Invalid continuation token: {0}")]
    InvalidToken(String),

    /// Referenced entry is not in the graph
    #[error("Unknown entry: {0}")]
    UnknownEntry(EntryId),

    /// Link target is a file
    #[error("Entry {0} is not a folder")]
    NotAFolder(EntryId),

    /// Link would make an entry its own ancestor
    #[error("Linking {id} under {parent} would create a cycle")]
    Cycle {
        /// Entry being linked
        id: EntryId,
        /// Requested parent
        parent: EntryId,
    },

    /// A different root is already registered
    #[error("Root already registered as {existing}, refusing {rejected}")]
    RootConflict {
        /// Root currently in the graph
        existing: EntryId,
        /// Root that was offered
        rejected: EntryId,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Classified failure of a single remote call
///
/// Adapters of [`IRemoteStorageService`](crate::ports::IRemoteStorageService)
/// map their transport errors onto these variants; the retrying invoker is
/// the only place that decides what each variant means.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The addressed entry does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were rejected or expired
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Remote refused the mutation because of a conflicting state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Continuation token is no longer valid
    #[error("continuation token expired: {0}")]
    Gone(String),

    /// Too many requests
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Remote-side failure (5xx)
    #[error("server error: {0}")]
    Server(String),

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Failures of the snapshot store
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem failure while reading, writing or publishing
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        /// File the operation targeted
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Snapshot could not be encoded or decoded
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced by mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    /// A transient condition outlasted the retry budget
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Name of the remote operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Non-retryable remote error
    #[error("{operation} failed: {source}")]
    Remote {
        /// Name of the remote operation
        operation: String,
        /// Classified remote failure
        #[source]
        source: RemoteError,
    },

    /// Absence confirmed where presence was required
    #[error("{operation}: entry {id} not found")]
    NotFound {
        /// Name of the operation
        operation: String,
        /// Entry that was expected
        id: String,
    },

    /// An entry with the target name already exists
    #[error("{name} already exists in folder {parent}")]
    TargetExists {
        /// Target folder
        parent: EntryId,
        /// Conflicting name
        name: String,
    },

    /// A non-empty folder occupies the target name
    #[error("{name} in folder {parent} is a non-empty folder")]
    TargetNotEmpty {
        /// Target folder
        parent: EntryId,
        /// Conflicting name
        name: String,
    },

    /// Move would place a folder inside itself
    #[error("cannot move {id} into {target}")]
    InvalidMove {
        /// Entry being moved
        id: EntryId,
        /// Requested parent
        target: EntryId,
    },

    /// Entry is not a folder
    #[error("entry {id} is not a folder")]
    NotAFolder {
        /// Offending entry
        id: EntryId,
    },

    /// Entry is not a file
    #[error("entry {id} is not a file")]
    NotAFile {
        /// Offending entry
        id: EntryId,
    },

    /// Download range starts outside the file
    #[error("range starting at {offset} is outside {id} (size {size})")]
    InvalidRange {
        /// File being read
        id: EntryId,
        /// Requested start offset
        offset: u64,
        /// File size
        size: u64,
    },

    /// Expected remote state never became visible
    #[error("timed out waiting for {description} after {attempts} attempts")]
    ConsistencyTimeout {
        /// What was awaited
        description: String,
        /// Number of sync passes made
        attempts: u32,
    },

    /// Final chunk was sent but the remote never signalled completion
    #[error("upload of {name} incomplete after {bytes_sent} bytes")]
    UploadIncomplete {
        /// File being uploaded
        name: String,
        /// Bytes acknowledged so far
        bytes_sent: u64,
    },

    /// More bytes were appended than declared
    #[error("upload of {name} overflowed: expected {expected} bytes, received {received}")]
    UploadOverflow {
        /// File being uploaded
        name: String,
        /// Declared size
        expected: u64,
        /// Bytes appended so far
        received: u64,
    },

    /// Remote reported no content hash for the file
    #[error("no content hash available for {id}")]
    HashUnavailable {
        /// File queried
        id: EntryId,
    },

    /// Reading the local source of an upload failed
    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Snapshot persistence failure
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Domain validation failure
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl MirrorError {
    /// Returns true for name conflicts at the target of a create or move
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TargetExists { .. } | Self::TargetNotEmpty { .. }
        )
    }
}
