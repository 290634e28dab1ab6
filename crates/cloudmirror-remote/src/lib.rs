//! CloudMirror Remote - Resilient access to the remote storage port
//!
//! Everything that talks to [`IRemoteStorageService`] lives here:
//!
//! - [`retry`] - Bounded retry with exponential backoff and credential refresh
//! - [`upload`] - Chunked, resumable uploads
//! - [`download`] - Range-qualified download streams
//!
//! [`IRemoteStorageService`]: cloudmirror_core::ports::IRemoteStorageService

pub mod download;
pub mod retry;
pub mod upload;

#[cfg(test)]
mod testing;

pub use download::ChunkedDownloadStream;
pub use retry::{Backoff, RetryingInvoker};
pub use upload::{ChunkedUploadSession, DEFAULT_CHUNK_SIZE};
