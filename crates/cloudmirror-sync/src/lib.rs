//! CloudMirror Sync - Mirror sessions over a remote storage account
//!
//! This crate keeps a local [`EntryGraph`] consistent with the remote:
//!
//! - [`feed`] - Lazy pager over the full listing or the change feed
//! - [`synchronizer`] - Reconciliation of records into the graph
//! - [`snapshot`] - Atomic file-backed persistence of `(token, graph)`
//! - [`session`] - Queries, mutations, transfers and consistency waits
//! - [`logging`] - Tracing subscriber setup
//!
//! [`EntryGraph`]: cloudmirror_core::domain::EntryGraph

pub mod feed;
pub mod logging;
pub mod session;
pub mod snapshot;
pub mod synchronizer;

pub use feed::{FeedItem, RecordFeed, SyncMode};
pub use logging::init_tracing;
pub use session::{Session, DEFAULT_MIME_TYPE};
pub use snapshot::FileSnapshotStore;
pub use synchronizer::{EntrySynchronizer, SyncReport};
