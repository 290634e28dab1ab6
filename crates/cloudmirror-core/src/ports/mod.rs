//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the mirror depends on,
//! but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStorageService`] - Listing, change feed, mutations and transfers
//! - [`ISnapshotStore`] - Durable persistence of the sync state and graph

pub mod remote_storage;
pub mod snapshot_store;

pub use remote_storage::{
    ByteRange, ByteStream, ChangePage, ChangeRecord, ChunkOutcome, IRemoteStorageService,
    ListPage, MetadataPatch, RecordKind, RemoteRecord, UploadChannel, UploadRequest,
    RECORD_FIELDS,
};
pub use snapshot_store::{ISnapshotStore, Snapshot};
