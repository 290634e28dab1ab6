//! Domain entities and business logic
//!
//! This module contains the core domain types for CloudMirror:
//! - Newtypes for remote ids, continuation tokens, hashes and names
//! - The [`Entry`] entity and the persisted [`SyncState`]
//! - The [`EntryGraph`] arena holding the mirrored hierarchy
//! - The error taxonomy shared by every crate

pub mod entry;
pub mod errors;
pub mod graph;
pub mod newtypes;

// Re-export commonly used types
pub use entry::{Entry, EntryKind, Properties, SyncState};
pub use errors::{DomainError, MirrorError, RemoteError, SnapshotError};
pub use graph::EntryGraph;
pub use newtypes::*;
