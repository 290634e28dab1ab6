//! Snapshot store port (driven/secondary port)
//!
//! Persists the single artifact a mirror needs to resume: the sync state and
//! the entry graph, saved together so the token never gets ahead of the graph.
//!
//! ## Design Notes
//!
//! - Implementations must publish atomically: a crash during `save` leaves
//!   the previous snapshot readable.
//! - `load` returns `Ok(None)` when nothing has been saved yet.

use serde::{Deserialize, Serialize};

use crate::domain::{EntryGraph, SnapshotError, SyncState};

/// Everything persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: SyncState,
    pub graph: EntryGraph,
}

/// Port trait for snapshot persistence
#[async_trait::async_trait]
pub trait ISnapshotStore: Send + Sync {
    /// Reads the last published snapshot, if any
    async fn load(&self) -> Result<Option<Snapshot>, SnapshotError>;

    /// Durably replaces the published snapshot
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}
