//! Entry reconciliation engine
//!
//! The [`EntrySynchronizer`] folds the records of a [`RecordFeed`] into the
//! [`EntryGraph`]. Records arrive flat and in no particular hierarchical
//! order, so a child may show up before its parent.
//!
//! ## Pass Flow
//!
//! 1. **Fetch**: pull items from the feed one at a time
//! 2. **Reconcile**: create, move, rename, refresh or schedule deletion
//! 3. **Resolve**: attach entries whose parent arrived later in the pass;
//!    the rest are reported unreachable and stay detached
//! 4. **Delete**: remove the subtrees of every tombstoned entry
//! 5. **Persist**: save `(token, graph)` when the token advanced, or when an
//!    earlier save failed
//!
//! A pass works on a copy of the graph and only commits it once the feed is
//! exhausted, so a failed fetch leaves graph and token untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use cloudmirror_core::domain::{
    ContinuationToken, Entry, EntryGraph, EntryId, MirrorError, RemoteError, SyncState,
};
use cloudmirror_core::ports::{ISnapshotStore, RemoteRecord, Snapshot};
use cloudmirror_remote::RetryingInvoker;
use tracing::{debug, info, warn};

use crate::feed::{FeedItem, RecordFeed, SyncMode};

/// Summary of one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Kind of pass that ran (the last one, after a reset)
    pub mode: SyncMode,
    /// Feed items consumed
    pub records_seen: usize,
    /// Entries new to the graph
    pub created: usize,
    /// Known entries whose metadata changed
    pub updated: usize,
    /// Known entries linked under a different parent
    pub moved: usize,
    /// Known entries whose name changed
    pub renamed: usize,
    /// Ids destroyed by tombstones, subtrees included
    pub removed: Vec<EntryId>,
    /// Entries whose parent never appeared
    pub unreachable: Vec<EntryId>,
    /// Tombstones for ids the graph never held
    pub ignored_tombstones: usize,
    /// The continuation token changed
    pub token_advanced: bool,
    /// A snapshot was written by this pass
    pub persisted: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Owner of the mirrored graph and its position in the change history
pub struct EntrySynchronizer {
    invoker: RetryingInvoker,
    store: Arc<dyn ISnapshotStore>,
    graph: EntryGraph,
    state: SyncState,
    persist_pending: bool,
}

impl EntrySynchronizer {
    pub fn new(invoker: RetryingInvoker, store: Arc<dyn ISnapshotStore>) -> Self {
        Self {
            invoker,
            store,
            graph: EntryGraph::new(),
            state: SyncState::default(),
            persist_pending: false,
        }
    }

    pub fn graph(&self) -> &EntryGraph {
        &self.graph
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn token(&self) -> Option<&ContinuationToken> {
        self.state.continuation_token.as_ref()
    }

    pub fn invoker(&self) -> &RetryingInvoker {
        &self.invoker
    }

    /// Bring the graph up to date with the remote.
    ///
    /// Runs an incremental pass when a continuation token is held, a full
    /// listing otherwise. If the remote reports the token as expired the
    /// synchronizer resets and runs one full listing.
    ///
    /// # Errors
    /// Fetch failures from the [`RetryingInvoker`]. Persistence failures are
    /// logged and reported through [`SyncReport::persisted`].
    #[tracing::instrument(skip(self))]
    pub async fn sync(&mut self) -> Result<SyncReport, MirrorError> {
        match self.run_pass().await {
            Err(MirrorError::Remote {
                source: RemoteError::Gone(reason),
                ..
            }) if self.state.continuation_token.is_some() => {
                warn!(%reason, "Continuation token expired, performing full resync");
                self.reset();
                self.run_pass().await
            }
            other => other,
        }
    }

    async fn run_pass(&mut self) -> Result<SyncReport, MirrorError> {
        let started = Instant::now();
        let mut feed = match self.state.continuation_token.clone() {
            Some(token) => RecordFeed::incremental(self.invoker.clone(), token),
            None => RecordFeed::full(self.invoker.clone()),
        };

        // A full listing rebuilds from scratch so entries gone from the
        // remote do not linger
        let mut graph = match feed.mode() {
            SyncMode::Full => EntryGraph::new(),
            SyncMode::Incremental => self.graph.clone(),
        };

        info!(
            mode = %feed.mode(),
            entries = self.graph.len(),
            has_token = self.state.continuation_token.is_some(),
            "Starting sync pass"
        );

        let mut reconciler = Reconciler::new(&mut graph, feed.mode());
        while let Some(item) = feed.next().await? {
            reconciler.apply(item);
        }
        let mut report = reconciler.finish();

        let new_token = feed.final_token().cloned();
        report.token_advanced =
            new_token.is_some() && new_token != self.state.continuation_token;

        self.graph = graph;
        if new_token.is_some() {
            self.state.continuation_token = new_token;
        }
        self.state.last_synced_at = Some(Utc::now());

        if report.token_advanced || self.persist_pending {
            report.persisted = self.persist().await;
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            mode = %report.mode,
            records = report.records_seen,
            created = report.created,
            updated = report.updated,
            moved = report.moved,
            renamed = report.renamed,
            removed = report.removed.len(),
            unreachable = report.unreachable.len(),
            token_advanced = report.token_advanced,
            persisted = report.persisted,
            duration_ms = report.duration_ms,
            "Sync pass completed"
        );

        Ok(report)
    }

    async fn persist(&mut self) -> bool {
        match self.store.save(&self.snapshot()).await {
            Ok(()) => {
                self.persist_pending = false;
                true
            }
            Err(err) => {
                warn!(error = %err, "Failed to persist snapshot, will retry on next sync");
                self.persist_pending = true;
                false
            }
        }
    }

    /// Fold the authoritative response of a mutation into the graph.
    ///
    /// A trashed record is treated as a tombstone.
    pub fn fold_record(&mut self, record: RemoteRecord) -> EntryId {
        let id = record.id.clone();
        let item = if record.trashed {
            FeedItem::Tombstone(id.clone())
        } else {
            FeedItem::Live(record)
        };

        let mut reconciler = Reconciler::new(&mut self.graph, SyncMode::Incremental);
        reconciler.apply(item);
        let report = reconciler.finish();
        debug!(
            id = %id,
            created = report.created,
            moved = report.moved,
            renamed = report.renamed,
            "Folded mutation response"
        );
        id
    }

    /// Drop `id` and its subtree after a successful delete.
    pub fn forget(&mut self, id: &EntryId) -> Vec<EntryId> {
        let removed = self.graph.remove_subtree(id);
        debug!(id = %id, removed = removed.len(), "Forgot deleted subtree");
        removed
    }

    /// Drop the token and the graph; the next pass is a full listing.
    pub fn reset(&mut self) {
        info!(entries = self.graph.len(), "Resetting mirror state");
        self.graph = EntryGraph::new();
        self.state = SyncState::default();
    }

    /// Load the persisted snapshot, if any. Returns true if one was restored.
    ///
    /// # Errors
    /// Read or decode failures of the snapshot store.
    pub async fn load(&mut self) -> Result<bool, MirrorError> {
        match self.store.load().await? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            graph: self.graph.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            entries = snapshot.graph.len(),
            has_token = snapshot.state.continuation_token.is_some(),
            "Restoring snapshot"
        );
        self.state = snapshot.state;
        self.graph = snapshot.graph;
        self.persist_pending = false;
    }
}

impl std::fmt::Debug for EntrySynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrySynchronizer")
            .field("entries", &self.graph.len())
            .field("state", &self.state)
            .field("persist_pending", &self.persist_pending)
            .finish()
    }
}

/// Per-pass reconciliation state
struct Reconciler<'g> {
    graph: &'g mut EntryGraph,
    /// entry -> declared parent not linked yet
    dangling: BTreeMap<EntryId, EntryId>,
    /// tombstoned entries, deleted after the feed is exhausted
    doomed: BTreeSet<EntryId>,
    /// entries already unreachable before this pass
    carried: BTreeSet<EntryId>,
    report: SyncReport,
}

impl<'g> Reconciler<'g> {
    /// Entries left unreachable by earlier passes start out dangling, so a
    /// parent arriving now links them even without a new record of their own.
    fn new(graph: &'g mut EntryGraph, mode: SyncMode) -> Self {
        let dangling: BTreeMap<EntryId, EntryId> = graph
            .entries()
            .filter(|entry| graph.parent_of(entry.id()).is_none())
            .filter_map(|entry| Some((entry.id().clone(), entry.parent_id()?.clone())))
            .collect();
        let carried = dangling.keys().cloned().collect();

        Self {
            graph,
            dangling,
            doomed: BTreeSet::new(),
            carried,
            report: SyncReport {
                mode,
                ..SyncReport::default()
            },
        }
    }

    fn apply(&mut self, item: FeedItem) {
        self.report.records_seen += 1;
        match item {
            FeedItem::Tombstone(id) => self.apply_tombstone(id),
            FeedItem::Live(record) if self.graph.contains(&record.id) => self.update_known(record),
            FeedItem::Live(record) => self.insert_new(record),
        }
    }

    fn apply_tombstone(&mut self, id: EntryId) {
        if !self.graph.contains(&id) {
            debug!(id = %id, "Ignoring tombstone for unknown entry");
            self.report.ignored_tombstones += 1;
            return;
        }
        if self.graph.root_id() == Some(&id) {
            warn!(id = %id, "Tombstone received for the root");
        }

        let _ = self.graph.detach(&id);
        self.dangling.remove(&id);
        self.doomed.insert(id);
    }

    fn update_known(&mut self, record: RemoteRecord) {
        let id = record.id.clone();
        if self.doomed.remove(&id) {
            debug!(id = %id, "Entry reappeared after its tombstone");
        }

        if self.graph.root_id() != Some(&id) {
            match &record.parent_id {
                None => warn!(id = %id, "Non-root record without a parent, keeping current link"),
                Some(parent) if self.graph.parent_of(&id) != Some(parent) => {
                    self.relink(&id, parent);
                }
                Some(_) => {}
            }
        }

        if self.graph.get(&id).map(Entry::name) != Some(record.name.as_str()) {
            if self.graph.rename(&id, record.name.clone()).is_ok() {
                self.report.renamed += 1;
            }
        }

        if let Ok(true) = self.graph.refresh(&id, &record.to_entry()) {
            self.report.updated += 1;
        }
    }

    /// Link a known entry under a parent other than its current one
    fn relink(&mut self, id: &EntryId, parent: &EntryId) {
        if !self.graph.contains(parent) {
            debug!(id = %id, parent = %parent, "New parent not seen yet");
            let _ = self.graph.set_declared_parent(id, parent.clone());
            self.dangling.insert(id.clone(), parent.clone());
            return;
        }

        match self.graph.reparent(id, parent) {
            Ok(()) => {
                self.dangling.remove(id);
                self.report.moved += 1;
            }
            Err(err) => {
                warn!(id = %id, parent = %parent, error = %err, "Rejected move, keeping current link");
            }
        }
    }

    fn insert_new(&mut self, record: RemoteRecord) {
        let id = record.id.clone();
        let entry = record.to_entry();

        let Some(parent) = record.parent_id else {
            match self.graph.insert_root(entry) {
                Ok(()) => self.report.created += 1,
                Err(err) => warn!(id = %id, error = %err, "Skipping second root"),
            }
            return;
        };

        if let Err(err) = self.graph.insert_detached(entry) {
            warn!(id = %id, error = %err, "Skipping record");
            return;
        }
        self.report.created += 1;

        if !self.graph.contains(&parent) {
            self.dangling.insert(id, parent);
            return;
        }

        if let Some(sibling) = self.graph.child_by_name(&parent, &record.name) {
            warn!(
                id = %id,
                sibling = %sibling.id(),
                name = %record.name,
                "Remote reports duplicate sibling names"
            );
        }
        if let Err(err) = self.graph.attach(&id, &parent) {
            warn!(id = %id, parent = %parent, error = %err, "Could not link new entry");
            self.dangling.insert(id, parent);
        }
    }

    /// Resolve dangling entries, run deferred deletions and hand back the report
    fn finish(mut self) -> SyncReport {
        for (id, parent) in std::mem::take(&mut self.dangling) {
            if !self.graph.contains(&id) {
                continue;
            }
            let outcome = if self.graph.contains(&parent) {
                self.graph.attach(&id, &parent).map_err(|err| err.to_string())
            } else {
                Err("parent never observed".to_string())
            };

            match outcome {
                Ok(()) => debug!(id = %id, parent = %parent, "Resolved dangling entry"),
                Err(reason) if self.carried.contains(&id) => {
                    debug!(id = %id, parent = %parent, %reason, "Entry is still unreachable");
                    self.report.unreachable.push(id);
                }
                Err(reason) => {
                    warn!(id = %id, parent = %parent, %reason, "Entry is unreachable");
                    self.report.unreachable.push(id);
                }
            }
        }

        for id in std::mem::take(&mut self.doomed) {
            let removed = self.graph.remove_subtree(&id);
            self.report.removed.extend(removed);
        }

        self.report
    }
}
