//! Shared test helpers for mirror integration tests
//!
//! [`MemoryRemote`] is an in-memory remote storage service with a change
//! log. Changes made through its helpers simulate other clients editing the
//! account; changes made through the port simulate the mirror itself.
//! Uploaded files only keep their size.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use cloudmirror_core::config::{Config, ConfigBuilder};
use cloudmirror_core::domain::{
    ContentHash, ContinuationToken, EntryId, Properties, RemoteError, SnapshotError,
};
use cloudmirror_core::ports::{
    ByteRange, ByteStream, ChangePage, ChangeRecord, ChunkOutcome, IRemoteStorageService,
    ISnapshotStore, ListPage, MetadataPatch, RecordKind, RemoteRecord, Snapshot, UploadChannel,
    UploadRequest, RECORD_FIELDS,
};
use cloudmirror_sync::Session;
use futures_util::stream;

pub const ROOT: &str = "root-0001";

/// Bytes per piece of a download body
const PIECE: usize = 16;

pub fn eid(s: &str) -> EntryId {
    EntryId::new(s.to_string()).unwrap()
}

// ============================================================================
// MemoryRemote
// ============================================================================

struct Upload {
    request: UploadRequest,
    received: u64,
}

struct Logged {
    change: ChangeRecord,
    /// Hidden from change-feed calls up to and including this one
    hidden_until: u32,
}

#[derive(Default)]
struct State {
    records: BTreeMap<EntryId, RemoteRecord>,
    contents: HashMap<EntryId, Vec<u8>>,
    log: Vec<Logged>,
    uploads: HashMap<String, Upload>,
    chunks: Vec<(u64, usize)>,
    next_id: u64,
    clock: i64,
    /// Positions below this answer `Gone`
    expired_below: usize,
    visibility_lag: u32,
    changes_calls: u32,
    fail_next_fetch: Option<RemoteError>,
}

/// In-memory remote storage account
pub struct MemoryRemote {
    state: Mutex<State>,
    page_size: usize,
    list_changes_calls: AtomicU32,
    list_entries_calls: AtomicU32,
    mutation_calls: AtomicU32,
    refresh_calls: AtomicU32,
}

impl MemoryRemote {
    /// Account with an empty root folder
    pub fn new() -> Self {
        Self::with_page_size(3)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let remote = Self {
            state: Mutex::new(State::default()),
            page_size,
            list_changes_calls: AtomicU32::new(0),
            list_entries_calls: AtomicU32::new(0),
            mutation_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
        };
        {
            let mut state = remote.state.lock().unwrap();
            let now = state.tick();
            state.records.insert(
                eid(ROOT),
                RemoteRecord {
                    id: eid(ROOT),
                    name: "My Drive".to_string(),
                    parent_id: None,
                    kind: RecordKind::Folder,
                    size: 0,
                    hash: None,
                    created_at: now,
                    modified_at: now,
                    trashed: false,
                    properties: Properties::new(),
                },
            );
        }
        remote
    }

    // ------------------------------------------------------------------
    // Changes made by other clients
    // ------------------------------------------------------------------

    pub fn add_folder(&self, parent: &str, name: &str) -> EntryId {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh_id("folder");
        state.insert(id.clone(), name, Some(eid(parent)), RecordKind::Folder, 0);
        id
    }

    pub fn add_folder_with_id(&self, id: &str, parent: &str, name: &str) -> EntryId {
        let mut state = self.state.lock().unwrap();
        state.insert(eid(id), name, Some(eid(parent)), RecordKind::Folder, 0);
        eid(id)
    }

    pub fn add_file(&self, parent: &str, name: &str, content: &[u8]) -> EntryId {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh_id("file");
        state.insert_file(id.clone(), name, eid(parent), content);
        id
    }

    pub fn add_file_with_id(&self, id: &str, parent: &str, name: &str, content: &[u8]) -> EntryId {
        let mut state = self.state.lock().unwrap();
        state.insert_file(eid(id), name, eid(parent), content);
        eid(id)
    }

    pub fn rename(&self, id: &EntryId, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.modify(id, |record| record.name = name.to_string());
    }

    pub fn move_to(&self, id: &EntryId, parent: &EntryId) {
        let mut state = self.state.lock().unwrap();
        state.modify(id, |record| record.parent_id = Some(parent.clone()));
    }

    pub fn set_remote_properties(&self, id: &EntryId, properties: Properties) {
        let mut state = self.state.lock().unwrap();
        state.modify(id, |record| record.properties = properties);
    }

    /// Soft-delete: the record stays, flagged as trashed
    pub fn trash(&self, id: &EntryId) {
        let mut state = self.state.lock().unwrap();
        state.modify(id, |record| record.trashed = true);
    }

    pub fn remove(&self, id: &EntryId) {
        self.state.lock().unwrap().remove_subtree(id);
    }

    /// Append a raw change to the log without touching the records
    pub fn log_change(&self, change: ChangeRecord) {
        self.state.lock().unwrap().push_change(change);
    }

    // ------------------------------------------------------------------
    // Behaviour knobs
    // ------------------------------------------------------------------

    /// Markers behind the latest change answer `Gone`
    pub fn expire_markers(&self) {
        let mut state = self.state.lock().unwrap();
        state.expired_below = state.log.len();
    }

    /// New changes stay invisible for the next `calls` change-feed calls
    pub fn set_visibility_lag(&self, calls: u32) {
        self.state.lock().unwrap().visibility_lag = calls;
    }

    /// The next listing, change-feed or marker call fails with `err`
    pub fn fail_next_fetch(&self, err: RemoteError) {
        self.state.lock().unwrap().fail_next_fetch = Some(err);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn record(&self, id: &EntryId) -> Option<RemoteRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// `(offset, len)` of every uploaded chunk
    pub fn chunks(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().chunks.clone()
    }

    pub fn mutation_calls(&self) -> u32 {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub fn list_changes_calls(&self) -> u32 {
        self.list_changes_calls.load(Ordering::SeqCst)
    }

    pub fn list_entries_calls(&self) -> u32 {
        self.list_entries_calls.load(Ordering::SeqCst)
    }

    fn take_fetch_failure(&self) -> Result<(), RemoteError> {
        match self.state.lock().unwrap().fail_next_fetch.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fetches must ask for the full record field set
    fn check_fields(fields: &[&str]) -> Result<(), RemoteError> {
        if fields == RECORD_FIELDS {
            Ok(())
        } else {
            Err(RemoteError::InvalidResponse(format!("incomplete field set {fields:?}")))
        }
    }

    fn mutated(&self) {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(self.clock)
    }

    fn fresh_id(&mut self, prefix: &str) -> EntryId {
        self.next_id += 1;
        eid(&format!("{prefix}-{:04}", self.next_id))
    }

    fn push_change(&mut self, change: ChangeRecord) {
        let hidden_until = self.changes_calls + self.visibility_lag;
        self.log.push(Logged {
            change,
            hidden_until,
        });
    }

    fn insert(
        &mut self,
        id: EntryId,
        name: &str,
        parent: Option<EntryId>,
        kind: RecordKind,
        size: u64,
    ) -> RemoteRecord {
        let now = self.tick();
        let hash = match kind {
            RecordKind::File { .. } => Some(ContentHash::new(format!("md5-{id}")).unwrap()),
            RecordKind::Folder => None,
        };
        let record = RemoteRecord {
            id: id.clone(),
            name: name.to_string(),
            parent_id: parent,
            kind,
            size,
            hash,
            created_at: now,
            modified_at: now,
            trashed: false,
            properties: Properties::new(),
        };
        self.records.insert(id, record.clone());
        self.push_change(ChangeRecord::Live(record.clone()));
        record
    }

    fn insert_file(&mut self, id: EntryId, name: &str, parent: EntryId, content: &[u8]) {
        let kind = RecordKind::File {
            mime_type: "text/plain".to_string(),
        };
        self.insert(id.clone(), name, Some(parent), kind, content.len() as u64);
        self.contents.insert(id, content.to_vec());
    }

    fn modify(&mut self, id: &EntryId, change: impl FnOnce(&mut RemoteRecord)) -> Option<RemoteRecord> {
        let now = self.tick();
        let record = self.records.get_mut(id)?;
        change(record);
        record.modified_at = now;
        let record = record.clone();
        self.push_change(ChangeRecord::Live(record.clone()));
        Some(record)
    }

    fn remove_subtree(&mut self, id: &EntryId) {
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if self.records.remove(&current).is_none() {
                continue;
            }
            self.contents.remove(&current);
            self.push_change(ChangeRecord::Tombstone(current.clone()));
            stack.extend(
                self.records
                    .values()
                    .filter(|r| r.parent_id.as_ref() == Some(&current))
                    .map(|r| r.id.clone()),
            );
        }
    }

    fn position(&self, token: &str) -> Result<usize, RemoteError> {
        let position: usize = token
            .strip_prefix('m')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RemoteError::InvalidResponse(format!("bad token {token}")))?;
        if position < self.expired_below {
            return Err(RemoteError::Gone(token.to_string()));
        }
        Ok(position)
    }
}

fn marker(position: usize) -> ContinuationToken {
    ContinuationToken::new(format!("m{position}")).unwrap()
}

#[async_trait::async_trait]
impl IRemoteStorageService for MemoryRemote {
    async fn refresh_credentials(&self) -> Result<(), RemoteError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_change_marker(&self) -> Result<Option<ContinuationToken>, RemoteError> {
        self.take_fetch_failure()?;
        let state = self.state.lock().unwrap();
        Ok(Some(marker(state.log.len())))
    }

    async fn get_entry(
        &self,
        id: &EntryId,
        fields: &[&str],
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Self::check_fields(fields)?;
        let state = self.state.lock().unwrap();
        let id = if *id == EntryId::root_alias() {
            eid(ROOT)
        } else {
            id.clone()
        };
        state
            .records
            .get(&id)
            .cloned()
            .map(Some)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn list_entries(
        &self,
        page_token: Option<&str>,
        fields: &[&str],
    ) -> Result<Option<ListPage>, RemoteError> {
        self.list_entries_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fetch_failure()?;
        Self::check_fields(fields)?;

        let state = self.state.lock().unwrap();
        let start: usize = page_token
            .and_then(|t| t.strip_prefix('p'))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let all: Vec<&RemoteRecord> = state
            .records
            .values()
            .filter(|r| r.parent_id.is_some())
            .collect();
        let end = (start + self.page_size).min(all.len());

        Ok(Some(ListPage {
            records: all[start.min(end)..end].iter().map(|r| (*r).clone()).collect(),
            next_page_token: (end < all.len()).then(|| format!("p{end}")),
        }))
    }

    async fn list_changes(
        &self,
        page_token: &str,
        fields: &[&str],
    ) -> Result<Option<ChangePage>, RemoteError> {
        self.list_changes_calls.fetch_add(1, Ordering::SeqCst);
        self.take_fetch_failure()?;
        Self::check_fields(fields)?;

        let mut state = self.state.lock().unwrap();
        state.changes_calls += 1;
        let call = state.changes_calls;
        let start = state.position(page_token)?;

        let mut end = start;
        while end < state.log.len()
            && end - start < self.page_size
            && state.log[end].hidden_until < call
        {
            end += 1;
        }
        let more = end < state.log.len() && state.log[end].hidden_until < call;

        Ok(Some(ChangePage {
            changes: state.log[start.min(end)..end]
                .iter()
                .map(|logged| logged.change.clone())
                .collect(),
            next_page_token: more.then(|| format!("m{end}")),
            new_marker: (!more).then(|| marker(end)),
        }))
    }

    async fn create_folder(
        &self,
        parent_id: &EntryId,
        name: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        self.mutated();
        let mut state = self.state.lock().unwrap();
        match state.records.get(parent_id) {
            Some(parent) if parent.is_folder() => {}
            Some(_) => return Err(RemoteError::Conflict(format!("{parent_id} is a file"))),
            None => return Err(RemoteError::NotFound(parent_id.to_string())),
        }
        let id = state.fresh_id("folder");
        let record = state.insert(id, name, Some(parent_id.clone()), RecordKind::Folder, 0);
        Ok(Some(record))
    }

    async fn delete_entry(&self, id: &EntryId) -> Result<Option<()>, RemoteError> {
        self.mutated();
        let mut state = self.state.lock().unwrap();
        if !state.records.contains_key(id) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        state.remove_subtree(id);
        Ok(Some(()))
    }

    async fn update_metadata(
        &self,
        id: &EntryId,
        patch: &MetadataPatch,
        add_parent: Option<&EntryId>,
        remove_parent: Option<&EntryId>,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        self.mutated();
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.records.get(id) else {
            return Err(RemoteError::NotFound(id.to_string()));
        };
        if remove_parent.is_some() && remove_parent != current.parent_id.as_ref() {
            return Err(RemoteError::Conflict(format!("{id} is not in {remove_parent:?}")));
        }

        let record = state.modify(id, |record| {
            if let Some(name) = &patch.name {
                record.name = name.clone();
            }
            if let Some(properties) = &patch.properties {
                record.properties = properties.clone();
            }
            if let Some(parent) = add_parent {
                record.parent_id = Some(parent.clone());
            }
        });
        Ok(record)
    }

    async fn start_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<Option<UploadChannel>, RemoteError> {
        self.mutated();
        let location = format!("upload/{}", uuid::Uuid::new_v4());
        self.state.lock().unwrap().uploads.insert(
            location.clone(),
            Upload {
                request: request.clone(),
                received: 0,
            },
        );
        Ok(Some(UploadChannel { location }))
    }

    async fn upload_chunk(
        &self,
        channel: &UploadChannel,
        offset: u64,
        total_size: u64,
        bytes: Bytes,
    ) -> Result<Option<ChunkOutcome>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.chunks.push((offset, bytes.len()));

        let Some(upload) = state.uploads.get_mut(&channel.location) else {
            return Err(RemoteError::NotFound(channel.location.clone()));
        };
        if offset != upload.received {
            return Err(RemoteError::InvalidResponse(format!(
                "expected offset {}, got {offset}",
                upload.received
            )));
        }
        upload.received += bytes.len() as u64;
        if upload.received < total_size {
            return Ok(Some(ChunkOutcome::Accepted {
                next_offset: upload.received,
            }));
        }

        let request = upload.request.clone();
        state.uploads.remove(&channel.location);
        let id = state.fresh_id("file");
        let kind = RecordKind::File {
            mime_type: request.mime_type.clone(),
        };
        let record = state.insert(id, &request.name, Some(request.parent_id), kind, total_size);
        Ok(Some(ChunkOutcome::Completed(record)))
    }

    async fn open_download(
        &self,
        id: &EntryId,
        range: ByteRange,
    ) -> Result<Option<ByteStream>, RemoteError> {
        let state = self.state.lock().unwrap();
        let content = state
            .contents
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;

        let start = (range.offset as usize).min(content.len());
        let end = range
            .last_byte()
            .map_or(content.len(), |last| (last as usize + 1).min(content.len()));
        let pieces: Vec<Result<Bytes, RemoteError>> = content[start..end]
            .chunks(PIECE)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();

        Ok(Some(Box::pin(stream::iter(pieces))))
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// Snapshot store kept in memory, with an injectable save failure
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
    failing: AtomicBool,
    saves: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<Snapshot> {
        self.snapshot.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ISnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SnapshotError::Io {
                path: "memory".to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}

// ============================================================================
// Session helpers
// ============================================================================

/// Configuration with short delays
pub fn test_config() -> Config {
    ConfigBuilder::new()
        .retry_max_attempts(3)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(10)
        .sync_consistency_attempts(5)
        .sync_consistency_interval_ms(10)
        .build()
}

/// Session opened (and synced) against `remote`
pub async fn open_session(remote: &Arc<MemoryRemote>) -> (Session, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let session = Session::open(test_config(), remote.clone(), store.clone())
        .await
        .expect("Failed to open session");
    (session, store)
}

/// Fresh full listing of `remote`, for comparison with an incrementally
/// maintained graph
pub async fn fresh_session(remote: &Arc<MemoryRemote>) -> Session {
    open_session(remote).await.0
}
