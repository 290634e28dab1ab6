//! Scripted remote used by the unit tests of this crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::Utc;
use cloudmirror_core::domain::{ContinuationToken, EntryId, Properties, RemoteError};
use cloudmirror_core::ports::{
    ByteRange, ByteStream, ChangePage, ChunkOutcome, IRemoteStorageService, ListPage,
    MetadataPatch, RecordKind, RemoteRecord, UploadChannel, UploadRequest,
};
use futures_util::stream;

const PIECE: usize = 32;

/// Remote with controllable refresh, upload and download behaviour
#[derive(Default)]
pub struct ScriptedRemote {
    refresh_calls: AtomicU32,
    refresh_fails: bool,
    start_upload_calls: AtomicU32,
    never_complete: bool,
    failing_chunks: AtomicU32,
    chunks: Mutex<Vec<(u64, usize)>>,
    content: Option<Vec<u8>>,
    fail_after_pieces: Option<usize>,
    ranges: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_refresh(mut self) -> Self {
        self.refresh_fails = true;
        self
    }

    pub fn never_completing(mut self) -> Self {
        self.never_complete = true;
        self
    }

    /// The next `count` chunks fail with a server error
    pub fn failing_chunks(self, count: u32) -> Self {
        self.failing_chunks.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    /// Downloads yield `pieces` chunks, then a network error
    pub fn failing_after(mut self, pieces: usize) -> Self {
        self.fail_after_pieces = Some(pieces);
        self
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn start_upload_calls(&self) -> u32 {
        self.start_upload_calls.load(Ordering::SeqCst)
    }

    /// `(offset, len)` of every chunk received
    pub fn chunks(&self) -> Vec<(u64, usize)> {
        self.chunks.lock().unwrap().clone()
    }

    /// Range headers of every download opened
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }

    fn unsupported<T>(operation: &str) -> Result<T, RemoteError> {
        Err(RemoteError::InvalidResponse(format!("{operation} not scripted")))
    }
}

#[async_trait::async_trait]
impl IRemoteStorageService for ScriptedRemote {
    async fn refresh_credentials(&self) -> Result<(), RemoteError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails {
            return Err(RemoteError::Network("refresh endpoint down".to_string()));
        }
        Ok(())
    }

    async fn get_change_marker(&self) -> Result<Option<ContinuationToken>, RemoteError> {
        Self::unsupported("get_change_marker")
    }

    async fn get_entry(
        &self,
        _id: &EntryId,
        _fields: &[&str],
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Self::unsupported("get_entry")
    }

    async fn list_entries(
        &self,
        _page_token: Option<&str>,
        _fields: &[&str],
    ) -> Result<Option<ListPage>, RemoteError> {
        Self::unsupported("list_entries")
    }

    async fn list_changes(
        &self,
        _page_token: &str,
        _fields: &[&str],
    ) -> Result<Option<ChangePage>, RemoteError> {
        Self::unsupported("list_changes")
    }

    async fn create_folder(
        &self,
        _parent_id: &EntryId,
        _name: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Self::unsupported("create_folder")
    }

    async fn delete_entry(&self, _id: &EntryId) -> Result<Option<()>, RemoteError> {
        Self::unsupported("delete_entry")
    }

    async fn update_metadata(
        &self,
        _id: &EntryId,
        _patch: &MetadataPatch,
        _add_parent: Option<&EntryId>,
        _remove_parent: Option<&EntryId>,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        Self::unsupported("update_metadata")
    }

    async fn start_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<Option<UploadChannel>, RemoteError> {
        self.start_upload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(UploadChannel {
            location: format!("upload/{}", request.name),
        }))
    }

    async fn upload_chunk(
        &self,
        _channel: &UploadChannel,
        offset: u64,
        total_size: u64,
        bytes: Bytes,
    ) -> Result<Option<ChunkOutcome>, RemoteError> {
        self.chunks.lock().unwrap().push((offset, bytes.len()));
        let failing = self
            .failing_chunks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::Server("503 chunk rejected".to_string()));
        }
        let next_offset = offset + bytes.len() as u64;

        if next_offset < total_size || self.never_complete {
            return Ok(Some(ChunkOutcome::Accepted { next_offset }));
        }

        let now = Utc::now();
        Ok(Some(ChunkOutcome::Completed(RemoteRecord {
            id: EntryId::new("uploaded".to_string()).unwrap(),
            name: "blob.bin".to_string(),
            parent_id: Some(EntryId::new("root".to_string()).unwrap()),
            kind: RecordKind::File {
                mime_type: "application/octet-stream".to_string(),
            },
            size: total_size,
            hash: None,
            created_at: now,
            modified_at: now,
            trashed: false,
            properties: Properties::new(),
        })))
    }

    async fn open_download(
        &self,
        _id: &EntryId,
        range: ByteRange,
    ) -> Result<Option<ByteStream>, RemoteError> {
        let Some(content) = &self.content else {
            return Err(RemoteError::NotFound("no content".to_string()));
        };
        self.ranges.lock().unwrap().push(range.to_string());

        let start = (range.offset as usize).min(content.len());
        let end = range
            .last_byte()
            .map_or(content.len(), |last| (last as usize + 1).min(content.len()));

        let mut pieces: Vec<Result<Bytes, RemoteError>> = content[start..end]
            .chunks(PIECE)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        if let Some(limit) = self.fail_after_pieces {
            pieces.truncate(limit);
            pieces.push(Err(RemoteError::Network("connection reset".to_string())));
        }

        Ok(Some(Box::pin(stream::iter(pieces))))
    }
}
