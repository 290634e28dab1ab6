//! Chunked, resumable uploads
//!
//! [`ChunkedUploadSession`] buffers appended bytes up to a chunk boundary and
//! sends each full chunk through the resumable upload protocol of the remote:
//!
//! 1. The upload channel is opened lazily on the first flush
//! 2. A chunk is flushed when the buffer reaches `chunk_size`, or when the
//!    bytes sent plus the buffer add up to the declared file size
//! 3. The remote answers every chunk with `Accepted { next_offset }`, or with
//!    `Completed(record)` once the file is finalized
//!
//! A zero-byte file is flushed as a single empty final chunk.

use bytes::BytesMut;
use cloudmirror_core::domain::MirrorError;
use cloudmirror_core::ports::{ChunkOutcome, RemoteRecord, UploadChannel, UploadRequest};
use tracing::{debug, info, warn};

use crate::retry::RetryingInvoker;

/// Default chunk size: 64 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// State of one in-progress upload
#[derive(Debug)]
pub struct ChunkedUploadSession {
    request: UploadRequest,
    chunk_size: usize,
    buffer: BytesMut,
    bytes_sent: u64,
    channel: Option<UploadChannel>,
    chunks_sent: u32,
    finished: bool,
}

impl ChunkedUploadSession {
    /// Prepare an upload; nothing is sent until the first chunk fills up.
    ///
    /// A `chunk_size` of zero is treated as one byte.
    pub fn new(request: UploadRequest, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            buffer: BytesMut::with_capacity(chunk_size.min(request.total_size as usize)),
            request,
            chunk_size,
            bytes_sent: 0,
            channel: None,
            chunks_sent: 0,
            finished: false,
        }
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    pub fn name(&self) -> &str {
        &self.request.name
    }

    /// Declared total size
    pub fn file_size(&self) -> u64 {
        self.request.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes acknowledged by the remote
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes appended so far, sent or buffered
    pub fn bytes_received(&self) -> u64 {
        self.bytes_sent + self.buffer.len() as u64
    }

    pub fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    /// True once the remote has finalized the file
    pub fn is_complete(&self) -> bool {
        self.finished
    }

    /// Append bytes, flushing every chunk boundary reached.
    ///
    /// Returns the finalized record when this call completed the upload,
    /// `None` otherwise.
    ///
    /// When a chunk fails to upload it stays buffered: `bytes_received()`
    /// reports how much of `bytes` was kept, and appending an empty slice
    /// retries the pending chunk.
    ///
    /// # Errors
    /// - `UploadOverflow` if the total would exceed the declared size (nothing is buffered)
    /// - `UploadIncomplete` if the final chunk was accepted without completion
    /// - any error of the underlying remote calls
    pub async fn append(
        &mut self,
        invoker: &RetryingInvoker,
        bytes: &[u8],
    ) -> Result<Option<RemoteRecord>, MirrorError> {
        let received = self.bytes_received() + bytes.len() as u64;
        if received > self.request.total_size {
            return Err(MirrorError::UploadOverflow {
                name: self.request.name.clone(),
                expected: self.request.total_size,
                received,
            });
        }

        let mut input = bytes;
        loop {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(input.len());
            self.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];

            let at_end = self.bytes_received() == self.request.total_size;
            if self.buffer.len() == self.chunk_size || (at_end && !self.finished) {
                if let Some(record) = self.flush(invoker).await? {
                    return Ok(Some(record));
                }
            }

            if input.is_empty() {
                return Ok(None);
            }
        }
    }

    async fn flush(
        &mut self,
        invoker: &RetryingInvoker,
    ) -> Result<Option<RemoteRecord>, MirrorError> {
        let channel = self.ensure_channel(invoker).await?;
        let chunk = self.buffer.split().freeze();
        let offset = self.bytes_sent;
        let total = self.request.total_size;
        let is_final = offset + chunk.len() as u64 == total;
        let remote = invoker.remote();

        debug!(
            name = %self.request.name,
            offset,
            len = chunk.len(),
            total,
            "Uploading chunk"
        );

        let outcome = match invoker
            .invoke_required("upload_chunk", &self.request.name, || {
                remote.upload_chunk(&channel, offset, total, chunk.clone())
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // Keep the unsent chunk so the next append resends it at the same offset
                self.buffer.extend_from_slice(&chunk);
                warn!(name = %self.request.name, offset, error = %err, "Chunk upload failed");
                return Err(err);
            }
        };

        self.bytes_sent += chunk.len() as u64;
        self.chunks_sent += 1;

        match outcome {
            ChunkOutcome::Completed(record) => {
                self.finished = true;
                info!(
                    name = %self.request.name,
                    id = %record.id,
                    bytes = self.bytes_sent,
                    chunks = self.chunks_sent,
                    "Upload completed"
                );
                Ok(Some(record))
            }
            ChunkOutcome::Accepted { next_offset } => {
                if next_offset != self.bytes_sent {
                    warn!(
                        name = %self.request.name,
                        next_offset,
                        bytes_sent = self.bytes_sent,
                        "Remote expects a different offset than was sent"
                    );
                }
                if is_final {
                    return Err(MirrorError::UploadIncomplete {
                        name: self.request.name.clone(),
                        bytes_sent: self.bytes_sent,
                    });
                }
                Ok(None)
            }
        }
    }

    async fn ensure_channel(
        &mut self,
        invoker: &RetryingInvoker,
    ) -> Result<UploadChannel, MirrorError> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }

        let remote = invoker.remote();
        let request = &self.request;
        let channel = invoker
            .invoke_required("start_upload", &request.name, || remote.start_upload(request))
            .await?;
        debug!(name = %request.name, total = request.total_size, "Upload channel opened");

        self.channel = Some(channel.clone());
        Ok(channel)
    }
}
