//! Range-qualified downloads
//!
//! [`ChunkedDownloadStream`] issues one range request and exposes the body as
//! a sequential, single-pass stream of [`Bytes`]. It never retries
//! mid-stream: a failure ends the stream, and the caller may reopen at
//! [`ChunkedDownloadStream::next_offset`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use cloudmirror_core::domain::{EntryId, MirrorError};
use cloudmirror_core::ports::{ByteRange, ByteStream};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::retry::RetryingInvoker;

/// Body of one ranged download
pub struct ChunkedDownloadStream {
    id: EntryId,
    range: ByteRange,
    body: Option<ByteStream>,
    bytes_read: u64,
}

impl ChunkedDownloadStream {
    /// Open a download of `range` of `id`.
    ///
    /// A zero-length range yields an empty stream without a remote call.
    pub async fn open(
        invoker: &RetryingInvoker,
        id: &EntryId,
        range: ByteRange,
    ) -> Result<Self, MirrorError> {
        if range.is_empty() {
            return Ok(Self {
                id: id.clone(),
                range,
                body: None,
                bytes_read: 0,
            });
        }

        debug!(id = %id, range = %range, "Opening download");
        let remote = invoker.remote();
        let body = invoker
            .invoke_required("open_download", id, || remote.open_download(id, range))
            .await?;

        Ok(Self {
            id: id.clone(),
            range,
            body: Some(body),
            bytes_read: 0,
        })
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Bytes yielded so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Offset to reopen at after a failure
    pub fn next_offset(&self) -> u64 {
        self.range.offset + self.bytes_read
    }

    /// Bytes still expected for a bounded range
    fn remaining(&self) -> Option<u64> {
        self.range
            .length
            .map(|length| length.saturating_sub(self.bytes_read))
    }

    /// Drain the stream into memory
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, MirrorError> {
        let capacity = self.range.length.unwrap_or(0) as usize;
        let mut out = Vec::with_capacity(capacity);
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Adapt into a tokio [`AsyncRead`]
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.map(|chunk| chunk.map_err(io::Error::other)))
    }
}

impl Stream for ChunkedDownloadStream {
    type Item = Result<Bytes, MirrorError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.remaining() == Some(0) {
            self.body = None;
        }
        let Some(body) = self.body.as_mut() else {
            return Poll::Ready(None);
        };

        match body.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.body = None;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(source))) => {
                self.body = None;
                Poll::Ready(Some(Err(MirrorError::Remote {
                    operation: "download".to_string(),
                    source,
                })))
            }
            Poll::Ready(Some(Ok(mut chunk))) => {
                // Never yield past the end of a bounded range
                if let Some(remaining) = self.remaining() {
                    if chunk.len() as u64 > remaining {
                        chunk.truncate(remaining as usize);
                    }
                }
                self.bytes_read += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
        }
    }
}

impl std::fmt::Debug for ChunkedDownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDownloadStream")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("bytes_read", &self.bytes_read)
            .field("open", &self.body.is_some())
            .finish()
    }
}
