//! Tee for response bodies of unknown length

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tracing::{debug, warn};

use crate::key::TransactionKey;
use crate::message::ChunkStream;
use crate::storage::BlobWriter;

/// Forwards body chunks to the client while writing them to a blob
///
/// The blob is committed off the polling task once the upstream body ends
/// cleanly. An upstream error or a failed write discards it, and so does
/// dropping the stream early.
pub struct RecordingStream {
    inner: ChunkStream,
    writer: Option<BlobWriter>,
    bucket: String,
    key: TransactionKey,
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
}

impl RecordingStream {
    /// Tee `inner` into `writer`, committing under `bucket`/`key`
    #[must_use]
    pub fn new(
        inner: ChunkStream,
        writer: BlobWriter,
        bucket: String,
        key: TransactionKey,
        status: u16,
        headers: Vec<(String, Vec<u8>)>,
    ) -> Self {
        Self {
            inner,
            writer: Some(writer),
            bucket,
            key,
            status,
            headers,
        }
    }

    /// Commit the blob on a blocking thread when a runtime is available
    ///
    /// The writer keeps its pending-write slot until the commit finishes, so
    /// `Archive::drain` waits for it.
    fn finish(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let bucket = std::mem::take(&mut self.bucket);
        let headers = std::mem::take(&mut self.headers);
        let (key, status) = (self.key, self.status);
        let commit = move || {
            let len = writer.len();
            match writer.commit(&bucket, key, status, headers) {
                Ok(()) => debug!("recorded streamed body {} ({} bytes)", key, len),
                Err(e) => warn!("Failed to commit streamed body {}: {}", key, e),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(commit);
            }
            Err(_) => commit(),
        }
    }
}

impl Stream for RecordingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(writer) = this.writer.as_mut() {
                    if let Err(e) = writer.write_chunk(&chunk) {
                        warn!("Dropping recording of {}: {}", this.key, e);
                        this.writer = None;
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(writer) = this.writer.take() {
                    debug!("upstream body failed, discarding {}: {}", this.key, e);
                    writer.abort();
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
