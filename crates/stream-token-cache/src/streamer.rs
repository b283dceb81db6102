//! Partial-content delivery from published artifacts

use crate::backing::ByteStream;
use crate::error::{Result, StreamError};
use crate::fetch::FetchCoordinator;
use crate::range::{parse_range, ByteRange};
use crate::registry::TokenRegistry;
use crate::types::StreamToken;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Artifacts are delivered in blocks of this many bytes
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A response ready to be written to the client
pub struct RangeResponse {
    /// Requested range, `None` for the whole artifact
    pub range: Option<ByteRange>,
    pub size: u64,
    pub body: ByteStream,
}

impl RangeResponse {
    pub fn status_code(&self) -> u16 {
        if self.range.is_some() {
            206
        } else {
            200
        }
    }

    /// Exact number of bytes `body` yields
    pub fn content_length(&self) -> u64 {
        self.range.map(|r| r.length()).unwrap_or(self.size)
    }

    pub fn content_range(&self) -> Option<String> {
        self.range.map(|r| r.content_range(self.size))
    }
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("range", &self.range)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct RangeStreamer {
    registry: Arc<TokenRegistry>,
    coordinator: FetchCoordinator,
}

impl RangeStreamer {
    pub fn new(registry: Arc<TokenRegistry>, coordinator: FetchCoordinator) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    /// Serve `token`, optionally restricted to the `Range` header value.
    pub async fn serve(&self, token: &StreamToken, range: Option<&str>) -> Result<RangeResponse> {
        let entry = self
            .registry
            .get(token)
            .await
            .ok_or(StreamError::NotFound)?;
        if entry.is_expired_at(Utc::now()) {
            return Err(StreamError::Gone);
        }

        let handle = self.coordinator.ensure_ready(token).await?;
        let range = range
            .map(|header| parse_range(header, handle.size))
            .transpose()?;

        let mut file = match File::open(&handle.path).await {
            Ok(file) => file,
            // Evicted between ensure_ready and open
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StreamError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let on_disk = file.metadata().await?.len();
        if on_disk != handle.size {
            return Err(StreamError::Internal(format!(
                "artifact is {} bytes, expected {}",
                on_disk, handle.size
            )));
        }

        let (start, length) = match range {
            Some(r) => (r.start, r.length()),
            None => (0, handle.size),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        debug!(token = %token, start, length, size = handle.size, "Streaming artifact");

        Ok(RangeResponse {
            range,
            size: handle.size,
            body: read_chunks(file, length),
        })
    }
}

/// Lazily read exactly `length` bytes from the current position.
///
/// Ends with an error, never a short body, if the file runs out early.
pub fn read_chunks(file: File, length: u64) -> ByteStream {
    futures::stream::try_unfold((file, length), |(mut file, remaining)| async move {
        if remaining == 0 {
            return Ok::<_, io::Error>(None);
        }
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        let read = file.read(&mut buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("artifact ended with {} bytes undelivered", remaining),
            ));
        }
        buf.truncate(read);
        Ok(Some((Bytes::from(buf), (file, remaining - read as u64))))
    })
    .boxed()
}
