//! The slow, rate-limited store the cache fetches through to

use crate::error::BackingStoreError;
use crate::types::SourceRef;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Lazy byte stream, used both for retrieval bodies and for range delivery
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A media object opened for reading
pub struct RetrievedMedia {
    /// Declared MIME type, possibly with parameters
    pub media_type: String,
    /// Declared length, checked against the bytes actually received
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RetrievedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievedMedia")
            .field("media_type", &self.media_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Open the object behind `reference`.
    async fn retrieve(&self, reference: SourceRef) -> Result<RetrievedMedia, BackingStoreError>;
}

/// Compare MIME types by essence, ignoring parameters and case.
pub fn media_type_matches(declared: &str, accepted: &str) -> bool {
    let essence = declared.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case(accepted.trim())
}
