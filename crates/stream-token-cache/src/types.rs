//! Cache types

use crate::error::FetchFailure;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Opaque numeric reference into the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(pub u64);

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SourceRef {
    fn from(value: u64) -> Self {
        SourceRef(value)
    }
}

/// Externally visible handle for a cached reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamToken(String);

impl StreamToken {
    /// Derive the token for a reference.
    ///
    /// The same salt and reference always produce the same token, so minting
    /// a reference twice while its entry is alive hands out one handle.
    pub fn derive(salt: &str, reference: SourceRef) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", salt, reference).as_bytes());
        StreamToken(hex::encode(hasher.finalize()))
    }

    /// Wrap a token received from a client.
    ///
    /// Returns `None` for anything that could not have been produced by
    /// [`StreamToken::derive`].
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Some(StreamToken(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully materialized artifact on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
}

/// Completion of an in-flight retrieval, shared by every waiter on the entry
pub type SharedFetch = Shared<BoxFuture<'static, Result<Artifact, FetchFailure>>>;

/// Fetch state of an entry
#[derive(Clone)]
pub enum EntryState {
    /// No retrieval has started yet
    Pending,
    /// A single retrieval owns the entry; waiters await the shared completion
    Fetching(SharedFetch),
    /// The artifact is published and verified
    Ready(Artifact),
    /// Terminal failure for this entry
    Failed(FetchFailure),
}

impl EntryState {
    pub fn label(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Fetching(_) => "fetching",
            EntryState::Ready(_) => "ready",
            EntryState::Failed(_) => "failed",
        }
    }
}

impl fmt::Debug for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::Pending => f.write_str("Pending"),
            EntryState::Fetching(_) => f.write_str("Fetching"),
            EntryState::Ready(artifact) => f.debug_tuple("Ready").field(artifact).finish(),
            EntryState::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Cached state for one live token
#[derive(Debug, Clone)]
pub struct Entry {
    pub token: StreamToken,
    pub source_ref: SourceRef,
    /// Distinguishes this entry from earlier or later entries for the same token
    pub generation: u64,
    pub state: EntryState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Entry {
    /// Expiry is the only gate for reads; on-disk presence never extends it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match &self.state {
            EntryState::Ready(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// Result of minting a token for a reference
#[derive(Debug, Clone, Serialize)]
pub struct Minted {
    pub token: StreamToken,
    pub expires_at: DateTime<Utc>,
    /// True when an existing live entry was returned
    pub reused: bool,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub fetching: usize,
    pub ready: usize,
    pub failed: usize,
    pub total_size: u64,
    pub fetches_started: u64,
    pub fetches_failed: u64,
}
