//! Error types for the stream token cache

use std::fmt;

/// Errors reported by a [`BackingStore`](crate::BackingStore)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingStoreError {
    /// The reference does not resolve to a media object
    NotFound,
    /// The object exists but is not of a kind the store will hand out
    WrongType(String),
    /// Network failure, rate limiting or a timeout
    Transient(String),
    Fatal(String),
}

impl fmt::Display for BackingStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingStoreError::NotFound => write!(f, "Object not found"),
            BackingStoreError::WrongType(kind) => write!(f, "Wrong object type: {}", kind),
            BackingStoreError::Transient(msg) => write!(f, "Transient backing store error: {}", msg),
            BackingStoreError::Fatal(msg) => write!(f, "Backing store error: {}", msg),
        }
    }
}

impl std::error::Error for BackingStoreError {}

/// Terminal outcome of a failed retrieval, stored on the entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    NotFound,
    UnsupportedMedia(String),
    Transient(String),
    Internal(String),
    /// The entry was evicted or replaced before the retrieval finished
    Evicted,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::NotFound => write!(f, "Object not found in backing store"),
            FetchFailure::UnsupportedMedia(kind) => write!(f, "Unsupported media type: {}", kind),
            FetchFailure::Transient(msg) => write!(f, "Retrieval failed: {}", msg),
            FetchFailure::Internal(msg) => write!(f, "Internal error: {}", msg),
            FetchFailure::Evicted => write!(f, "Entry evicted during retrieval"),
        }
    }
}

impl From<BackingStoreError> for FetchFailure {
    fn from(err: BackingStoreError) -> Self {
        match err {
            BackingStoreError::NotFound => FetchFailure::NotFound,
            BackingStoreError::WrongType(kind) => FetchFailure::UnsupportedMedia(kind),
            BackingStoreError::Transient(msg) => FetchFailure::Transient(msg),
            BackingStoreError::Fatal(msg) => FetchFailure::Internal(msg),
        }
    }
}

#[derive(Debug)]
pub enum StreamError {
    /// Token never minted, or its entry is gone
    NotFound,
    /// Token TTL elapsed
    Gone,
    UnsupportedMedia(String),
    RangeNotSatisfiable { size: u64 },
    BackingStoreTransient(String),
    Internal(String),
    Io(Box<std::io::Error>),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::NotFound => write!(f, "Stream not found"),
            StreamError::Gone => write!(f, "Stream expired"),
            StreamError::UnsupportedMedia(kind) => write!(f, "Unsupported media type: {}", kind),
            StreamError::RangeNotSatisfiable { size } => {
                write!(f, "Range not satisfiable for {} bytes", size)
            }
            StreamError::BackingStoreTransient(msg) => write!(f, "Backing store error: {}", msg),
            StreamError::Internal(msg) => write!(f, "Internal error: {}", msg),
            StreamError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<FetchFailure> for StreamError {
    fn from(failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::NotFound => StreamError::NotFound,
            FetchFailure::UnsupportedMedia(kind) => StreamError::UnsupportedMedia(kind),
            FetchFailure::Transient(msg) => StreamError::BackingStoreTransient(msg),
            FetchFailure::Internal(msg) => StreamError::Internal(msg),
            FetchFailure::Evicted => StreamError::Gone,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
