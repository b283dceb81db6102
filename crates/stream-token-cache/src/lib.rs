//! Token-addressed fetch-through media cache
//!
//! Mints short-lived stream tokens for backing-store references, retrieves
//! each reference at most once per entry, publishes it atomically on disk,
//! serves byte ranges from the local copy and reclaims everything once the
//! token's TTL has elapsed.

mod backing;
mod error;
mod fetch;
mod range;
mod registry;
mod service;
mod store;
mod streamer;
mod sweeper;
#[cfg(test)]
mod testing;
mod types;

pub use backing::{media_type_matches, BackingStore, ByteStream, RetrievedMedia};
pub use error::{BackingStoreError, FetchFailure, Result, StreamError};
pub use fetch::FetchCoordinator;
pub use range::{parse_range, ByteRange};
pub use registry::TokenRegistry;
pub use service::{CacheSettings, StreamService};
pub use store::ArtifactStore;
pub use streamer::{RangeResponse, RangeStreamer, CHUNK_SIZE};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use types::{
    Artifact, CacheStats, Entry, EntryState, Minted, SharedFetch, SourceRef,
    StreamToken,
};
