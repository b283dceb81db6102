//! HTTP backing store for the stream token cache
//!
//! Retrieves media objects from an origin that addresses them by numeric
//! reference, with bounded concurrency and a minimum spacing between
//! requests so the origin's rate limits are respected.

mod client;
mod error;

pub use client::{OriginClient, OriginConfig};
pub use error::{OriginError, Result};
