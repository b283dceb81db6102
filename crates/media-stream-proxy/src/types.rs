//! Core types for the media stream proxy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use stream_token_cache::{CacheStats, SourceRef, StreamToken};

/// Configuration for the stream proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub token_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub accepted_media_type: String,
    /// Base URL put in front of `/stream/{token}` when minting
    pub public_url: String,
    pub token_salt: String,
    pub origin_url: String,
    pub origin_auth_token: Option<String>,
    pub origin_max_concurrent: usize,
    pub origin_min_interval_ms: u64,
    pub origin_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            cache_dir: PathBuf::from("./cache/streams"),
            token_ttl_secs: 2 * 60 * 60, // 2 hours
            sweep_interval_secs: 5 * 60, // 5 minutes
            accepted_media_type: "audio/mpeg".to_string(),
            public_url: "http://localhost:10000".to_string(),
            token_salt: String::new(),
            origin_url: String::new(),
            origin_auth_token: None,
            origin_max_concurrent: 1,
            origin_min_interval_ms: 500,
            origin_timeout_secs: 60,
        }
    }
}

/// Body of `POST /mint`
#[derive(Debug, Deserialize)]
pub struct MintRequest {
    pub reference: SourceRef,
}

/// Response of `POST /mint`
#[derive(Debug, Serialize)]
pub struct MintResponse {
    pub token: StreamToken,
    pub stream_url: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub reused: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
