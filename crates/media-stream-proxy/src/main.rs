//! Media Stream Proxy - time-bounded, range-seekable access to origin media
//!
//! Mints short-lived stream tokens for origin references, fetches each
//! object once into a local cache and serves it with byte-range support
//! until the token expires.

mod error;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use media_origin_client::{OriginClient, OriginConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_token_cache::{CacheSettings, StreamService};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("media_stream_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Media Stream Proxy...");

    let config = load_config()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Token TTL: {} seconds", config.token_ttl_secs);
    info!("Sweep interval: {} seconds", config.sweep_interval_secs);
    info!("Public URL: {}", config.public_url);

    let origin = OriginClient::new(OriginConfig {
        url_template: config.origin_url.clone(),
        auth_token: config.origin_auth_token.clone(),
        max_concurrent: config.origin_max_concurrent,
        min_interval: Duration::from_millis(config.origin_min_interval_ms),
        read_timeout: Duration::from_secs(config.origin_timeout_secs),
        ..OriginConfig::default()
    })?;

    let service = StreamService::new(
        Arc::new(origin),
        CacheSettings {
            cache_dir: config.cache_dir.clone(),
            ttl: Duration::from_secs(config.token_ttl_secs),
            accepted_media_type: config.accepted_media_type.clone(),
            token_salt: config.token_salt.clone(),
        },
    );
    service.init().await?;

    let sweeper = service
        .sweeper()
        .spawn(Duration::from_secs(config.sweep_interval_secs));

    let state: SharedState = Arc::new(ServerState::new(service, config.public_url));

    // Start HTTP server (blocking)
    let served = start_server(state, config.port).await;
    sweeper.abort();
    served.map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

fn load_config() -> Result<ProxyConfig> {
    config_from(|key| std::env::var(key).ok())
}

fn config_from(var: impl Fn(&str) -> Option<String>) -> Result<ProxyConfig> {
    let defaults = ProxyConfig::default();

    let port = var("PORT")
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let cache_dir = var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let token_ttl_secs = var("TOKEN_TTL_SECS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.token_ttl_secs);

    let sweep_interval_secs = var("SWEEP_INTERVAL_SECS")
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(defaults.sweep_interval_secs);

    let accepted_media_type = var("ACCEPTED_MEDIA_TYPE").unwrap_or(defaults.accepted_media_type);

    let public_url =
        var("PUBLIC_URL").unwrap_or_else(|| format!("http://localhost:{}", port));

    let token_salt = var("TOKEN_SALT").unwrap_or(defaults.token_salt);

    let origin_url = var("ORIGIN_URL")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::Config("ORIGIN_URL is not set".to_string()))?;

    let origin_auth_token = var("ORIGIN_AUTH_TOKEN").filter(|s| !s.is_empty());

    let origin_max_concurrent = var("ORIGIN_MAX_CONCURRENT")
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(defaults.origin_max_concurrent);

    let origin_min_interval_ms = var("ORIGIN_MIN_INTERVAL_MS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.origin_min_interval_ms);

    let origin_timeout_secs = var("ORIGIN_TIMEOUT_SECS")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.origin_timeout_secs);

    Ok(ProxyConfig {
        port,
        cache_dir,
        token_ttl_secs,
        sweep_interval_secs,
        accepted_media_type,
        public_url,
        token_salt,
        origin_url,
        origin_auth_token,
        origin_max_concurrent,
        origin_min_interval_ms,
        origin_timeout_secs,
    })
}
