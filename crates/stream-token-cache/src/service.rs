//! Wiring of registry, coordinator, streamer and sweeper

use crate::backing::BackingStore;
use crate::error::Result;
use crate::fetch::FetchCoordinator;
use crate::registry::TokenRegistry;
use crate::store::ArtifactStore;
use crate::streamer::{RangeResponse, RangeStreamer};
use crate::sweeper::ExpirySweeper;
use crate::types::{CacheStats, Minted, SourceRef, StreamToken};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Tunables for a [`StreamService`]
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub cache_dir: PathBuf,
    /// Lifetime of a minted token
    pub ttl: Duration,
    /// The one media type that may be cached and served
    pub accepted_media_type: String,
    /// Mixed into token derivation so tokens cannot be guessed from references
    pub token_salt: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/streams"),
            ttl: Duration::from_secs(2 * 60 * 60),
            accepted_media_type: "audio/mpeg".to_string(),
            token_salt: String::new(),
        }
    }
}

pub struct StreamService {
    settings: CacheSettings,
    registry: Arc<TokenRegistry>,
    store: Arc<ArtifactStore>,
    coordinator: FetchCoordinator,
    streamer: RangeStreamer,
    sweeper: Arc<ExpirySweeper>,
}

impl StreamService {
    pub fn new(backing: Arc<dyn BackingStore>, settings: CacheSettings) -> Self {
        let registry = Arc::new(TokenRegistry::new(settings.token_salt.clone()));
        let store = Arc::new(ArtifactStore::new(settings.cache_dir.clone()));
        let coordinator = FetchCoordinator::new(
            registry.clone(),
            store.clone(),
            backing,
            &settings.accepted_media_type,
        );
        let streamer = RangeStreamer::new(registry.clone(), coordinator.clone());
        let sweeper = Arc::new(ExpirySweeper::new(registry.clone(), store.clone()));

        Self {
            settings,
            registry,
            store,
            coordinator,
            streamer,
            sweeper,
        }
    }

    /// Prepare the cache directory. Must run before the first `serve`.
    pub async fn init(&self) -> std::io::Result<()> {
        let purged = self.store.init().await?;
        info!(
            cache_dir = ?self.settings.cache_dir,
            purged,
            ttl_secs = self.settings.ttl.as_secs(),
            "Stream cache ready"
        );
        Ok(())
    }

    /// Mint (or reuse) the token for `reference`
    pub async fn mint(&self, reference: SourceRef) -> Result<Minted> {
        self.registry.put(reference, self.settings.ttl).await
    }

    pub async fn serve(&self, token: &StreamToken, range: Option<&str>) -> Result<RangeResponse> {
        self.streamer.serve(token, range).await
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            fetches_started: self.coordinator.fetches_started(),
            fetches_failed: self.coordinator.fetches_failed(),
            ..self.registry.stats().await
        }
    }

    pub fn sweeper(&self) -> Arc<ExpirySweeper> {
        self.sweeper.clone()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }
}
