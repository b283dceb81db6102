//! Single-flight retrieval from the backing store

use crate::backing::{media_type_matches, BackingStore};
use crate::error::{FetchFailure, Result, StreamError};
use crate::registry::TokenRegistry;
use crate::store::ArtifactStore;
use crate::types::{Artifact, EntryState, SharedFetch, SourceRef, StreamToken};
use chrono::Utc;
use futures::channel::oneshot;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// What a caller of `ensure_ready` has to do after inspecting the entry
enum Step {
    Ready(Artifact),
    Wait(SharedFetch),
    Own(FetchJob, SharedFetch),
}

struct FetchJob {
    token: StreamToken,
    source_ref: SourceRef,
    generation: u64,
    done: oneshot::Sender<std::result::Result<Artifact, FetchFailure>>,
}

/// Ensures at most one backing-store retrieval per pending entry.
///
/// The retrieval runs on its own task, so a caller that goes away does not
/// cancel it for the callers still waiting.
#[derive(Clone)]
pub struct FetchCoordinator {
    registry: Arc<TokenRegistry>,
    store: Arc<ArtifactStore>,
    backing: Arc<dyn BackingStore>,
    accepted_media_type: Arc<str>,
    started: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl FetchCoordinator {
    pub fn new(
        registry: Arc<TokenRegistry>,
        store: Arc<ArtifactStore>,
        backing: Arc<dyn BackingStore>,
        accepted_media_type: &str,
    ) -> Self {
        Self {
            registry,
            store,
            backing,
            accepted_media_type: Arc::from(accepted_media_type),
            started: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of retrievals started since creation
    pub fn fetches_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn fetches_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait until the entry behind `token` has a published artifact.
    ///
    /// A pending entry is claimed by the first caller and fetched; everyone
    /// else awaits the same completion. A failed entry returns its stored
    /// error without retrying.
    pub async fn ensure_ready(&self, token: &StreamToken) -> Result<Artifact> {
        let now = Utc::now();
        let step = self
            .registry
            .update(token, |entry| {
                if entry.is_expired_at(now) {
                    return Err(StreamError::Gone);
                }
                match &entry.state {
                    EntryState::Ready(artifact) => Ok(Step::Ready(artifact.clone())),
                    EntryState::Failed(failure) => Err(failure.clone().into()),
                    EntryState::Fetching(shared) => Ok(Step::Wait(shared.clone())),
                    EntryState::Pending => {
                        let (done, completion) = oneshot::channel();
                        let shared = completion
                            .map(|outcome| {
                                outcome.unwrap_or_else(|_| {
                                    Err(FetchFailure::Internal(
                                        "retrieval ended without a result".to_string(),
                                    ))
                                })
                            })
                            .boxed()
                            .shared();
                        entry.state = EntryState::Fetching(shared.clone());
                        let job = FetchJob {
                            token: entry.token.clone(),
                            source_ref: entry.source_ref,
                            generation: entry.generation,
                            done,
                        };
                        Ok(Step::Own(job, shared))
                    }
                }
            })
            .await
            .ok_or(StreamError::NotFound)??;

        match step {
            Step::Ready(artifact) => Ok(artifact),
            Step::Wait(shared) => {
                debug!(token = %token, "Waiting on in-flight retrieval");
                Ok(shared.await?)
            }
            Step::Own(job, shared) => {
                self.spawn_fetch(job);
                Ok(shared.await?)
            }
        }
    }

    fn spawn_fetch(&self, job: FetchJob) {
        let coordinator = self.clone();
        let span = tracing::info_span!(
            "fetch",
            token = %job.token,
            reference = %job.source_ref,
            generation = job.generation
        );
        tokio::spawn(
            async move {
                coordinator.started.fetch_add(1, Ordering::Relaxed);
                // A panicking backing store must still leave the entry terminal
                let outcome = AssertUnwindSafe(coordinator.retrieve(&job))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(FetchFailure::Internal("retrieval panicked".to_string()))
                    });
                let outcome = coordinator.settle(&job, outcome).await;
                if outcome.is_err() {
                    coordinator.failed.fetch_add(1, Ordering::Relaxed);
                }
                // Waiters may all be gone; the registry already holds the result.
                let _ = job.done.send(outcome);
            }
            .instrument(span),
        );
    }

    async fn retrieve(&self, job: &FetchJob) -> std::result::Result<Artifact, FetchFailure> {
        let media = self.backing.retrieve(job.source_ref).await?;

        if !media_type_matches(&media.media_type, &self.accepted_media_type) {
            return Err(FetchFailure::UnsupportedMedia(media.media_type));
        }

        let path = self.store.artifact_path(&job.token, job.generation);
        let size = self
            .store
            .materialize(&path, media.body, media.content_length)
            .await?;

        Ok(Artifact { path, size })
    }

    /// Publish the outcome to the registry before waiters see it.
    async fn settle(
        &self,
        job: &FetchJob,
        outcome: std::result::Result<Artifact, FetchFailure>,
    ) -> std::result::Result<Artifact, FetchFailure> {
        let recorded = self
            .registry
            .complete(&job.token, job.generation, outcome.clone())
            .await;

        match outcome {
            Ok(artifact) if recorded => {
                info!(size = artifact.size, "Artifact ready");
                Ok(artifact)
            }
            Ok(artifact) => {
                // Entry was swept or replaced while we were fetching.
                if let Err(e) = self.store.delete(&artifact.path).await {
                    warn!(path = ?artifact.path, error = %e, "Failed to delete orphaned artifact");
                }
                debug!("Entry evicted during retrieval, artifact discarded");
                Err(FetchFailure::Evicted)
            }
            Err(failure) => {
                warn!(error = %failure, "Retrieval failed");
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackingStore;
    use std::time::Duration;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<TokenRegistry>,
        store: Arc<ArtifactStore>,
        coordinator: FetchCoordinator,
    }

    async fn fixture(backing: Arc<MemoryBackingStore>) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(TokenRegistry::new("test"));
        let store = Arc::new(ArtifactStore::new(dir.path().to_path_buf()));
        store.init().await.unwrap();
        let coordinator =
            FetchCoordinator::new(registry.clone(), store.clone(), backing, "audio/mpeg");
        Fixture {
            _dir: dir,
            registry,
            store,
            coordinator,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_fetch_once() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(1), "audio/mpeg", payload.clone())
                .with_delay(Duration::from_millis(100)),
        );
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(1), HOUR).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let coordinator = fx.coordinator.clone();
            let token = minted.token.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_ready(&token).await
            }));
        }

        for handle in handles {
            let artifact = handle.await.unwrap().unwrap();
            assert_eq!(artifact.size, payload.len() as u64);
            // Every reader sees the complete published file
            let on_disk = tokio::fs::read(&artifact.path).await.unwrap();
            assert_eq!(on_disk.len() as u64, artifact.size);
        }

        assert_eq!(backing.calls(), 1);
        assert_eq!(fx.coordinator.fetches_started(), 1);
    }

    #[tokio::test]
    async fn test_ready_entry_returns_without_fetching() {
        let backing = Arc::new(MemoryBackingStore::new().with_object(
            SourceRef(2),
            "audio/mpeg",
            b"0123456789".to_vec(),
        ));
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(2), HOUR).await.unwrap();

        let first = fx.coordinator.ensure_ready(&minted.token).await.unwrap();
        let second = fx.coordinator.ensure_ready(&minted.token).await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(backing.calls(), 1);
        assert!(matches!(
            fx.registry.get(&minted.token).await.unwrap().state,
            EntryState::Ready(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_media_type_fails_without_writing() {
        let backing = Arc::new(MemoryBackingStore::new().with_object(
            SourceRef(3),
            "video/mp4",
            vec![0u8; 64],
        ));
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(3), HOUR).await.unwrap();

        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedMedia(ref kind) if kind == "video/mp4"));

        let mut dir = tokio::fs::read_dir(fx.store.cache_dir()).await.unwrap();
        assert!(dir.next_entry().await.unwrap().is_none());

        // Failure is terminal: no second retrieval
        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedMedia(_)));
        assert_eq!(backing.calls(), 1);
        assert_eq!(fx.coordinator.fetches_failed(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_needs_remint() {
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(4), "audio/mpeg", b"abc".to_vec())
                .failing_first(1),
        );
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(4), HOUR).await.unwrap();

        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::BackingStoreTransient(_)));
        assert!(fx.coordinator.ensure_ready(&minted.token).await.is_err());
        assert_eq!(backing.calls(), 1);

        let again = fx.registry.put(SourceRef(4), HOUR).await.unwrap();
        assert_eq!(again.token, minted.token);
        let artifact = fx.coordinator.ensure_ready(&again.token).await.unwrap();
        assert_eq!(artifact.size, 3);
        assert_eq!(backing.calls(), 2);
    }

    #[tokio::test]
    async fn test_truncated_body_is_never_published() {
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(5), "audio/mpeg", vec![7u8; 100])
                .declaring_length(200),
        );
        let fx = fixture(backing).await;
        let minted = fx.registry.put(SourceRef(5), HOUR).await.unwrap();

        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::BackingStoreTransient(_)));

        let generation = fx.registry.get(&minted.token).await.unwrap().generation;
        assert!(!fx.store.artifact_path(&minted.token, generation).exists());
    }

    #[tokio::test]
    async fn test_missing_object_maps_to_not_found() {
        let backing = Arc::new(MemoryBackingStore::new());
        let fx = fixture(backing).await;
        let minted = fx.registry.put(SourceRef(6), HOUR).await.unwrap();

        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::NotFound));
    }

    #[tokio::test]
    async fn test_unknown_and_expired_tokens() {
        let backing = Arc::new(MemoryBackingStore::new().with_object(
            SourceRef(7),
            "audio/mpeg",
            b"x".to_vec(),
        ));
        let fx = fixture(backing.clone()).await;

        let unknown = fx.registry.token_for(SourceRef(8));
        assert!(matches!(
            fx.coordinator.ensure_ready(&unknown).await,
            Err(StreamError::NotFound)
        ));

        let minted = fx.registry.put(SourceRef(7), Duration::ZERO).await.unwrap();
        assert!(matches!(
            fx.coordinator.ensure_ready(&minted.token).await,
            Err(StreamError::Gone)
        ));
        assert_eq!(backing.calls(), 0);
    }

    #[tokio::test]
    async fn test_eviction_during_fetch_discards_artifact() {
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(9), "audio/mpeg", vec![1u8; 32])
                .with_delay(Duration::from_millis(100)),
        );
        let fx = fixture(backing).await;
        let minted = fx.registry.put(SourceRef(9), HOUR).await.unwrap();
        let generation = fx.registry.get(&minted.token).await.unwrap().generation;

        let coordinator = fx.coordinator.clone();
        let token = minted.token.clone();
        let pending = tokio::spawn(async move { coordinator.ensure_ready(&token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.registry.remove(&minted.token).await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Gone));
        assert!(!fx.store.artifact_path(&minted.token, generation).exists());
    }

    #[tokio::test]
    async fn test_panicking_backing_store_leaves_entry_failed() {
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(11), "audio/mpeg", vec![3u8; 8])
                .panicking_first(1),
        );
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(11), HOUR).await.unwrap();

        let err = fx.coordinator.ensure_ready(&minted.token).await.unwrap_err();
        assert!(matches!(err, StreamError::Internal(_)));
        assert!(matches!(
            fx.registry.get(&minted.token).await.unwrap().state,
            EntryState::Failed(FetchFailure::Internal(_))
        ));
        assert_eq!(fx.coordinator.fetches_failed(), 1);

        let again = fx.registry.put(SourceRef(11), HOUR).await.unwrap();
        assert!(!again.reused);
        let artifact = fx.coordinator.ensure_ready(&again.token).await.unwrap();
        assert_eq!(artifact.size, 8);
        assert_eq!(backing.calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_retrieval() {
        let backing = Arc::new(
            MemoryBackingStore::new()
                .with_object(SourceRef(10), "audio/mpeg", vec![2u8; 16])
                .with_delay(Duration::from_millis(50)),
        );
        let fx = fixture(backing.clone()).await;
        let minted = fx.registry.put(SourceRef(10), HOUR).await.unwrap();

        // The owning caller gives up almost immediately
        let _ = tokio::time::timeout(
            Duration::from_millis(5),
            fx.coordinator.ensure_ready(&minted.token),
        )
        .await;

        let artifact = fx.coordinator.ensure_ready(&minted.token).await.unwrap();
        assert_eq!(artifact.size, 16);
        assert_eq!(backing.calls(), 1);
    }
}
