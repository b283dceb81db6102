//! Periodic eviction of expired entries and their artifacts

use crate::registry::TokenRegistry;
use crate::store::ArtifactStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one sweep cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries removed from the registry
    pub evicted: usize,
    /// Artifact files unlinked
    pub deleted: usize,
    /// Deletions that failed and will be retried next cycle
    pub failed: usize,
}

pub struct ExpirySweeper {
    registry: Arc<TokenRegistry>,
    store: Arc<ArtifactStore>,
    /// Artifacts of already-evicted entries that could not be unlinked yet
    retry: Mutex<Vec<PathBuf>>,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<TokenRegistry>, store: Arc<ArtifactStore>) -> Self {
        Self {
            registry,
            store,
            retry: Mutex::new(Vec::new()),
        }
    }

    /// Evict every entry whose `expires_at` has passed.
    ///
    /// The registry removal is the publication point; the artifact is
    /// unlinked right after. One failed unlink never stops the others.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut doomed: Vec<PathBuf> = std::mem::take(&mut *self.retry.lock().await);
        doomed.extend(self.registry.take_retired().await);

        for entry in self.registry.snapshot().await {
            if !entry.is_expired_at(now) {
                continue;
            }
            // Skip entries replaced since the snapshot was taken
            if self
                .registry
                .remove_generation(&entry.token, entry.generation)
                .await
                .is_none()
            {
                continue;
            }
            report.evicted += 1;
            debug!(token = %entry.token, state = entry.state.label(), "Evicted expired entry");
            doomed.push(self.store.artifact_path(&entry.token, entry.generation));
        }

        let mut failed = Vec::new();
        for path in doomed {
            match self.store.delete(&path).await {
                Ok(true) => {
                    report.deleted += 1;
                    info!(path = ?path, "Removed expired artifact");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove expired artifact");
                    failed.push(path);
                }
            }
        }
        report.failed = failed.len();
        self.retry.lock().await.extend(failed);

        report
    }

    /// Run `sweep_once` every `every` until the task is aborted
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.sweep_once(Utc::now()).await;
                if report != SweepReport::default() {
                    info!(
                        evicted = report.evicted,
                        deleted = report.deleted,
                        failed = report.failed,
                        "Expiry sweep finished"
                    );
                }
            }
        })
    }
}
