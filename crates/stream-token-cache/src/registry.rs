//! Token to entry mapping and entry lifecycle

use crate::error::{FetchFailure, Result, StreamError};
use crate::types::{Artifact, CacheStats, Entry, EntryState, Minted, SourceRef, StreamToken};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

struct Entries {
    by_token: HashMap<StreamToken, Entry>,
    next_generation: u64,
    /// Artifacts of ready entries that a re-mint replaced before the sweep
    retired: Vec<PathBuf>,
}

/// Owns every live entry.
///
/// Every critical section is plain map or struct assignment. Nothing holds
/// the lock across I/O.
pub struct TokenRegistry {
    entries: RwLock<Entries>,
    salt: String,
}

impl TokenRegistry {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            entries: RwLock::new(Entries {
                by_token: HashMap::new(),
                next_generation: 1,
                retired: Vec::new(),
            }),
            salt: salt.into(),
        }
    }

    /// Token that `reference` maps to under this registry's salt
    pub fn token_for(&self, reference: SourceRef) -> StreamToken {
        StreamToken::derive(&self.salt, reference)
    }

    /// Mint a token for `reference`.
    ///
    /// A live, non-failed entry for the reference is returned unchanged. An
    /// expired or failed one is replaced by a fresh pending entry.
    pub async fn put(&self, reference: SourceRef, ttl: Duration) -> Result<Minted> {
        self.put_at(reference, ttl, Utc::now()).await
    }

    pub(crate) async fn put_at(
        &self,
        reference: SourceRef,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Minted> {
        let token = self.token_for(reference);
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.by_token.get(&token) {
            if existing.source_ref != reference {
                return Err(StreamError::Internal(format!(
                    "token collision between references {} and {}",
                    existing.source_ref, reference
                )));
            }
            // A fetch that resolved without reaching the registry is as dead as a failure
            let failed = match &existing.state {
                EntryState::Failed(_) => true,
                EntryState::Fetching(shared) => shared.peek().is_some(),
                _ => false,
            };
            if !failed && !existing.is_expired_at(now) {
                return Ok(Minted {
                    token,
                    expires_at: existing.expires_at,
                    reused: true,
                });
            }
        }

        let stale = entries
            .by_token
            .get(&token)
            .and_then(|old| old.artifact())
            .map(|artifact| artifact.path.clone());
        entries.retired.extend(stale);

        let generation = entries.next_generation;
        entries.next_generation += 1;

        let expires_at = expiry_after(now, ttl);
        entries.by_token.insert(
            token.clone(),
            Entry {
                token: token.clone(),
                source_ref: reference,
                generation,
                state: EntryState::Pending,
                created_at: now,
                expires_at,
            },
        );
        debug!(token = %token, reference = %reference, generation, %expires_at, "Minted stream token");

        Ok(Minted {
            token,
            expires_at,
            reused: false,
        })
    }

    /// Look up an entry without touching its TTL or state
    pub async fn get(&self, token: &StreamToken) -> Option<Entry> {
        self.entries.read().await.by_token.get(token).cloned()
    }

    /// Remove whatever entry currently holds `token`
    pub async fn remove(&self, token: &StreamToken) -> Option<Entry> {
        self.entries.write().await.by_token.remove(token)
    }

    /// Remove the entry only if it is still the given generation
    pub async fn remove_generation(&self, token: &StreamToken, generation: u64) -> Option<Entry> {
        let mut entries = self.entries.write().await;
        match entries.by_token.get(token) {
            Some(entry) if entry.generation == generation => entries.by_token.remove(token),
            _ => None,
        }
    }

    /// Drain artifact paths orphaned by replacing a ready entry
    pub(crate) async fn take_retired(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.entries.write().await.retired)
    }

    pub async fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().await.by_token.values().cloned().collect()
    }

    /// Run `f` on the entry under the write lock.
    ///
    /// `f` must not block; it is how the coordinator performs its
    /// check-and-transition atomically.
    pub(crate) async fn update<R>(
        &self,
        token: &StreamToken,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write().await;
        entries.by_token.get_mut(token).map(f)
    }

    /// Record the outcome of a retrieval.
    ///
    /// Returns false when the entry was evicted or replaced in the meantime,
    /// in which case nothing is changed.
    pub(crate) async fn complete(
        &self,
        token: &StreamToken,
        generation: u64,
        outcome: std::result::Result<Artifact, FetchFailure>,
    ) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.by_token.get_mut(token) else {
            return false;
        };
        if entry.generation != generation || !matches!(entry.state, EntryState::Fetching(_)) {
            return false;
        }
        entry.state = match outcome {
            Ok(artifact) => EntryState::Ready(artifact),
            Err(failure) => EntryState::Failed(failure),
        };
        true
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let mut stats = CacheStats {
            entries: entries.by_token.len(),
            ..CacheStats::default()
        };
        for entry in entries.by_token.values() {
            match &entry.state {
                EntryState::Pending => stats.pending += 1,
                EntryState::Fetching(_) => stats.fetching += 1,
                EntryState::Ready(artifact) => {
                    stats.ready += 1;
                    stats.total_size += artifact.size;
                }
                EntryState::Failed(_) => stats.failed += 1,
            }
        }
        stats
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
