//! In-memory backing store for tests

use crate::backing::{BackingStore, RetrievedMedia};
use crate::error::BackingStoreError;
use crate::types::SourceRef;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const CHUNK: usize = 4096;

#[derive(Default)]
pub(crate) struct MemoryBackingStore {
    objects: HashMap<SourceRef, (String, Vec<u8>)>,
    delay: Duration,
    failures: AtomicUsize,
    panics: AtomicUsize,
    declared_length: Option<u64>,
    calls: AtomicUsize,
}

impl MemoryBackingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_object(
        mut self,
        reference: SourceRef,
        media_type: &str,
        data: Vec<u8>,
    ) -> Self {
        self.objects
            .insert(reference, (media_type.to_string(), data));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `n` retrievals fail with a transient error
    pub(crate) fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// The first `n` retrievals panic
    pub(crate) fn panicking_first(self, n: usize) -> Self {
        self.panics.store(n, Ordering::SeqCst);
        self
    }

    /// Declare a length that differs from the stored data
    pub(crate) fn declaring_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn retrieve(&self, reference: SourceRef) -> Result<RetrievedMedia, BackingStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let panics = self.panics.load(Ordering::SeqCst);
        if panics > 0 {
            self.panics.store(panics - 1, Ordering::SeqCst);
            panic!("backing store blew up");
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackingStoreError::Transient("rate limited".to_string()));
        }

        let (media_type, data) = self
            .objects
            .get(&reference)
            .cloned()
            .ok_or(BackingStoreError::NotFound)?;

        let content_length = self.declared_length.or(Some(data.len() as u64));
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        Ok(RetrievedMedia {
            media_type,
            content_length,
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}
