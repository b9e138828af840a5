//! Deterministic stand-ins for the external collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{BalerError, Result};
use crate::indexer::source::DocumentSource;
use crate::models::{IndexEntry, RawDocument, ScoredFragment};
use crate::rag::embeddings::Embedder;
use crate::rag::filter::MetadataFilter;
use crate::rag::memory_store::MemoryIndex;
use crate::rag::narrator::{NarrativeStyle, Narrator};
use crate::rag::vector_store::VectorIndex;
use crate::retry::RetryPolicy;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        attempt_timeout_ms: 1_000,
    }
}

pub fn at_hour(hour: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(hour)
}

pub fn document(source_id: &str, artist: &str, title: &str, body: &str, hour: i64) -> RawDocument {
    RawDocument {
        source_id: source_id.into(),
        album_identifier: String::new(),
        artist: artist.into(),
        album_title: title.into(),
        publication_date: None,
        body_text: body.into(),
        scrape_timestamp: at_hour(hour),
    }
    .with_derived_album_identifier()
}

/// Maps text to vectors by marker substring; unmatched text lands on the
/// last axis. Texts containing a failure marker make the whole call fail.
pub struct ScriptedEmbedder {
    dimension: usize,
    model_version: String,
    rules: Vec<(String, Vec<f32>)>,
    failing: Vec<String>,
    embedded: Mutex<Vec<String>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_version: "test-model".into(),
            rules: Vec::new(),
            failing: Vec::new(),
            embedded: Mutex::new(Vec::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn rule(mut self, marker: &str, vector: Vec<f32>) -> Self {
        self.rules.push((marker.into(), vector));
        self
    }

    pub fn fail_on(mut self, marker: &str) -> Self {
        self.failing.push(marker.into());
        self
    }

    pub fn with_model_version(mut self, version: &str) -> Self {
        self.model_version = version.into();
        self
    }

    /// Every call sleeps this long, so overlapping calls are observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Most calls that were ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded.lock().unwrap().clone()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        self.rules
            .iter()
            .find(|(marker, _)| text.contains(marker.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| {
                let mut v = vec![0.0; self.dimension];
                v[self.dimension - 1] = 1.0;
                v
            })
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(marker) = self
            .failing
            .iter()
            .find(|m| texts.iter().any(|t| t.contains(m.as_str())))
        {
            return Err(BalerError::transient("embedding", format!("scripted failure on {}", marker)));
        }
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

#[derive(Default)]
pub struct MemorySource {
    documents: Mutex<Vec<RawDocument>>,
    failures: AtomicUsize,
}

impl MemorySource {
    pub fn new(documents: Vec<RawDocument>) -> Self {
        Self {
            documents: Mutex::new(documents),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn replace(&self, documents: Vec<RawDocument>) {
        *self.documents.lock().unwrap() = documents;
    }

    pub fn fail_next(&self, times: usize) {
        self.failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> Result<Vec<RawDocument>> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BalerError::transient("document fetch", "archive unavailable"));
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|d| watermark.map_or(true, |w| d.scrape_timestamp > w))
            .cloned()
            .collect())
    }
}

/// Memory index whose next `n` upserts fail transiently.
#[derive(Default)]
pub struct FlakyIndex {
    pub inner: MemoryIndex,
    upsert_failures: AtomicUsize,
}

impl FlakyIndex {
    pub fn failing_upserts(times: usize) -> Self {
        Self {
            inner: MemoryIndex::new(),
            upsert_failures: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        if self
            .upsert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BalerError::transient("vector upsert", "store unavailable"));
        }
        self.inner.upsert(entries).await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredFragment>> {
        self.inner.query(vector, k, filter).await
    }

    async fn exists(&self, ids: &[String]) -> Result<HashSet<String>> {
        self.inner.exists(ids).await
    }

    async fn delete_superseded(&self, source_id: &str, keep: &[String]) -> Result<usize> {
        self.inner.delete_superseded(source_id, keep).await
    }

    async fn probe_model_version(&self) -> Result<Option<String>> {
        self.inner.probe_model_version().await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

pub struct StubNarrator {
    reply: Option<String>,
    delay: Duration,
}

impl StubNarrator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: Duration::ZERO,
        }
    }

    pub fn stalled(delay: Duration) -> Self {
        Self {
            reply: Some("too late".into()),
            delay,
        }
    }
}

#[async_trait]
impl Narrator for StubNarrator {
    async fn narrate(
        &self,
        query: &str,
        fragments: &[ScoredFragment],
        style: NarrativeStyle,
    ) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        match &self.reply {
            Some(reply) => Ok(format!("{} [{:?}] {} ({} excerpts)", reply, style, query, fragments.len())),
            None => Err(BalerError::transient("chat completion", "gateway down")),
        }
    }
}
