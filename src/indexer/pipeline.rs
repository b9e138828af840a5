use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::chunker::Chunker;
use super::cursor::IngestCursor;
use super::source::DocumentSource;
use crate::error::{BalerError, Result};
use crate::models::{Fragment, FragmentMetadata, IndexEntry, RawDocument};
use crate::rag::embeddings::{check_vectors, Embedder};
use crate::rag::vector_store::VectorIndex;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Fetch,
    Dedupe,
    Chunk,
    Embed,
    Upsert,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "FETCH",
            Self::Dedupe => "DEDUPE",
            Self::Chunk => "CHUNK",
            Self::Embed => "EMBED",
            Self::Upsert => "UPSERT",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Documents embedded in parallel.
    pub concurrency: usize,
    pub embed_batch_size: usize,
    pub upsert_batch_size: usize,
    pub exists_batch_size: usize,
    pub fetch_retry: RetryPolicy,
    pub embed_retry: RetryPolicy,
    pub index_retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            embed_batch_size: 32,
            upsert_batch_size: 128,
            exists_batch_size: 256,
            fetch_retry: RetryPolicy::default(),
            embed_retry: RetryPolicy::default(),
            index_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub source_id: String,
    pub stage: RunState,
    pub reason: String,
    /// Retryable failures hold the cursor back so the document is fetched again.
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub fetched: usize,
    pub skipped_invalid: usize,
    pub documents: usize,
    pub unchanged_documents: usize,
    pub candidate_fragments: usize,
    pub new_fragments: usize,
    pub embedded: usize,
    pub upserted: usize,
    pub superseded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    /// Cursor to persist: advanced on `Done`, the input cursor on `Failed`.
    pub cursor: IngestCursor,
    pub stats: RunStats,
    pub document_failures: Vec<DocumentFailure>,
    /// Fragments embedded but not written when the run failed.
    pub pending_fragment_ids: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn new(cursor: IngestCursor) -> Self {
        let now = Utc::now();
        Self {
            state: RunState::Fetch,
            cursor,
            stats: RunStats::default(),
            document_failures: Vec::new(),
            pending_fragment_ids: Vec::new(),
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Hooks for progress reporting. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    fn stage(&self, _state: RunState) {}

    fn documents(&self, _total: usize) {}

    fn document_finished(&self, _source_id: &str, _succeeded: bool) {}
}

#[derive(Default)]
struct Watermarks {
    seen: Vec<DateTime<Utc>>,
    blocked_from: Option<DateTime<Utc>>,
}

impl Watermarks {
    fn block(&mut self, at: DateTime<Utc>) {
        self.blocked_from = Some(self.blocked_from.map_or(at, |b| b.min(at)));
    }

    /// Newest scrape time that is safe to skip on the next run.
    fn safe_watermark(&self) -> Option<DateTime<Utc>> {
        self.seen
            .iter()
            .filter(|t| self.blocked_from.map_or(true, |b| **t < b))
            .max()
            .copied()
    }
}

struct DocumentWork {
    document: RawDocument,
    fragment_ids: Vec<String>,
    pending: Vec<Fragment>,
}

struct Embedded {
    document: RawDocument,
    fragment_ids: Vec<String>,
    entries: Result<Vec<IndexEntry>>,
}

struct Prepared {
    document: RawDocument,
    fragment_ids: Vec<String>,
    entries: Vec<IndexEntry>,
}

pub struct IngestionPipeline {
    source: Arc<dyn DocumentSource>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    options: PipelineOptions,
    observer: Option<Arc<dyn PipelineObserver>>,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            chunker,
            embedder,
            index,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs FETCH → DEDUPE → CHUNK → EMBED → UPSERT. Never panics on
    /// external failures; the outcome is carried by the report.
    pub async fn run(&self, cursor: IngestCursor) -> RunReport {
        tracing::info!(watermark = ?cursor.watermark, "ingestion run starting");
        let mut report = RunReport::new(cursor.clone());
        let mut marks = Watermarks::default();

        let outcome = self.execute(&mut report, &mut marks).await;
        report.finished_at = Utc::now();

        match outcome {
            Ok(()) => {
                report.cursor = cursor.advanced(marks.safe_watermark(), report.finished_at);
                self.enter(&mut report, RunState::Done);
                tracing::info!(
                    fetched = report.stats.fetched,
                    embedded = report.stats.embedded,
                    upserted = report.stats.upserted,
                    superseded = report.stats.superseded,
                    failed = report.document_failures.len(),
                    watermark = ?report.cursor.watermark,
                    "ingestion run complete"
                );
            }
            Err(err) => {
                report.cursor = cursor;
                report.error = Some(err.to_string());
                tracing::error!(
                    stage = %report.state,
                    error = %err,
                    pending = report.pending_fragment_ids.len(),
                    "ingestion run failed"
                );
                self.enter(&mut report, RunState::Failed);
            }
        }
        report
    }

    fn enter(&self, report: &mut RunReport, state: RunState) {
        report.state = state;
        tracing::debug!(stage = %state, "ingestion stage");
        if let Some(observer) = &self.observer {
            observer.stage(state);
        }
    }

    fn finished(&self, source_id: &str, succeeded: bool) {
        if let Some(observer) = &self.observer {
            observer.document_finished(source_id, succeeded);
        }
    }

    fn fail_document(
        &self,
        report: &mut RunReport,
        marks: &mut Watermarks,
        document: &RawDocument,
        stage: RunState,
        err: &BalerError,
    ) {
        tracing::warn!(source_id = %document.source_id, stage = %stage, error = %err, "document failed");
        marks.block(document.scrape_timestamp);
        report.document_failures.push(DocumentFailure {
            source_id: document.source_id.clone(),
            stage,
            reason: err.to_string(),
            retryable: true,
        });
        self.finished(&document.source_id, false);
    }

    async fn execute(&self, report: &mut RunReport, marks: &mut Watermarks) -> Result<()> {
        // FETCH
        self.enter(report, RunState::Fetch);
        let source = self.source.as_ref();
        let watermark = report.cursor.watermark;
        let fetched = self
            .options
            .fetch_retry
            .run("document fetch", move || source.fetch_since(watermark))
            .await?;
        report.stats.fetched = fetched.len();
        marks.seen = fetched.iter().map(|d| d.scrape_timestamp).collect();

        let documents = self.screen(fetched, report);
        report.stats.documents = documents.len();
        if documents.is_empty() {
            tracing::info!("no new documents");
            return Ok(());
        }
        self.check_model_version().await?;

        // DEDUPE
        self.enter(report, RunState::Dedupe);
        let planned: Vec<(RawDocument, Vec<Fragment>)> = documents
            .into_iter()
            .map(|document| {
                let fragments = self.chunker.fragments(&document);
                (document, fragments)
            })
            .collect();
        let candidate_ids: Vec<String> = planned
            .iter()
            .flat_map(|(_, fragments)| fragments.iter().map(|f| f.fragment_id.clone()))
            .collect();
        report.stats.candidate_fragments = candidate_ids.len();
        let existing = self.existing_ids(&candidate_ids).await?;

        // CHUNK
        self.enter(report, RunState::Chunk);
        let work: Vec<DocumentWork> = planned
            .into_iter()
            .map(|(document, fragments)| DocumentWork {
                document,
                fragment_ids: fragments.iter().map(|f| f.fragment_id.clone()).collect(),
                pending: fragments
                    .into_iter()
                    .filter(|f| !existing.contains(&f.fragment_id))
                    .collect(),
            })
            .collect();
        report.stats.unchanged_documents = work.iter().filter(|w| w.pending.is_empty()).count();
        report.stats.new_fragments = work.iter().map(|w| w.pending.len()).sum();
        tracing::info!(
            documents = work.len(),
            candidates = report.stats.candidate_fragments,
            new = report.stats.new_fragments,
            "dedupe complete"
        );
        if let Some(observer) = &self.observer {
            observer.documents(work.len());
        }

        // EMBED
        self.enter(report, RunState::Embed);
        let embedded: Vec<Embedded> = stream::iter(work)
            .map(|w| self.embed_document(w))
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut prepared = Vec::with_capacity(embedded.len());
        for item in embedded {
            match item.entries {
                Ok(entries) => {
                    report.stats.embedded += entries.len();
                    prepared.push(Prepared {
                        document: item.document,
                        fragment_ids: item.fragment_ids,
                        entries,
                    });
                }
                Err(err) if err.is_configuration() => return Err(err),
                Err(err) => self.fail_document(report, marks, &item.document, RunState::Embed, &err),
            }
        }

        // UPSERT
        self.enter(report, RunState::Upsert);
        let entries: Vec<IndexEntry> = prepared
            .iter_mut()
            .flat_map(|p| std::mem::take(&mut p.entries))
            .collect();
        let index = self.index.as_ref();
        let mut written = 0;
        for batch in entries.chunks(self.options.upsert_batch_size.max(1)) {
            match self
                .options
                .index_retry
                .run("vector upsert", move || index.upsert(batch.to_vec()))
                .await
            {
                Ok(count) => {
                    report.stats.upserted += count;
                    written += batch.len();
                }
                Err(err) => {
                    report.pending_fragment_ids =
                        entries[written..].iter().map(|e| e.fragment_id.clone()).collect();
                    return Err(err);
                }
            }
        }

        for p in &prepared {
            let source_id = p.document.source_id.as_str();
            let keep = p.fragment_ids.as_slice();
            match self
                .options
                .index_retry
                .run("superseded cleanup", move || index.delete_superseded(source_id, keep))
                .await
            {
                Ok(removed) => {
                    report.stats.superseded += removed;
                    self.finished(source_id, true);
                }
                Err(err) if err.is_configuration() => return Err(err),
                Err(err) => self.fail_document(report, marks, &p.document, RunState::Upsert, &err),
            }
        }
        Ok(())
    }

    /// Drops unusable records and collapses repeated source ids to the latest scrape.
    fn screen(&self, fetched: Vec<RawDocument>, report: &mut RunReport) -> Vec<RawDocument> {
        let mut latest: HashMap<String, RawDocument> = HashMap::new();
        for document in fetched {
            if let Err(err) = document.validate() {
                tracing::warn!(source_id = %document.source_id, error = %err, "skipping document");
                report.stats.skipped_invalid += 1;
                report.document_failures.push(DocumentFailure {
                    source_id: document.source_id.clone(),
                    stage: RunState::Fetch,
                    reason: err.to_string(),
                    retryable: false,
                });
                continue;
            }
            match latest.get(&document.source_id) {
                Some(kept) if kept.scrape_timestamp > document.scrape_timestamp => {}
                _ => {
                    latest.insert(document.source_id.clone(), document);
                }
            }
        }
        let mut documents: Vec<RawDocument> = latest.into_values().collect();
        documents.sort_by(|a, b| {
            a.scrape_timestamp
                .cmp(&b.scrape_timestamp)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        documents
    }

    async fn check_model_version(&self) -> Result<()> {
        let index = self.index.as_ref();
        let stored = self
            .options
            .index_retry
            .run("model version probe", move || index.probe_model_version())
            .await?;
        match stored {
            Some(stored) if stored != self.embedder.model_version() => Err(BalerError::config(format!(
                "index holds vectors from model {} but the embedder is {}; re-embed the corpus into a fresh index",
                stored,
                self.embedder.model_version()
            ))),
            _ => Ok(()),
        }
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let index = self.index.as_ref();
        let mut found = HashSet::new();
        for batch in ids.chunks(self.options.exists_batch_size.max(1)) {
            let present = self
                .options
                .index_retry
                .run("existence check", move || index.exists(batch))
                .await?;
            found.extend(present);
        }
        Ok(found)
    }

    async fn embed_document(&self, work: DocumentWork) -> Embedded {
        let entries = self.embed_fragments(&work.document, &work.pending).await;
        Embedded {
            document: work.document,
            fragment_ids: work.fragment_ids,
            entries,
        }
    }

    async fn embed_fragments(&self, document: &RawDocument, fragments: &[Fragment]) -> Result<Vec<IndexEntry>> {
        let embedder = self.embedder.as_ref();
        let mut entries = Vec::with_capacity(fragments.len());
        for batch in fragments.chunks(self.options.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|f| f.text.clone()).collect();
            let inputs = texts.as_slice();
            let vectors = self
                .options
                .embed_retry
                .run("fragment embedding", move || embedder.embed(inputs))
                .await?;
            let vectors = check_vectors(batch.len(), embedder.dimension(), vectors)?;

            for (fragment, vector) in batch.iter().zip(vectors) {
                entries.push(IndexEntry {
                    fragment_id: fragment.fragment_id.clone(),
                    vector,
                    metadata: FragmentMetadata {
                        source_id: document.source_id.clone(),
                        album_identifier: document.album_identifier.clone(),
                        artist: document.artist.clone(),
                        album_title: document.album_title.clone(),
                        publication_date: document.publication_date,
                        position_index: fragment.position_index,
                        text: fragment.text.clone(),
                        model_version: embedder.model_version().to_string(),
                    },
                });
            }
        }
        if !fragments.is_empty() {
            tracing::debug!(source_id = %document.source_id, fragments = fragments.len(), "document embedded");
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::indexer::chunker::ChunkerConfig;
    use crate::rag::memory_store::MemoryIndex;
    use crate::testing::{at_hour, document, fast_retry, FlakyIndex, MemorySource, ScriptedEmbedder};

    fn options() -> PipelineOptions {
        PipelineOptions {
            concurrency: 3,
            embed_batch_size: 2,
            upsert_batch_size: 3,
            exists_batch_size: 4,
            fetch_retry: fast_retry(),
            embed_retry: fast_retry(),
            index_retry: fast_retry(),
        }
    }

    fn pipeline(
        source: Arc<MemorySource>,
        embedder: Arc<ScriptedEmbedder>,
        index: Arc<dyn VectorIndex>,
    ) -> IngestionPipeline {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        IngestionPipeline::new(source, chunker, embedder, index, options())
    }

    fn reviews(count: usize, edition: &str) -> Vec<crate::models::RawDocument> {
        (0..count)
            .map(|i| {
                document(
                    &format!("u{}", i),
                    &format!("Artist {}", i),
                    "Record",
                    &format!("Review {} of record {}. It hums and glows.", edition, i),
                    i as i64,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_rerun_over_same_input_writes_nothing() {
        let source = Arc::new(MemorySource::new(reviews(6, "first")));
        let embedder = Arc::new(ScriptedEmbedder::new(4));
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(source, embedder.clone(), index.clone());

        let first = pipeline.run(IngestCursor::default()).await;
        assert!(first.is_done());
        assert_eq!(first.stats.upserted, 6);
        let writes = index.write_count();
        let embedded = embedder.embedded_texts().len();

        let again = pipeline.run(IngestCursor::default()).await;
        assert!(again.is_done());
        assert_eq!(again.stats.fetched, 6);
        assert_eq!(again.stats.unchanged_documents, 6);
        assert_eq!(again.stats.embedded, 0);
        assert_eq!(again.stats.upserted, 0);
        assert_eq!(index.write_count(), writes);
        assert_eq!(embedder.embedded_texts().len(), embedded);

        let resumed = pipeline.run(first.cursor.clone()).await;
        assert_eq!(resumed.stats.fetched, 0);
        assert_eq!(resumed.cursor.watermark, first.cursor.watermark);
    }

    #[tokio::test]
    async fn test_embed_concurrency_is_bounded() {
        let embedder = Arc::new(ScriptedEmbedder::new(3).with_latency(Duration::from_millis(20)));
        let index = Arc::new(MemoryIndex::new());
        let source = Arc::new(MemorySource::new(reviews(10, "first")));
        let report = pipeline(source, embedder.clone(), index.clone())
            .run(IngestCursor::default())
            .await;

        assert!(report.is_done(), "{:?}", report.error);
        assert_eq!(report.stats.documents, 10);
        let peak = embedder.peak_in_flight();
        assert!(peak <= options().concurrency, "peak {} over limit", peak);
        assert!(peak > 1, "documents were embedded one at a time");
    }

    #[tokio::test]
    async fn test_only_changed_documents_are_reembedded() {
        let source = Arc::new(MemorySource::new(reviews(10, "first")));
        let embedder = Arc::new(ScriptedEmbedder::new(4));
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(source.clone(), embedder.clone(), index.clone());
        assert!(pipeline.run(IngestCursor::default()).await.is_done());
        let before = embedder.embedded_texts().len();

        let mut docs = reviews(10, "first");
        for doc in docs.iter_mut().take(5) {
            doc.body_text = doc.body_text.replace("first", "revised");
            doc.scrape_timestamp = at_hour(100);
        }
        source.replace(docs);

        let report = pipeline.run(IngestCursor::default()).await;
        assert!(report.is_done());
        assert_eq!(report.stats.embedded, 5);
        assert_eq!(report.stats.superseded, 5);
        assert_eq!(embedder.embedded_texts().len() - before, 5);
        assert_eq!(index.len().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failed_document_holds_cursor_and_is_retried() {
        let docs = vec![
            document("ua", "A", "One", "Steady and warm.", 1),
            document("ub", "B", "Two", "Broken [fail] text.", 2),
            document("uc", "C", "Three", "Cold and bright.", 3),
        ];
        let source = Arc::new(MemorySource::new(docs));
        let index = Arc::new(MemoryIndex::new());

        let flaky = Arc::new(ScriptedEmbedder::new(4).fail_on("[fail]"));
        let report = pipeline(source.clone(), flaky, index.clone())
            .run(IngestCursor::default())
            .await;
        assert!(report.is_done());
        assert_eq!(report.document_failures.len(), 1);
        assert_eq!(report.document_failures[0].source_id, "ub");
        assert_eq!(report.document_failures[0].stage, RunState::Embed);
        assert_eq!(report.cursor.watermark, Some(at_hour(1)));
        assert_eq!(index.len().await.unwrap(), 2);

        let healthy = Arc::new(ScriptedEmbedder::new(4));
        let retry = pipeline(source, healthy.clone(), index.clone())
            .run(report.cursor.clone())
            .await;
        assert!(retry.is_done());
        assert_eq!(retry.stats.fetched, 2);
        assert_eq!(healthy.embedded_texts(), vec!["Broken [fail] text.".to_string()]);
        assert_eq!(retry.cursor.watermark, Some(at_hour(3)));
        assert_eq!(index.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upsert_exhaustion_fails_run_with_pending_ids() {
        let source = Arc::new(MemorySource::new(reviews(4, "first")));
        let index = Arc::new(FlakyIndex::failing_upserts(100));
        let cursor = IngestCursor {
            watermark: Some(at_hour(-10)),
            last_success_at: None,
        };
        let report = pipeline(source, Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(cursor.clone())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.cursor, cursor);
        assert_eq!(report.pending_fragment_ids.len(), 4);
        assert!(report.error.as_deref().unwrap().contains("vector upsert"));
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(MemorySource::new(reviews(2, "first")));
        source.fail_next(1);
        let index = Arc::new(FlakyIndex::failing_upserts(1));
        let report = pipeline(source, Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(IngestCursor::default())
            .await;
        assert!(report.is_done(), "{:?}", report.error);
        assert_eq!(index.inner.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_documents_are_skipped_and_passed() {
        let docs = vec![
            document("ua", "A", "One", "Fine review.", 1),
            document("ub", "B", "Two", "   ", 2),
            document("ux", "N/A", "Untitled", "Text.", 5),
        ];
        let index = Arc::new(MemoryIndex::new());
        let report = pipeline(Arc::new(MemorySource::new(docs)), Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(IngestCursor::default())
            .await;

        assert!(report.is_done());
        assert_eq!(report.stats.skipped_invalid, 2);
        assert!(report.document_failures.iter().all(|f| !f.retryable));
        assert_eq!(report.cursor.watermark, Some(at_hour(5)));
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_source_id_keeps_latest_scrape() {
        let docs = vec![
            document("ua", "A", "One", "Later take.", 4),
            document("ua", "A", "One", "Earlier take.", 1),
        ];
        let index = Arc::new(MemoryIndex::new());
        let report = pipeline(Arc::new(MemorySource::new(docs)), Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(IngestCursor::default())
            .await;
        assert_eq!(report.stats.documents, 1);
        let hits = index.query(&[0.0, 0.0, 0.0, 1.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.text, "Later take.");
    }

    #[tokio::test]
    async fn test_model_mismatch_fails_before_any_write() {
        let source = Arc::new(MemorySource::new(reviews(2, "first")));
        let index = Arc::new(MemoryIndex::new());
        let old = Arc::new(ScriptedEmbedder::new(4).with_model_version("old-model"));
        assert!(pipeline(source.clone(), old, index.clone())
            .run(IngestCursor::default())
            .await
            .is_done());
        let writes = index.write_count();

        source.replace(reviews(2, "second"));
        let report = pipeline(source, Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(IngestCursor::default())
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.error.as_deref().unwrap().contains("old-model"));
        assert_eq!(index.write_count(), writes);
    }

    #[tokio::test]
    async fn test_empty_fetch_completes_without_writes() {
        let index = Arc::new(MemoryIndex::new());
        let report = pipeline(Arc::new(MemorySource::default()), Arc::new(ScriptedEmbedder::new(4)), index.clone())
            .run(IngestCursor::default())
            .await;
        assert!(report.is_done());
        assert_eq!(report.cursor.watermark, None);
        assert!(report.cursor.last_success_at.is_some());
        assert_eq!(index.write_count(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        stages: Mutex<Vec<RunState>>,
        finished: Mutex<Vec<(String, bool)>>,
    }

    impl PipelineObserver for Recorder {
        fn stage(&self, state: RunState) {
            self.stages.lock().unwrap().push(state);
        }

        fn document_finished(&self, source_id: &str, succeeded: bool) {
            self.finished.lock().unwrap().push((source_id.to_string(), succeeded));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_stage() {
        let recorder = Arc::new(Recorder::default());
        let report = pipeline(
            Arc::new(MemorySource::new(reviews(2, "first"))),
            Arc::new(ScriptedEmbedder::new(4)),
            Arc::new(MemoryIndex::new()),
        )
        .with_observer(recorder.clone())
        .run(IngestCursor::default())
        .await;
        assert!(report.is_done());
        assert_eq!(
            *recorder.stages.lock().unwrap(),
            vec![
                RunState::Fetch,
                RunState::Dedupe,
                RunState::Chunk,
                RunState::Embed,
                RunState::Upsert,
                RunState::Done
            ]
        );
        assert_eq!(recorder.finished.lock().unwrap().len(), 2);
    }
}
