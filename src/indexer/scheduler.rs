use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::cursor::CursorFile;
use super::pipeline::{IngestionPipeline, RunReport};
use crate::error::{BalerError, Result};

/// Periodic ingestion. Overlapping runs are refused in-process; deployments
/// running several schedulers still need an external lock.
pub struct NightlyScheduler {
    pipeline: Arc<IngestionPipeline>,
    cursor_file: CursorFile,
    interval: Duration,
    initial_delay: Duration,
    running: Mutex<()>,
}

impl NightlyScheduler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        cursor_file: CursorFile,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            pipeline,
            cursor_file,
            interval,
            initial_delay,
            running: Mutex::new(()),
        }
    }

    /// One run: load cursor, ingest, persist the advanced cursor on success.
    /// Returns `Ok(None)` when a previous run is still in flight.
    pub async fn run_once(&self) -> Result<Option<RunReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!("previous ingestion run still in progress, skipping");
            return Ok(None);
        };

        let cursor = self.cursor_file.load().await?;
        let run = std::panic::AssertUnwindSafe(self.pipeline.run(cursor))
            .catch_unwind()
            .await;
        let report = match run {
            Ok(report) => report,
            Err(panic_info) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(%message, "ingestion run panicked");
                return Err(BalerError::transient("ingestion run", message));
            }
        };

        if report.is_done() {
            self.cursor_file.save(&report.cursor).await?;
        }
        Ok(Some(report))
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.initial_delay).await;
            loop {
                tracing::info!("scheduled ingestion starting");
                match self.run_once().await {
                    Ok(Some(report)) if report.is_done() => {}
                    Ok(Some(report)) => {
                        tracing::error!(error = ?report.error, "scheduled ingestion failed")
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "scheduled ingestion aborted"),
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::chunker::{Chunker, ChunkerConfig};
    use crate::indexer::pipeline::PipelineOptions;
    use crate::rag::memory_store::MemoryIndex;
    use crate::testing::{at_hour, document, fast_retry, MemorySource, ScriptedEmbedder};

    fn scheduler(dir: &std::path::Path, source: Arc<MemorySource>) -> NightlyScheduler {
        let pipeline = IngestionPipeline::new(
            source,
            Chunker::new(ChunkerConfig::default()).unwrap(),
            Arc::new(ScriptedEmbedder::new(3)),
            Arc::new(MemoryIndex::new()),
            PipelineOptions {
                fetch_retry: fast_retry(),
                embed_retry: fast_retry(),
                index_retry: fast_retry(),
                ..Default::default()
            },
        );
        NightlyScheduler::new(
            Arc::new(pipeline),
            CursorFile::new(dir.join("cursor.json")),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_successful_run_persists_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::new(vec![document("u1", "A", "One", "Warm.", 2)]));
        let scheduler = scheduler(dir.path(), source);

        let report = scheduler.run_once().await.unwrap().unwrap();
        assert!(report.is_done());
        let saved = CursorFile::new(dir.path().join("cursor.json")).load().await.unwrap();
        assert_eq!(saved.watermark, Some(at_hour(2)));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_cursor_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::new(vec![document("u1", "A", "One", "Warm.", 2)]));
        source.fail_next(10);
        let scheduler = scheduler(dir.path(), source);

        let report = scheduler.run_once().await.unwrap().unwrap();
        assert!(!report.is_done());
        assert!(!dir.path().join("cursor.json").exists());
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), Arc::new(MemorySource::default()));
        let _held = scheduler.running.lock().await;
        assert!(scheduler.run_once().await.unwrap().is_none());
    }
}
