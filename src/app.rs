//! Builds pipeline and engine from [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::{IndexBackend, Settings};
use crate::error::{BalerError, Result};
use crate::indexer::chunker::Chunker;
use crate::indexer::pipeline::IngestionPipeline;
use crate::indexer::source::JsonlArchive;
use crate::rag::catalog::CatalogResolver;
use crate::rag::embeddings::{Embedder, FastEmbedder};
use crate::rag::memory_store::MemoryIndex;
use crate::rag::narrator::ChatNarrator;
use crate::rag::vector_store::{QdrantIndex, VectorIndex};
use crate::rag::RetrievalEngine;

pub fn build_embedder(settings: &Settings) -> Result<Arc<dyn Embedder>> {
    let embedding = &settings.embedding;
    let embedder = FastEmbedder::from_dir(
        &embedding.model_dir,
        embedding.model_version.clone(),
        embedding.dimension,
        embedding.batch_size,
    )?;
    Ok(Arc::new(embedder))
}

pub async fn build_index(settings: &Settings, dimension: usize) -> Result<Arc<dyn VectorIndex>> {
    let index = &settings.index;
    match index.backend {
        IndexBackend::Qdrant => {
            let store = QdrantIndex::connect(
                &index.qdrant_url,
                index.api_key.clone(),
                &index.collection,
                dimension,
                Duration::from_secs(index.timeout_secs.max(1)),
            )
            .await?;
            Ok(Arc::new(store))
        }
        IndexBackend::Memory => match &index.snapshot_path {
            Some(path) => Ok(Arc::new(MemoryIndex::open(path).await?)),
            None => {
                tracing::warn!("memory index without snapshot_path; entries are lost on exit");
                Ok(Arc::new(MemoryIndex::new()))
            }
        },
    }
}

pub async fn build_pipeline(settings: &Settings) -> Result<IngestionPipeline> {
    let embedder = build_embedder(settings)?;
    let index = build_index(settings, embedder.dimension()).await?;
    let chunker = Chunker::new(settings.chunking.clone())?;
    let source = Arc::new(JsonlArchive::new(&settings.ingest.archive_dir));
    Ok(IngestionPipeline::new(
        source,
        chunker,
        embedder,
        index,
        settings.ingest.pipeline.clone(),
    ))
}

pub async fn build_resolver(settings: &Settings) -> Result<CatalogResolver> {
    match &settings.catalog.path {
        Some(path) => CatalogResolver::load(path).await,
        None => {
            let archive = JsonlArchive::new(&settings.ingest.archive_dir);
            let records = tokio::task::spawn_blocking(move || archive.catalog())
                .await
                .map_err(|e| BalerError::transient("catalog build", e))??;
            tracing::info!(albums = records.len(), "album catalog derived from archive");
            Ok(CatalogResolver::new(records))
        }
    }
}

pub async fn build_engine(settings: &Settings) -> Result<RetrievalEngine> {
    let embedder = build_embedder(settings)?;
    let index = build_index(settings, embedder.dimension()).await?;
    let resolver = build_resolver(settings).await?;
    let engine = RetrievalEngine::new(embedder, index, Arc::new(resolver), settings.retrieval.clone());

    if !settings.narrator.enabled {
        return Ok(engine);
    }
    let narrator = &settings.narrator;
    let client = ChatNarrator::new(
        narrator.base_url.clone(),
        narrator.api_key.clone(),
        narrator.model.clone(),
        Duration::from_secs(narrator.timeout_secs.max(1)),
    )?;
    Ok(engine.with_narrator(Arc::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FragmentMetadata, IndexEntry};

    #[tokio::test]
    async fn test_memory_backend_reopens_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.index.backend = IndexBackend::Memory;
        settings.index.snapshot_path = Some(dir.path().join("index.json"));

        let index = build_index(&settings, 2).await.unwrap();
        index
            .upsert(vec![IndexEntry {
                fragment_id: "f".into(),
                vector: vec![1.0, 0.0],
                metadata: FragmentMetadata {
                    source_id: "u".into(),
                    album_identifier: "a/b".into(),
                    artist: "A".into(),
                    album_title: "B".into(),
                    publication_date: None,
                    position_index: 0,
                    text: "t".into(),
                    model_version: "m".into(),
                },
            }])
            .await
            .unwrap();

        let reopened = build_index(&settings, 2).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolver_falls_back_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("day.jsonl"),
            r#"{"review_url":"u1","artist":"Ride","album_title":"Nowhere","review_text":"Loud.","scrape_timestamp":"2024-06-01T00:00:00Z"}"#,
        )
        .unwrap();
        let mut settings = Settings::default();
        settings.ingest.archive_dir = dir.path().to_path_buf();

        let resolver = build_resolver(&settings).await.unwrap();
        assert_eq!(resolver.len(), 1);
    }
}
