use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::filter::MetadataFilter;
use super::vector_store::{dedupe_last_wins, rank_hits, VectorIndex};
use crate::error::{BalerError, Result};
use crate::models::{IndexEntry, ScoredFragment};

/// In-process index with brute-force cosine search. Optionally mirrored to a
/// JSON snapshot after every write; the file is written outside the entry
/// lock so queries never wait on disk.
#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<BTreeMap<String, IndexEntry>>,
    snapshot: Option<PathBuf>,
    writes: AtomicUsize,
    generation: AtomicU64,
    /// Generation of the last snapshot on disk.
    persisted: Mutex<u64>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a snapshot-backed index, loading existing entries if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: Vec<IndexEntry> = serde_json::from_slice(&bytes)?;
                for entry in stored {
                    entries.insert(entry.fragment_id.clone(), entry);
                }
                tracing::info!(path = %path.display(), entries = entries.len(), "loaded index snapshot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot: Some(path),
            ..Default::default()
        })
    }

    /// Total entries written since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn get(&self, fragment_id: &str) -> Option<IndexEntry> {
        self.entries.read().await.get(fragment_id).cloned()
    }

    /// Copies the entries for a snapshot. Call with the write guard held so
    /// generations follow mutation order.
    fn capture(&self, entries: &BTreeMap<String, IndexEntry>) -> Option<(u64, Vec<IndexEntry>)> {
        self.snapshot.as_ref()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Some((generation, entries.values().cloned().collect()))
    }

    async fn persist(&self, captured: Option<(u64, Vec<IndexEntry>)>) -> Result<()> {
        let (Some(path), Some((generation, entries))) = (&self.snapshot, captured) else {
            return Ok(());
        };
        let mut persisted = self.persisted.lock().await;
        if *persisted >= generation {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(&entries)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        *persisted = generation;
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        let entries = dedupe_last_wins(entries);
        if entries.is_empty() {
            return Ok(0);
        }
        let mut stored = self.entries.write().await;
        let width = stored.values().next().map(|e| e.vector.len());
        if let Some(width) = width {
            if let Some(bad) = entries.iter().find(|e| e.vector.len() != width) {
                return Err(BalerError::config(format!(
                    "vector has {} dimensions, index holds {}",
                    bad.vector.len(),
                    width
                )));
            }
        }
        let written = entries.len();
        for entry in entries {
            stored.insert(entry.fragment_id.clone(), entry);
        }
        let captured = self.capture(&stored);
        drop(stored);
        self.persist(captured).await?;
        self.writes.fetch_add(written, Ordering::SeqCst);
        Ok(written)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredFragment>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let stored = self.entries.read().await;
        if let Some(first) = stored.values().next() {
            if first.vector.len() != vector.len() {
                return Err(BalerError::config(format!(
                    "query vector has {} dimensions, index holds {}",
                    vector.len(),
                    first.vector.len()
                )));
            }
        }

        let mut hits: Vec<ScoredFragment> = stored
            .values()
            .filter(|e| filter.map_or(true, |f| f.matches(&e.metadata)))
            .map(|e| ScoredFragment {
                fragment_id: e.fragment_id.clone(),
                score: cosine_similarity(vector, &e.vector),
                metadata: e.metadata.clone(),
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn exists(&self, ids: &[String]) -> Result<HashSet<String>> {
        let stored = self.entries.read().await;
        Ok(ids.iter().filter(|id| stored.contains_key(*id)).cloned().collect())
    }

    async fn delete_superseded(&self, source_id: &str, keep: &[String]) -> Result<usize> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut stored = self.entries.write().await;
        let before = stored.len();
        stored.retain(|id, e| e.metadata.source_id != source_id || keep.contains(id.as_str()));
        let removed = before - stored.len();
        if removed > 0 {
            let captured = self.capture(&stored);
            drop(stored);
            self.persist(captured).await?;
            tracing::debug!(source_id, removed, "deleted superseded fragments");
        }
        Ok(removed)
    }

    async fn probe_model_version(&self) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .next()
            .map(|e| e.metadata.model_version.clone()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
