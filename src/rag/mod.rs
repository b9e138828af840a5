pub mod aggregation;
pub mod catalog;
pub mod embeddings;
pub mod filter;
pub mod memory_store;
pub mod narrator;
pub mod session;
pub mod vector_store;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use self::aggregation::{aggregate_by_album, AggregationConfig};
use self::catalog::AlbumResolver;
use self::embeddings::Embedder;
use self::filter::MetadataFilter;
use self::narrator::{NarrativeStyle, Narrator};
use self::vector_store::VectorIndex;
use crate::error::{BalerError, Result};
use crate::models::{AlbumRecord, AlbumRecommendation, Recommendations, ScoredFragment};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    /// Fragments fetched per wanted album before aggregation.
    pub oversample: usize,
    pub max_candidates: usize,
    pub aggregation: AggregationConfig,
    /// Evidence fragments handed to the narrator.
    pub narrative_fragments: usize,
    pub narrate_timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub embed_retry: RetryPolicy,
    pub index_retry: RetryPolicy,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            oversample: 4,
            max_candidates: 200,
            aggregation: AggregationConfig::default(),
            narrative_fragments: 8,
            narrate_timeout_ms: 20_000,
            resolve_timeout_ms: 5_000,
            embed_retry: RetryPolicy::default(),
            index_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecommendRequest {
    pub query: String,
    pub k: usize,
    pub exclude: BTreeSet<String>,
    pub filter: Option<MetadataFilter>,
    pub narrative: Option<NarrativeStyle>,
}

impl RecommendRequest {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            k,
            ..Default::default()
        }
    }

    pub fn exclude<I, S>(mut self, album_identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(album_identifiers.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn narrate(mut self, style: NarrativeStyle) -> Self {
        self.narrative = Some(style);
        self
    }
}

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    resolver: Arc<dyn AlbumResolver>,
    narrator: Option<Arc<dyn Narrator>>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        resolver: Arc<dyn AlbumResolver>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            resolver,
            narrator: None,
            options,
        }
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    fn candidate_pool(&self, k: usize, excluded: usize) -> usize {
        let wanted = (k + excluded).saturating_mul(self.options.oversample.max(1));
        wanted.clamp(k, self.options.max_candidates.max(k))
    }

    pub async fn recommend(&self, request: RecommendRequest) -> Result<Recommendations> {
        let mut out = Recommendations::default();
        let query = request.query.trim();
        if query.is_empty() || request.k == 0 {
            return Ok(out);
        }

        let embedder = self.embedder.as_ref();
        let query_vector = match self
            .options
            .embed_retry
            .run("query embedding", move || embedder.embed_one(query))
            .await
        {
            Ok(vector) => vector,
            Err(err) if err.is_configuration() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding unavailable, returning no results");
                out.warnings.push(format!("query embedding unavailable: {}", err));
                return Ok(out);
            }
        };

        // Widen the pool while misses leave the page short and the index may hold more.
        let mut pool = self.candidate_pool(request.k, request.exclude.len());
        let limit = self.options.max_candidates.max(pool);
        let mut resolved: HashMap<String, Option<AlbumRecord>> = HashMap::new();
        loop {
            let index = self.index.as_ref();
            let vector = query_vector.as_slice();
            let filter = request.filter.as_ref();
            let hits = self
                .options
                .index_retry
                .run("vector query", move || index.query(vector, pool, filter))
                .await?;
            self.ensure_model_version(&hits)?;
            tracing::debug!(query, hits = hits.len(), pool, "retrieved fragments");
            let exhausted = hits.len() < pool || pool >= limit;

            out.albums.clear();
            let candidates = aggregate_by_album(hits, &self.options.aggregation)
                .into_iter()
                .filter(|c| !request.exclude.contains(&c.album_identifier));
            for candidate in candidates {
                if out.albums.len() == request.k {
                    break;
                }
                if !resolved.contains_key(&candidate.album_identifier) {
                    let album = self.resolve(&candidate.album_identifier).await;
                    resolved.insert(candidate.album_identifier.clone(), album);
                }
                if let Some(Some(album)) = resolved.get(&candidate.album_identifier) {
                    out.albums.push(AlbumRecommendation {
                        album: album.clone(),
                        score: candidate.score,
                        publication_date: candidate.publication_date,
                        evidence: candidate.fragments,
                    });
                }
            }

            if out.albums.len() == request.k || exhausted {
                break;
            }
            pool = pool.saturating_mul(2).min(limit);
        }

        if let (Some(style), Some(narrator)) = (request.narrative, &self.narrator) {
            if !out.albums.is_empty() {
                let evidence = self.narrative_evidence(&out.albums);
                let timeout = Duration::from_millis(self.options.narrate_timeout_ms.max(1));
                match tokio::time::timeout(timeout, narrator.narrate(query, &evidence, style)).await {
                    Ok(Ok(text)) => out.narrative = Some(text),
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "narrative generation failed");
                        out.warnings.push(format!("narrative unavailable: {}", err));
                    }
                    Err(_) => {
                        tracing::warn!(?timeout, "narrative generation timed out");
                        out.warnings.push(format!("narrative timed out after {:?}", timeout));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Misses, lookup errors and timeouts all come back as `None`.
    async fn resolve(&self, album_identifier: &str) -> Option<AlbumRecord> {
        let timeout = Duration::from_millis(self.options.resolve_timeout_ms.max(1));
        match tokio::time::timeout(timeout, self.resolver.resolve(album_identifier)).await {
            Ok(Ok(Some(album))) => Some(album),
            Ok(Ok(None)) => {
                tracing::debug!(album = %album_identifier, "album not in catalog, skipped");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(album = %album_identifier, error = %err, "album lookup failed, skipped");
                None
            }
            Err(_) => {
                tracing::warn!(album = %album_identifier, "album lookup timed out, skipped");
                None
            }
        }
    }

    fn ensure_model_version(&self, hits: &[ScoredFragment]) -> Result<()> {
        let expected = self.embedder.model_version();
        match hits.iter().find(|h| h.metadata.model_version != expected) {
            Some(hit) => Err(BalerError::config(format!(
                "index holds vectors from model {} but queries use {}; re-embed the corpus before switching models",
                hit.metadata.model_version, expected
            ))),
            None => Ok(()),
        }
    }

    fn narrative_evidence(&self, albums: &[AlbumRecommendation]) -> Vec<ScoredFragment> {
        let mut evidence: Vec<ScoredFragment> = albums
            .iter()
            .flat_map(|a| a.evidence.iter().cloned())
            .collect();
        vector_store::rank_hits(&mut evidence);
        evidence.truncate(self.options.narrative_fragments.max(1));
        evidence
    }
}
