use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use qdrant_client::qdrant::{
    point_id::PointIdOptions, vectors_config, Condition, CountPointsBuilder,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, GetPointsBuilder, PointId,
    PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::filter::MetadataFilter;
use crate::error::{BalerError, Result};
use crate::models::{FragmentMetadata, IndexEntry, ScoredFragment};

/// Persistent store of fragment vectors keyed by fragment id.
///
/// `upsert` must be atomic per id: a concurrent reader sees either the old
/// entry or the new one.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Returns the number of entries written after collapsing duplicate ids.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Nearest neighbours, best first; equal scores ordered by fragment id.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredFragment>>;

    async fn exists(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Removes fragments of `source_id` whose ids are not in `keep`.
    async fn delete_superseded(&self, source_id: &str, keep: &[String]) -> Result<usize>;

    /// Model version recorded on any stored entry, `None` when empty.
    async fn probe_model_version(&self) -> Result<Option<String>>;

    async fn len(&self) -> Result<usize>;
}

/// Collapses repeated ids to their last occurrence, keeping first-seen order.
pub fn dedupe_last_wins(entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    let mut out: Vec<IndexEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match slots.get(&entry.fragment_id) {
            Some(&slot) => out[slot] = entry,
            None => {
                slots.insert(entry.fragment_id.clone(), out.len());
                out.push(entry);
            }
        }
    }
    out
}

pub fn rank_hits(hits: &mut [ScoredFragment]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.fragment_id.cmp(&b.fragment_id))
    });
}

const PUBLISHED_DAY: &str = "published_day";

pub struct QdrantIndex {
    client: Qdrant,
    collection_name: String,
    dimension: usize,
}

impl QdrantIndex {
    pub async fn connect(
        url: &str,
        api_key: Option<String>,
        collection_name: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        tracing::info!(url, collection = collection_name, "building Qdrant client");
        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .timeout(timeout)
            .build()
            .map_err(|e| BalerError::config(format!("qdrant client build failed: {}", e)))?;

        let index = Self {
            client,
            collection_name: collection_name.to_string(),
            dimension,
        };
        index.ensure_collection().await?;
        tracing::info!(collection = collection_name, dimension, "Qdrant collection ready");
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| BalerError::transient("qdrant collection check", e))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| BalerError::transient("qdrant create collection", e))?;
            return Ok(());
        }

        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .map_err(|e| BalerError::transient("qdrant collection info", e))?;
        let stored = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);
        if let Some(vectors_config::Config::Params(params)) = stored {
            if params.size as usize != self.dimension {
                return Err(BalerError::config(format!(
                    "collection {} holds {}-dimensional vectors, embedder produces {}",
                    self.collection_name, params.size, self.dimension
                )));
            }
        }
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(BalerError::config(format!(
                "vector has {} dimensions, collection expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    async fn count(&self, filter: Option<Filter>) -> Result<usize> {
        let mut builder = CountPointsBuilder::new(&self.collection_name).exact(true);
        if let Some(filter) = filter {
            builder = builder.filter(filter);
        }
        let response = self
            .client
            .count(builder)
            .await
            .map_err(|e| BalerError::transient("qdrant count", e))?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }
}

fn to_payload(metadata: &FragmentMetadata) -> Result<JsonMap<String, JsonValue>> {
    let mut payload = match serde_json::to_value(metadata)? {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    };
    if let Some(date) = metadata.publication_date {
        payload.insert(PUBLISHED_DAY.to_string(), JsonValue::from(date.num_days_from_ce()));
    }
    Ok(payload)
}

fn payload_str(payload: &HashMap<String, QdrantValue>, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn from_payload(payload: &HashMap<String, QdrantValue>) -> FragmentMetadata {
    FragmentMetadata {
        source_id: payload_str(payload, "source_id"),
        album_identifier: payload_str(payload, "album_identifier"),
        artist: payload_str(payload, "artist"),
        album_title: payload_str(payload, "album_title"),
        publication_date: payload
            .get("publication_date")
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        position_index: payload
            .get("position_index")
            .and_then(|v| v.as_integer())
            .map(|n| n.max(0) as usize)
            .unwrap_or(0),
        text: payload_str(payload, "text"),
        model_version: payload_str(payload, "model_version"),
    }
}

fn point_id_string(id: Option<&PointId>) -> Option<String> {
    match id?.point_id_options.as_ref()? {
        PointIdOptions::Uuid(uuid) => Some(uuid.clone()),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

fn qdrant_conditions(filter: &MetadataFilter) -> Vec<Condition> {
    match filter {
        MetadataFilter::Equals { field, value } => {
            vec![Condition::matches(field.payload_key(), value.clone())]
        }
        MetadataFilter::OneOf { field, values } => {
            vec![Condition::matches(field.payload_key(), values.clone())]
        }
        MetadataFilter::PublishedWithin { from: None, to: None } => Vec::new(),
        MetadataFilter::PublishedWithin { from, to } => vec![Condition::range(
            PUBLISHED_DAY,
            Range {
                gte: from.map(|d| d.num_days_from_ce() as f64),
                lte: to.map(|d| d.num_days_from_ce() as f64),
                ..Default::default()
            },
        )],
        MetadataFilter::All { filters } => filters.iter().flat_map(qdrant_conditions).collect(),
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        let entries = dedupe_last_wins(entries);
        if entries.is_empty() {
            return Ok(0);
        }
        let mut points = Vec::with_capacity(entries.len());
        for entry in &entries {
            self.check_dimension(&entry.vector)?;
            points.push(PointStruct::new(
                entry.fragment_id.clone(),
                entry.vector.clone(),
                to_payload(&entry.metadata)?,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| BalerError::transient("qdrant upsert", e))?;
        Ok(entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredFragment>> {
        if k == 0 || filter.is_some_and(MetadataFilter::is_unsatisfiable) {
            return Ok(Vec::new());
        }
        self.check_dimension(vector)?;

        let mut builder = SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), k as u64)
            .with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(Filter::must(qdrant_conditions(filter)));
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| BalerError::transient("qdrant search", e))?;

        let mut hits: Vec<ScoredFragment> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let fragment_id = point_id_string(point.id.as_ref())?;
                Some(ScoredFragment {
                    fragment_id,
                    score: point.score,
                    metadata: from_payload(&point.payload),
                })
            })
            .collect();
        rank_hits(&mut hits);
        Ok(hits)
    }

    async fn exists(&self, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.clone())).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection_name, point_ids)
                    .with_payload(false)
                    .with_vectors(false),
            )
            .await
            .map_err(|e| BalerError::transient("qdrant exists", e))?;

        Ok(response
            .result
            .iter()
            .filter_map(|point| point_id_string(point.id.as_ref()))
            .collect())
    }

    async fn delete_superseded(&self, source_id: &str, keep: &[String]) -> Result<usize> {
        let filter = Filter {
            must: vec![Condition::matches("source_id", source_id.to_string())],
            must_not: vec![Condition::has_id(keep.iter().cloned())],
            ..Default::default()
        };
        let stale = self.count(Some(filter.clone())).await?;
        if stale == 0 {
            return Ok(0);
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| BalerError::transient("qdrant delete", e))?;
        tracing::info!(source_id, removed = stale, "deleted superseded fragments");
        Ok(stale)
    }

    async fn probe_model_version(&self) -> Result<Option<String>> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection_name)
                    .limit(1)
                    .with_payload(true),
            )
            .await
            .map_err(|e| BalerError::transient("qdrant scroll", e))?;

        Ok(response
            .result
            .first()
            .map(|point| payload_str(&point.payload, "model_version"))
            .filter(|v| !v.is_empty()))
    }

    async fn len(&self) -> Result<usize> {
        self.count(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::filter::TextField;

    fn entry(id: &str, text: &str) -> IndexEntry {
        IndexEntry {
            fragment_id: id.into(),
            vector: vec![1.0, 0.0],
            metadata: FragmentMetadata {
                source_id: "u1".into(),
                album_identifier: "a/b".into(),
                artist: "A".into(),
                album_title: "B".into(),
                publication_date: NaiveDate::from_ymd_opt(2020, 1, 2),
                position_index: 0,
                text: text.into(),
                model_version: "m1".into(),
            },
        }
    }

    #[test]
    fn test_dedupe_keeps_last_write_in_first_position() {
        let out = dedupe_last_wins(vec![entry("x", "old"), entry("y", "y"), entry("x", "new")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].fragment_id, "x");
        assert_eq!(out[0].metadata.text, "new");
        assert_eq!(out[1].fragment_id, "y");
    }

    #[test]
    fn test_rank_hits_breaks_ties_by_id() {
        let mut hits: Vec<ScoredFragment> = [("c", 0.5), ("a", 0.5), ("b", 0.9)]
            .into_iter()
            .map(|(id, score)| ScoredFragment {
                fragment_id: id.into(),
                score,
                metadata: entry(id, "t").metadata,
            })
            .collect();
        rank_hits(&mut hits);
        let ids: Vec<_> = hits.iter().map(|h| h.fragment_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_payload_carries_day_number_for_range_filters() {
        let payload = to_payload(&entry("x", "t").metadata).unwrap();
        assert_eq!(payload["publication_date"], "2020-01-02");
        let day = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap().num_days_from_ce();
        assert_eq!(payload[PUBLISHED_DAY], day);
    }

    #[test]
    fn test_filter_conditions_flatten() {
        let filter = MetadataFilter::equals(TextField::Artist, "A")
            .and(MetadataFilter::published_within(None, None))
            .and(MetadataFilter::published_within(NaiveDate::from_ymd_opt(2000, 1, 1), None));
        assert_eq!(qdrant_conditions(&filter).len(), 2);
    }
}
