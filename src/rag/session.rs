use std::collections::BTreeSet;

use super::filter::MetadataFilter;
use super::narrator::NarrativeStyle;
use super::{RecommendRequest, RetrievalEngine};
use crate::error::Result;
use crate::models::Recommendations;

/// "Show more" paging over one query. Every album already shown is excluded
/// from later pages; a new session starts with nothing excluded.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    query: String,
    page_size: usize,
    filter: Option<MetadataFilter>,
    narrative: Option<NarrativeStyle>,
    seen: BTreeSet<String>,
}

impl DiscoverySession {
    pub fn new(query: impl Into<String>, page_size: usize) -> Self {
        Self {
            query: query.into(),
            page_size,
            filter: None,
            narrative: None,
            seen: BTreeSet::new(),
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_narrative(mut self, style: NarrativeStyle) -> Self {
        self.narrative = Some(style);
        self
    }

    /// Albums excluded from the next page.
    pub fn seen(&self) -> &BTreeSet<String> {
        &self.seen
    }

    pub async fn next_page(&mut self, engine: &RetrievalEngine) -> Result<Recommendations> {
        let request = RecommendRequest {
            query: self.query.clone(),
            k: self.page_size,
            exclude: self.seen.clone(),
            filter: self.filter.clone(),
            narrative: self.narrative,
        };
        let page = engine.recommend(request).await?;
        self.seen
            .extend(page.albums.iter().map(|a| a.album.album_identifier.clone()));
        tracing::debug!(query = %self.query, shown = self.seen.len(), "discovery page served");
        Ok(page)
    }
}
