//! Album-level aggregation of fragment hits.
//!
//! Fragments are grouped by `album_identifier`. An album scores its best
//! fragment plus a decaying bonus for each further positive fragment, so
//! several reviews agreeing on a mood lift the album without letting sheer
//! volume outrank a single strong match.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::ScoredFragment;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Weight of the second-best fragment.
    pub corroboration_weight: f32,
    /// Multiplier applied for every further fragment.
    pub decay: f32,
    /// Fragments beyond the best that may contribute.
    pub max_corroborating: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            corroboration_weight: 0.25,
            decay: 0.5,
            max_corroborating: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlbumCandidate {
    pub album_identifier: String,
    pub score: f32,
    pub publication_date: Option<NaiveDate>,
    /// Best first.
    pub fragments: Vec<ScoredFragment>,
}

/// Scores one album from its fragment scores sorted best first.
///
/// Negative similarities never contribute, so adding a fragment can only
/// raise or keep the score.
pub fn album_score(sorted_scores: &[f32], config: &AggregationConfig) -> f32 {
    let Some((&best, rest)) = sorted_scores.split_first() else {
        return 0.0;
    };
    let weight = config.corroboration_weight.clamp(0.0, 1.0);
    let decay = config.decay.clamp(0.0, 1.0);

    let mut bonus = 0.0;
    let mut factor = weight;
    for &score in rest.iter().take(config.max_corroborating) {
        bonus += factor * score.max(0.0);
        factor *= decay;
    }
    best + bonus
}

fn by_score_desc(a: &ScoredFragment, b: &ScoredFragment) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.fragment_id.cmp(&b.fragment_id))
}

/// Score desc, then latest publication date, then album identifier.
pub fn compare_candidates(a: &AlbumCandidate, b: &AlbumCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.publication_date.cmp(&a.publication_date))
        .then_with(|| a.album_identifier.cmp(&b.album_identifier))
}

pub fn aggregate_by_album(hits: Vec<ScoredFragment>, config: &AggregationConfig) -> Vec<AlbumCandidate> {
    let mut groups: HashMap<String, Vec<ScoredFragment>> = HashMap::new();
    for hit in hits {
        groups
            .entry(hit.metadata.album_identifier.clone())
            .or_default()
            .push(hit);
    }

    let mut candidates: Vec<AlbumCandidate> = groups
        .into_iter()
        .map(|(album_identifier, mut fragments)| {
            fragments.sort_by(by_score_desc);
            let scores: Vec<f32> = fragments.iter().map(|f| f.score).collect();
            let publication_date = fragments.iter().filter_map(|f| f.metadata.publication_date).max();
            AlbumCandidate {
                score: album_score(&scores, config),
                album_identifier,
                publication_date,
                fragments,
            }
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates
}
