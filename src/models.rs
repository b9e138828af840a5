use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BalerError, Result};

/// One scraped review as archived by the scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    #[serde(alias = "review_url")]
    pub source_id: String,
    #[serde(default)]
    pub album_identifier: String,
    pub artist: String,
    #[serde(default)]
    pub album_title: String,
    #[serde(default)]
    pub publication_date: Option<NaiveDate>,
    #[serde(alias = "review_text")]
    pub body_text: String,
    pub scrape_timestamp: DateTime<Utc>,
}

const MISSING_ARTIST: &str = "N/A";

impl RawDocument {
    /// Rejects records the scraper could not parse properly.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(BalerError::data_quality("<unknown>", "missing source id"));
        }
        let artist = self.artist.trim();
        if artist.is_empty() || artist == MISSING_ARTIST {
            return Err(BalerError::data_quality(&self.source_id, "missing artist"));
        }
        if self.album_identifier.trim().is_empty() {
            return Err(BalerError::data_quality(&self.source_id, "missing album identifier"));
        }
        if self.body_text.trim().is_empty() {
            return Err(BalerError::data_quality(&self.source_id, "empty review body"));
        }
        Ok(())
    }

    /// Derives an album identifier from artist and title when the archive
    /// record does not carry one.
    pub fn with_derived_album_identifier(mut self) -> Self {
        if self.album_identifier.trim().is_empty() && !self.album_title.trim().is_empty() {
            self.album_identifier = format!("{}/{}", slug(&self.artist), slug(&self.album_title));
        }
        self
    }
}

fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut dash = false;
    for ch in value.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Payload stored alongside every fragment vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    pub source_id: String,
    pub album_identifier: String,
    pub artist: String,
    pub album_title: String,
    pub publication_date: Option<NaiveDate>,
    pub position_index: usize,
    pub text: String,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: String,
    pub source_id: String,
    pub album_identifier: String,
    pub text: String,
    pub position_index: usize,
}

impl Fragment {
    /// Stable id for a fragment: same source, chunking parameters, position
    /// and text always hash to the same UUID.
    pub fn derive_id(source_id: &str, chunking: &str, position_index: usize, text: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [source_id.as_bytes(), chunking.as_bytes(), text.as_bytes()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.update((position_index as u64).to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub fragment_id: String,
    pub vector: Vec<f32>,
    pub metadata: FragmentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFragment {
    pub fragment_id: String,
    pub score: f32,
    pub metadata: FragmentMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub album_identifier: String,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub spotify_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumRecommendation {
    pub album: AlbumRecord,
    pub score: f32,
    pub publication_date: Option<NaiveDate>,
    /// Matching fragments, best first.
    pub evidence: Vec<ScoredFragment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recommendations {
    pub albums: Vec<AlbumRecommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    /// Steps that degraded instead of failing the request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// Chat completion wire types (OpenAI-compatible gateway)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}
