use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BalerError, Result};
use crate::indexer::chunker::ChunkerConfig;
use crate::indexer::pipeline::PipelineOptions;
use crate::rag::narrator::NarrativeStyle;
use crate::rag::RetrievalOptions;

pub const ENV_PREFIX: &str = "BALER";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub backend: IndexBackend,
    pub qdrant_url: String,
    pub collection: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Snapshot file for the memory backend.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Qdrant,
            qdrant_url: "http://localhost:6334".to_string(),
            collection: "review_fragments".to_string(),
            api_key: None,
            timeout_secs: 30,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model_dir: PathBuf,
    pub model_version: String,
    pub dimension: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("/app/models/all-MiniLM-L6-v2"),
            model_version: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub archive_dir: PathBuf,
    pub cursor_path: PathBuf,
    pub interval_hours: u64,
    pub initial_delay_secs: u64,
    pub pipeline: PipelineOptions,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("data/daily_scrapes"),
            cursor_path: PathBuf::from("data/ingest_cursor.json"),
            interval_hours: 24,
            initial_delay_secs: 60,
            pipeline: PipelineOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub style: NarrativeStyle,
}

impl Default for NarratorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:4000".to_string(),
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            timeout_secs: 60,
            style: NarrativeStyle::Pretentious,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// JSON array of album records. When unset, albums are derived from the archive.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub index: IndexSettings,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkerConfig,
    pub ingest: IngestSettings,
    pub retrieval: RetrievalOptions,
    pub narrator: NarratorSettings,
    pub catalog: CatalogSettings,
}

impl Settings {
    /// Defaults, then `baler.toml` (or the given file), then `BALER__*`
    /// environment variables. `.env` is read first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("baler").required(false),
        };
        let settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BalerError::config(format!("invalid settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(BalerError::config("embedding.dimension must be greater than zero"));
        }
        if self.embedding.model_version.trim().is_empty() {
            return Err(BalerError::config("embedding.model_version must be set"));
        }
        if self.chunking.max_len == 0 {
            return Err(BalerError::config("chunking.max_len must be greater than zero"));
        }
        let aggregation = &self.retrieval.aggregation;
        if !(0.0..=1.0).contains(&aggregation.corroboration_weight) || !(0.0..=1.0).contains(&aggregation.decay) {
            return Err(BalerError::config(
                "retrieval.aggregation weight and decay must lie in [0, 1]",
            ));
        }
        if self.index.backend == IndexBackend::Qdrant && self.index.qdrant_url.trim().is_empty() {
            return Err(BalerError::config("index.qdrant_url must be set for the qdrant backend"));
        }
        Ok(())
    }
}
