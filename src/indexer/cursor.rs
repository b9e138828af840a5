use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ingestion progress, owned by the caller and passed into every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCursor {
    /// Documents scraped at or before this instant are considered ingested.
    pub watermark: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl IngestCursor {
    /// Cursor after a successful run. The watermark never moves backwards.
    pub fn advanced(&self, newest: Option<DateTime<Utc>>, finished_at: DateTime<Utc>) -> Self {
        let watermark = match (self.watermark, newest) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => old.or(new),
        };
        Self {
            watermark,
            last_success_at: Some(finished_at),
        }
    }
}

/// JSON file holding the cursor between runs.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing file is a fresh cursor.
    pub async fn load(&self) -> Result<IngestCursor> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IngestCursor::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, cursor: &IngestCursor) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(cursor)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), watermark = ?cursor.watermark, "cursor saved");
        Ok(())
    }
}
