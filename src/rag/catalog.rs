use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::{BalerError, Result};
use crate::models::AlbumRecord;

/// Looks up album metadata. A miss is `Ok(None)`, never an error.
#[async_trait]
pub trait AlbumResolver: Send + Sync {
    async fn resolve(&self, album_identifier: &str) -> Result<Option<AlbumRecord>>;
}

/// Resolver over a fixed set of records, loaded from a JSON array or built
/// from the review archive.
#[derive(Debug, Default, Clone)]
pub struct CatalogResolver {
    records: HashMap<String, AlbumRecord>,
}

impl CatalogResolver {
    pub fn new(records: impl IntoIterator<Item = AlbumRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.album_identifier.clone(), r))
                .collect(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            BalerError::config(format!("failed to read catalog {}: {}", path.display(), e))
        })?;
        let records: Vec<AlbumRecord> = serde_json::from_slice(&bytes)?;
        tracing::info!(path = %path.display(), albums = records.len(), "loaded album catalog");
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AlbumResolver for CatalogResolver {
    async fn resolve(&self, album_identifier: &str) -> Result<Option<AlbumRecord>> {
        Ok(self.records.get(album_identifier).cloned())
    }
}
