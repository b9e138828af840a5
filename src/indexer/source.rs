use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::{BalerError, Result};
use crate::models::{AlbumRecord, RawDocument};

/// Where scraped reviews come from. Returns every document scraped strictly
/// after `watermark` (everything when `None`).
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> Result<Vec<RawDocument>>;
}

/// Directory of daily scrape files, one JSON review per line.
#[derive(Debug, Clone)]
pub struct JsonlArchive {
    root: PathBuf,
}

fn is_archive_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref(),
        Some("jsonl") | Some("ndjson")
    )
}

impl JsonlArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(BalerError::config(format!(
                "archive directory not found: {}",
                self.root.display()
            )));
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_archive_file(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Reads every archived review. Lines that fail to parse, including
    /// lines that are not valid UTF-8, are logged and skipped so one bad
    /// record never blocks a night's run.
    pub fn read_all(&self) -> Result<Vec<RawDocument>> {
        let mut documents = Vec::new();
        for path in self.archive_files()? {
            let content = std::fs::read(&path)
                .map_err(|e| BalerError::transient(format!("reading {}", path.display()), e))?;
            for (line_no, line) in content.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<RawDocument>(line) {
                    Ok(doc) => documents.push(doc.with_derived_album_identifier()),
                    Err(e) => tracing::warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "skipping malformed archive record"
                    ),
                }
            }
        }
        Ok(documents)
    }

    /// Album records derived from the archive, latest review winning. Used
    /// when no dedicated catalog is configured.
    pub fn catalog(&self) -> Result<Vec<AlbumRecord>> {
        let mut latest: BTreeMap<String, RawDocument> = BTreeMap::new();
        for doc in self.read_all()? {
            if doc.validate().is_err() {
                continue;
            }
            match latest.get(&doc.album_identifier) {
                Some(existing) if existing.scrape_timestamp > doc.scrape_timestamp => {}
                _ => {
                    latest.insert(doc.album_identifier.clone(), doc);
                }
            }
        }
        Ok(latest
            .into_values()
            .map(|doc| AlbumRecord {
                album_identifier: doc.album_identifier,
                artist: doc.artist,
                title: doc.album_title,
                spotify_uri: None,
            })
            .collect())
    }
}

#[async_trait]
impl DocumentSource for JsonlArchive {
    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> Result<Vec<RawDocument>> {
        let archive = self.clone();
        let documents = tokio::task::spawn_blocking(move || archive.read_all())
            .await
            .map_err(|e| BalerError::transient("archive reader", e))??;
        let total = documents.len();
        let fresh: Vec<RawDocument> = documents
            .into_iter()
            .filter(|d| watermark.map_or(true, |w| d.scrape_timestamp > w))
            .collect();
        tracing::info!(root = %self.root.display(), total, fresh = fresh.len(), "archive scanned");
        Ok(fresh)
    }
}
