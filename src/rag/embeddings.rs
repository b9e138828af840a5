use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};

use crate::error::{BalerError, Result};

/// Text to fixed-length vector. Implementations must be deterministic for a
/// given `model_version`; vectors from different versions are not comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embeds a batch; output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BalerError::transient("embedding", "model returned no vector"))
    }
}

/// Verifies the model answered with one vector of the expected width per input.
pub fn check_vectors(expected: usize, dimension: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(BalerError::transient(
            "embedding",
            format!("model returned {} vectors for {} inputs", vectors.len(), expected),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(BalerError::config(format!(
            "embedding model produced {}-dimensional vectors, configured dimension is {}",
            bad.len(),
            dimension
        )));
    }
    Ok(vectors)
}

/// ONNX sentence-transformer loaded from local files through fastembed.
pub struct FastEmbedder {
    model: Arc<TextEmbedding>,
    model_version: String,
    dimension: usize,
    batch_size: usize,
}

impl FastEmbedder {
    pub fn from_dir(
        model_dir: &Path,
        model_version: impl Into<String>,
        dimension: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let model_version = model_version.into();
        tracing::info!(model = %model_version, dir = %model_dir.display(), "loading embedding model");

        if !model_dir.exists() {
            return Err(BalerError::config(format!(
                "model directory not found: {}",
                model_dir.display()
            )));
        }

        let read = |name: &str| {
            std::fs::read(model_dir.join(name))
                .map_err(|e| BalerError::config(format!("failed to read {}: {}", name, e)))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| BalerError::config(format!("failed to initialize embedding model: {}", e)))?;

        // Fail at startup, not mid-run, when the configured width is wrong.
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| BalerError::config(format!("embedding model probe failed: {}", e)))?;
        check_vectors(1, dimension, probe)?;

        tracing::info!(model = %model_version, dimension, "embedding model ready");
        Ok(Self {
            model: Arc::new(model),
            model_version,
            dimension,
            batch_size: batch_size.max(1),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let owned = texts.to_vec();
        let batch_size = self.batch_size;

        let vectors = tokio::task::spawn_blocking(move || model.embed(owned, Some(batch_size)))
            .await
            .map_err(|e| BalerError::transient("embedding worker", e))?
            .map_err(|e| BalerError::transient("embedding model", e))?;

        check_vectors(texts.len(), self.dimension, vectors)
    }
}
