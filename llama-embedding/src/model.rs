use crate::error::{EmbeddingError, EmbeddingResult as Result};
use crate::types::{Embedding, EmbeddingConfig};
use async_trait::async_trait;
use llama_common::ValidatedConfig;
use llama_cpp_2::{
    context::{
        params::{LlamaContextParams, LlamaPoolingType},
        LlamaContext,
    },
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{AddBos, LlamaModel},
};
use llama_loader::{ModelLoader, ResolvedModel};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Anything that turns text into a fixed-size vector
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    fn dimension(&self) -> usize;

    /// Identifier reported to API clients
    fn name(&self) -> &str;
}

/// Embedding model with its own llama.cpp context
///
/// Single-threaded: callers share it through [`SharedEmbeddingModel`].
pub struct EmbeddingModel {
    // Declared before `model` so the context is dropped first.
    context: Option<LlamaContext<'static>>,
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    config: EmbeddingConfig,
    name: String,
}

// SAFETY: the context and model are only reached through &mut self, so no two
// threads touch the underlying llama.cpp objects at once.
unsafe impl Send for EmbeddingModel {}
unsafe impl Sync for EmbeddingModel {}

impl EmbeddingModel {
    /// Load the embedding model behind `resolved`
    pub async fn load(
        loader: &ModelLoader,
        resolved: &ResolvedModel,
        config: EmbeddingConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EmbeddingError::Configuration(e.to_string()))?;
        let loaded = loader.load(resolved).await?;
        info!(
            "Embedding model {} ready, dimension {}",
            loaded.metadata.filename,
            loaded.model.n_embd()
        );
        Ok(Self {
            context: None,
            model: loaded.model,
            backend: loader.backend(),
            config,
            name: loaded.metadata.filename,
        })
    }

    pub fn dimension(&self) -> usize {
        self.model.n_embd().max(0) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_context(&mut self) -> Result<()> {
        if self.context.is_some() {
            return Ok(());
        }

        let n_ctx = self.config.n_ctx;
        debug!("Creating embedding context with {} tokens", n_ctx);
        let params = LlamaContextParams::default()
            .with_embeddings(true)
            .with_pooling_type(LlamaPoolingType::Last)
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_ctx)
            .with_n_ubatch(n_ctx);

        let ctx = self
            .model
            .new_context(&self.backend, params)
            .map_err(|e| EmbeddingError::model(format!("Context creation failed: {}", e)))?;

        // SAFETY: the context borrows `self.model`, which lives as long as
        // `self` and is dropped after the context.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };
        self.context = Some(ctx);
        Ok(())
    }

    /// Embed one text, truncating it to the context size
    pub fn embed_text(&mut self, text: &str) -> Result<Embedding> {
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        self.ensure_context()?;

        let start = Instant::now();
        let max_tokens = self.config.n_ctx as usize;
        let normalize = self.config.normalize;
        let dim = self.dimension();

        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| EmbeddingError::model("context missing"))?;

        ctx.clear_kv_cache();

        let mut tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EmbeddingError::text_processing(format!("Tokenize failed: {}", e)))?;
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        if tokens.len() > max_tokens {
            debug!("Truncating {} -> {} tokens", tokens.len(), max_tokens);
            tokens.truncate(max_tokens);
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        batch
            .add_sequence(&tokens, 0, false)
            .map_err(|e| EmbeddingError::model(format!("Batch failed: {}", e)))?;
        ctx.decode(&mut batch)
            .map_err(|e| EmbeddingError::model(format!("Decode failed: {}", e)))?;

        let vector = ctx
            .embeddings_seq_ith(0)
            .map_err(|e| EmbeddingError::model(format!("Extract failed: {}", e)))?
            .to_vec();

        if vector.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }

        let mut embedding = Embedding {
            vector,
            token_count: tokens.len(),
            processing_time_ms: start.elapsed().as_millis() as u64,
        };
        if normalize {
            embedding.normalize();
        }
        Ok(embedding)
    }
}

/// [`EmbeddingModel`] behind a mutex, usable from async handlers
pub struct SharedEmbeddingModel {
    inner: Arc<Mutex<EmbeddingModel>>,
    dimension: usize,
    name: String,
}

impl SharedEmbeddingModel {
    pub fn new(model: EmbeddingModel) -> Self {
        Self {
            dimension: model.dimension(),
            name: model.name().to_string(),
            inner: Arc::new(Mutex::new(model)),
        }
    }
}

#[async_trait]
impl TextEmbedder for SharedEmbeddingModel {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let inner = self.inner.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || inner.blocking_lock().embed_text(&text))
            .await
            .map_err(|e| EmbeddingError::model(format!("embedding task failed: {}", e)))?
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_loader::{ModelConfig, ModelSource};
    use serial_test::serial;
    use std::path::PathBuf;

    #[tokio::test]
    #[serial]
    async fn test_load_rejects_bad_config() {
        let loader = ModelLoader::new(ModelConfig::default()).unwrap();
        let resolved = ResolvedModel {
            path: PathBuf::from("/missing/emb.gguf"),
            source: ModelSource::Cached {
                name: "emb.gguf".into(),
            },
            cache_hit: true,
        };
        let config = EmbeddingConfig {
            n_ctx: 1,
            ..Default::default()
        };
        let result = EmbeddingModel::load(&loader, &resolved, config).await;
        assert!(matches!(result, Err(EmbeddingError::Configuration(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_load_missing_file() {
        let loader = ModelLoader::new(ModelConfig::default()).unwrap();
        let resolved = ResolvedModel {
            path: PathBuf::from("/missing/emb.gguf"),
            source: ModelSource::Cached {
                name: "emb.gguf".into(),
            },
            cache_hit: true,
        };
        let result = EmbeddingModel::load(&loader, &resolved, EmbeddingConfig::default()).await;
        assert!(matches!(result, Err(EmbeddingError::ModelLoader(_))));
    }
}
