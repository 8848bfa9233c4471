//! Settings shared by the commands and the model loading they have in common.

use crate::cli::Cli;
use anyhow::{Context, Result};
use llama_chat::{ContextConfig, LlamaEngine, SamplingParams};
use llama_common::ValidatedConfig;
use llama_embedding::{EmbeddingConfig, EmbeddingModel, SharedEmbeddingModel};
use llama_loader::{DownloadOptions, Downloader, ModelCache, ModelConfig, ModelLoader, ModelResolver};
use std::sync::Arc;
use tracing::info;

/// Global flags turned into the config values the library crates take
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model: ModelConfig,
    pub context: ContextConfig,
    pub n_predict: usize,
    pub repeat_penalty: f32,
}

impl RunOptions {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let options = Self {
            model: ModelConfig {
                n_gpu_layers: cli.ngl,
                debug: cli.debug,
                ..ModelConfig::default()
            },
            context: ContextConfig {
                n_ctx: cli.ctx,
                n_batch: cli.batch,
            },
            n_predict: cli.npredict,
            repeat_penalty: cli.repeat_penalty,
        };
        options.model.validate()?;
        options.context.validate()?;
        Ok(options)
    }

    /// Greedy sampling with the configured repetition penalty
    pub fn sampling(&self) -> Result<SamplingParams> {
        let sampling = SamplingParams {
            repeat_penalty: self.repeat_penalty,
            ..SamplingParams::greedy()
        };
        sampling.validate()?;
        Ok(sampling)
    }
}

/// Resolver over the model directory
pub fn resolver() -> Result<ModelResolver> {
    let cache = ModelCache::from_env()?;
    let downloader = Downloader::new(DownloadOptions::default())?;
    Ok(ModelResolver::new(cache, downloader))
}

/// Resolve `reference`, downloading it if needed, and load it for chat
pub async fn load_engine(options: &RunOptions, reference: &str) -> Result<Arc<LlamaEngine>> {
    let resolved = resolver()?.resolve(reference).await?;
    let loader = ModelLoader::new(options.model.clone())?;
    let loaded = loader
        .load(&resolved)
        .await
        .with_context(|| format!("cannot load {}", resolved.path.display()))?;
    info!(
        "Loaded {} in {:?}",
        loaded.metadata.filename, loaded.metadata.load_time
    );
    Ok(Arc::new(LlamaEngine::new(loaded, loader.backend())))
}

/// Resolve and load an embedding model
pub async fn load_embedder(options: &RunOptions, reference: &str) -> Result<SharedEmbeddingModel> {
    let resolved = resolver()?.resolve(reference).await?;
    let loader = ModelLoader::new(options.model.clone())?;
    let model = EmbeddingModel::load(&loader, &resolved, EmbeddingConfig::default())
        .await
        .with_context(|| format!("cannot load embedding model {}", resolved.path.display()))?;
    Ok(SharedEmbeddingModel::new(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_options_follow_flags() {
        let cli = Cli::parse_from([
            "avllm",
            "--ctx",
            "2048",
            "--ngl",
            "10",
            "--repeat-penalty",
            "1.1",
            "chat",
            "m.gguf",
        ]);
        let options = RunOptions::from_cli(&cli).unwrap();
        assert_eq!(options.context.n_ctx, 2048);
        assert_eq!(options.context.n_batch, 4096);
        assert_eq!(options.model.n_gpu_layers, 10);
        assert_eq!(options.sampling().unwrap().repeat_penalty, 1.1);
        assert!(options.sampling().unwrap().is_greedy());
    }

    #[test]
    fn test_tiny_context_is_rejected() {
        let cli = Cli::parse_from(["avllm", "--ctx", "4", "chat", "m.gguf"]);
        assert!(RunOptions::from_cli(&cli).is_err());
    }
}
