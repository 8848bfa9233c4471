//! `avllm serve`

use crate::runtime::{load_embedder, load_engine, RunOptions};
use anyhow::Result;
use llama_common::ValidatedConfig;
use llama_embedding::TextEmbedder;
use llama_server::{AppState, ServerConfig};
use std::sync::Arc;

/// Flags of the `serve` subcommand
#[derive(Debug, Clone)]
pub struct ServeArgs {
    pub model: String,
    pub host: String,
    pub port: u16,
    pub parallel: usize,
    pub emb_model: Option<String>,
}

pub fn server_config(options: &RunOptions, args: &ServeArgs) -> Result<ServerConfig> {
    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        model_path: args.model.clone(),
        n_predict: options.n_predict,
        repeat_penalty: options.repeat_penalty,
        context: options.context.clone(),
        ..ServerConfig::default()
    }
    .with_parallel(args.parallel);
    Ok(config.validated()?)
}

pub async fn run(options: RunOptions, args: ServeArgs) -> Result<()> {
    // Fail on a bad address before spending time on model loading.
    let config = server_config(&options, &args)?;

    let engine = load_engine(&options, &args.model).await?;
    let embedder = match &args.emb_model {
        Some(reference) => {
            let model: Arc<dyn TextEmbedder> = Arc::new(load_embedder(&options, reference).await?);
            Some(model)
        }
        None => None,
    };

    let state = Arc::new(AppState::new(engine, embedder, config));
    llama_server::run(state).await?;
    Ok(())
}
