//! avllm - chat with GGUF models or serve them over HTTP.
//!
//! Commands:
//! - `avllm model ls`: List downloaded models
//! - `avllm model pull <alias|url>`: Download a model
//! - `avllm model del <name>`: Delete a downloaded model
//! - `avllm chat <model>`: Chat in the terminal
//! - `avllm serve <model>`: OpenAI-compatible HTTP server
//!
//! Environment variables:
//! - AVLLM_HOME: Override the model directory (default `~/.av_llm`)
//! - RUST_LOG: Override the log filter
//!
//! Exit codes:
//! - 0: Success
//! - 1: Error

mod cli;
mod commands;
mod runtime;
mod table;

use clap::Parser;
use cli::{Cli, Commands};
use commands::serve::ServeArgs;
use llama_common::init_tracing;
use runtime::RunOptions;

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = RunOptions::from_cli(&cli)?;
    match cli.command {
        Commands::Model { action } => commands::model::run(action).await,
        Commands::Chat { model } => commands::chat::run(options, &model).await,
        Commands::Serve {
            model,
            port,
            host,
            parallel,
            emb_model,
        } => {
            commands::serve::run(
                options,
                ServeArgs {
                    model,
                    host,
                    port,
                    parallel,
                    emb_model,
                },
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
