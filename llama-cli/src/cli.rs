//! Command-line definition for `avllm`.

use clap::{Parser, Subcommand};

/// avllm - run GGUF models locally.
///
/// Models are referenced by a `.gguf` path, a file name in the model
/// directory, a built-in alias or an http(s) URL.
#[derive(Parser, Debug)]
#[command(name = "avllm")]
#[command(version)]
#[command(about = "Chat with GGUF models or serve them over an OpenAI-compatible API")]
#[command(
    long_about = "avllm runs GGUF models through llama.cpp, either as an interactive chat \
    or behind an OpenAI-compatible HTTP server.\n\n\
    Downloaded models live in ~/.av_llm.\n\n\
    Environment variables:\n  \
    AVLLM_HOME  Override the model directory\n  \
    RUST_LOG    Override the log filter"
)]
pub struct Cli {
    /// Context size in tokens
    #[arg(long, global = true, default_value_t = 1024, value_name = "N")]
    pub ctx: u32,

    /// Batch size for prompt processing
    #[arg(long, global = true, default_value_t = 4096, value_name = "N")]
    pub batch: u32,

    /// Layers to offload to the GPU
    #[arg(long, global = true, default_value_t = 0, value_name = "N")]
    pub ngl: u32,

    /// Maximum tokens generated per reply
    #[arg(long, global = true, default_value_t = 1024, value_name = "N")]
    pub npredict: usize,

    /// Repetition penalty; 1.0 disables it
    #[arg(long, global = true, default_value_t = 1.0, value_name = "X")]
    pub repeat_penalty: f32,

    /// Enable debug output to stderr, including llama.cpp's own logs
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage downloaded models
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Chat with a model in the terminal
    ///
    /// The first line you type is the system message; every later line is a
    /// user message. An empty line ends the chat.
    Chat {
        /// Model path, file name, alias or URL
        model: String,
    },

    /// Serve a model over an OpenAI-compatible HTTP API
    Serve {
        /// Model path, file name, alias or URL
        model: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Requests processed in parallel
        #[arg(long = "np", default_value_t = 1, value_name = "N")]
        parallel: usize,
        /// Embedding model for /v1/embeddings
        #[arg(long, value_name = "MODEL")]
        emb_model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelAction {
    /// List downloaded models
    Ls,
    /// Download a model by alias or URL
    Pull {
        /// Alias or http(s) URL
        reference: String,
    },
    /// Delete a downloaded model
    Del {
        /// File name inside the model directory
        name: String,
    },
}
