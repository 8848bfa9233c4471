//! # Llama Server
//!
//! OpenAI-compatible HTTP front-end over a loaded model: chat and text
//! completions with server-sent events, fill-in-middle, embeddings, and a few
//! Ollama and llama.cpp style info routes.
//!
//! Requests run on the bounded worker pool from `llama-chat`; chat requests
//! carrying an `X-Session-Id` header (or `session_id` field) reuse that
//! session's KV cache across turns.

pub mod config;
pub mod error;
pub mod handlers;
pub mod openai;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use server::{bind, router, run, serve, ServerError};
pub use state::AppState;
