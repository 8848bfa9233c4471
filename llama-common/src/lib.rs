//! # Llama Common
//!
//! Shared error classification, configuration validation, retry and logging
//! helpers used by every crate in the avllm workspace.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;

// Re-export main traits for convenience
pub use config::ValidatedConfig;
pub use error::{CommonError, ErrorCategory, LlamaError};
pub use logging::init_tracing;
pub use retry::{RetryConfig, RetryManager, RetryableError};
