use llama_common::error::{ErrorCategory, LlamaError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving, downloading or loading a model
#[derive(Debug, Error)]
pub enum ModelError {
    /// llama.cpp refused to load the file
    #[error("Model loading failed: {0}\n🔧 Check available memory and verify GGUF file integrity")]
    LoadingFailed(String),

    /// Reference did not match a file, cached model, alias or URL
    #[error("Model not found: {0}\n📁 Use a .gguf path, a name from `avllm model ls`, a known alias or an http(s) URL")]
    NotFound(String),

    #[error("Invalid model config: {0}\n⚙️ Check --ngl, --ctx and --batch values")]
    InvalidConfig(String),

    /// Download failed at the transport or HTTP level
    #[error("Network error: {0}\n🌐 Check internet connection and that the URL is reachable")]
    Network(String),

    #[error("I/O error: {0}\n💾 Check disk space, file permissions, and storage availability")]
    Io(#[from] std::io::Error),

    /// Application data directory problem
    #[error("Cache error: {0}\n💽 Check permissions of the model directory (AVLLM_HOME or ~/.av_llm)")]
    Cache(String),
}

impl ModelError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }
}

impl LlamaError for ModelError {
    fn category(&self) -> ErrorCategory {
        match self {
            ModelError::LoadingFailed(_) => ErrorCategory::System,
            ModelError::NotFound(_) => ErrorCategory::User,
            ModelError::InvalidConfig(_) => ErrorCategory::User,
            ModelError::Network(_) => ErrorCategory::External,
            ModelError::Io(_) => ErrorCategory::System,
            ModelError::Cache(_) => ErrorCategory::System,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ModelError::LoadingFailed(_) => "MODEL_LOADING_FAILED",
            ModelError::NotFound(_) => "MODEL_NOT_FOUND",
            ModelError::InvalidConfig(_) => "MODEL_INVALID_CONFIG",
            ModelError::Network(_) => "MODEL_NETWORK_ERROR",
            ModelError::Io(_) => "MODEL_IO_ERROR",
            ModelError::Cache(_) => "MODEL_CACHE_ERROR",
        }
    }

    fn is_retriable(&self) -> bool {
        matches!(self, ModelError::Network(_))
    }

    fn custom_retry_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ModelError::Network(msg)
                if msg.contains("429") || msg.to_lowercase().contains("rate limit") =>
            {
                Some(Duration::from_secs(30 * (attempt + 1) as u64))
            }
            _ => None,
        }
    }

    fn should_stop_retrying(&self, _attempt: u32) -> bool {
        match self {
            ModelError::Network(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("401")
                    || msg.contains("403")
                    || msg.contains("404")
                    || msg.contains("unauthorized")
                    || msg.contains("forbidden")
            }
            _ => false,
        }
    }
}

impl From<llama_cpp_2::LlamaCppError> for ModelError {
    fn from(err: llama_cpp_2::LlamaCppError) -> Self {
        ModelError::LoadingFailed(format!("llama-cpp-2 error: {}", err))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ModelError::Network(format!("HTTP {}: {}", status.as_u16(), err)),
            None => ModelError::Network(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_only_network_errors_retry() {
        assert!(ModelError::network("connection reset").is_retriable());
        assert!(!ModelError::LoadingFailed("bad file".into()).is_retriable());
        assert!(!ModelError::not_found("x").is_retriable());
    }

    #[test]
    fn test_client_errors_stop_retrying() {
        assert!(ModelError::network("HTTP 404: missing").should_stop_retrying(1));
        assert!(ModelError::network("HTTP 403: Forbidden").should_stop_retrying(1));
        assert!(!ModelError::network("HTTP 502: bad gateway").should_stop_retrying(1));
    }

    #[test]
    fn test_rate_limit_delay() {
        let err = ModelError::network("HTTP 429: Too Many Requests");
        assert_eq!(err.custom_retry_delay(1), Some(Duration::from_secs(60)));
        assert_eq!(ModelError::network("timeout").custom_retry_delay(1), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let model_err = ModelError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(model_err, ModelError::Io(_)));
        assert_eq!(model_err.category(), ErrorCategory::System);
    }

    #[test]
    fn test_error_display_has_hint() {
        let display = ModelError::not_found("foo").to_string();
        assert!(display.contains("foo"));
        assert!(display.contains("📁"));
    }
}
