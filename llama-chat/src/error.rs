//! Error types for sessions, generation and the request queue.

use llama_common::error::{ErrorCategory, LlamaError};
use thiserror::Error;

/// Failures of a single chat or completion turn
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("Model load failed: {0}\n💡 Check the model file exists, is valid GGUF format, and sufficient memory is available")]
    ModelLoadFailure(String),

    #[error("Context initialisation failed: {0}\n💡 Try a smaller --ctx or --batch value")]
    ContextInitFailure(String),

    #[error("Template rendering failed: {0}")]
    TemplateRenderFailure(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailure(String),

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    /// The context window cannot hold the next batch
    #[error("Context size exceeded: {used} cells used, {requested} requested, capacity {capacity}\n💡 Start a new session or increase --ctx")]
    ContextExceeded {
        used: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("{0}")]
    InvalidRequest(String),

    /// The model lacks something the request needs, e.g. FIM tokens
    #[error("{0}")]
    MissingCapability(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn template<E: std::fmt::Display>(error: E) -> Self {
        Self::TemplateRenderFailure(error.to_string())
    }

    pub fn tokenization<E: std::fmt::Display>(error: E) -> Self {
        Self::TokenizeFailure(error.to_string())
    }

    pub fn decoding<E: std::fmt::Display>(error: E) -> Self {
        Self::DecodeFailure(error.to_string())
    }

    pub fn context_init<E: std::fmt::Display>(error: E) -> Self {
        Self::ContextInitFailure(error.to_string())
    }
}

impl LlamaError for ChatError {
    fn category(&self) -> ErrorCategory {
        match self {
            ChatError::ModelLoadFailure(_) => ErrorCategory::Internal,
            ChatError::ContextInitFailure(_) => ErrorCategory::Internal,
            ChatError::TemplateRenderFailure(_) => ErrorCategory::User,
            ChatError::TokenizeFailure(_) => ErrorCategory::User,
            ChatError::DecodeFailure(_) => ErrorCategory::Internal,
            ChatError::ContextExceeded { .. } => ErrorCategory::User,
            ChatError::InvalidRequest(_) => ErrorCategory::User,
            ChatError::MissingCapability(_) => ErrorCategory::Internal,
            ChatError::Cancelled => ErrorCategory::System,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ChatError::ModelLoadFailure(_) => "CHAT_MODEL_LOAD",
            ChatError::ContextInitFailure(_) => "CHAT_CONTEXT_INIT",
            ChatError::TemplateRenderFailure(_) => "CHAT_TEMPLATE_RENDER",
            ChatError::TokenizeFailure(_) => "CHAT_TOKENIZE",
            ChatError::DecodeFailure(_) => "CHAT_DECODE",
            ChatError::ContextExceeded { .. } => "CHAT_CONTEXT_EXCEEDED",
            ChatError::InvalidRequest(_) => "CHAT_INVALID_REQUEST",
            ChatError::MissingCapability(_) => "CHAT_MISSING_CAPABILITY",
            ChatError::Cancelled => "CHAT_CANCELLED",
        }
    }

    // A turn is never replayed: part of it may already sit in the KV cache.
    fn is_retriable(&self) -> bool {
        false
    }
}

/// Errors related to session management
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session limit exceeded: all {max} sessions are busy\n💡 Wait and retry, or raise the session limit")]
    LimitExceeded { max: usize },
}

impl LlamaError for SessionError {
    fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotFound(_) => ErrorCategory::User,
            SessionError::LimitExceeded { .. } => ErrorCategory::System,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
            SessionError::LimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
        }
    }
}

/// Errors related to request queue operations
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Queue is full\n💡 Wait and retry, or start the server with more parallel workers")]
    Full,

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlamaError for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Full => ErrorCategory::System,
            QueueError::ShuttingDown => ErrorCategory::System,
            QueueError::WorkerError(_) => ErrorCategory::Internal,
            QueueError::Cancelled => ErrorCategory::System,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            QueueError::Full => "QUEUE_FULL",
            QueueError::ShuttingDown => "QUEUE_SHUTTING_DOWN",
            QueueError::WorkerError(_) => "QUEUE_WORKER",
            QueueError::Cancelled => "QUEUE_CANCELLED",
        }
    }

    fn is_retriable(&self) -> bool {
        matches!(self, QueueError::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_error_categories() {
        assert!(ChatError::invalid_request("x").is_user_error());
        assert!(ChatError::template("bad").is_user_error());
        assert_eq!(
            ChatError::decoding("boom").category().http_status(),
            500
        );
        let exceeded = ChatError::ContextExceeded {
            used: 10,
            requested: 5,
            capacity: 12,
        };
        assert_eq!(exceeded.category().http_status(), 400);
        assert_eq!(exceeded.error_code(), "CHAT_CONTEXT_EXCEEDED");
        assert!(!exceeded.is_retriable());
    }

    #[test]
    fn test_queue_and_session_are_busy_errors() {
        assert_eq!(QueueError::Full.category().http_status(), 503);
        assert!(QueueError::Full.is_retriable());
        assert!(!QueueError::ShuttingDown.is_retriable());
        assert_eq!(
            SessionError::LimitExceeded { max: 4 }.category().http_status(),
            503
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ChatError::invalid_request("Missing or empty messages").to_string(),
            "Missing or empty messages"
        );
        assert!(ChatError::ContextExceeded {
            used: 1,
            requested: 2,
            capacity: 2
        }
        .to_string()
        .starts_with("Context size exceeded: 1 cells used, 2 requested, capacity 2"));
    }
}
