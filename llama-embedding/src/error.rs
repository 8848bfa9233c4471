use llama_common::error::{ErrorCategory, LlamaError};
use thiserror::Error;

/// Errors that can occur during embedding operations
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model loading error: {0}")]
    ModelLoader(#[from] llama_loader::ModelError),

    /// Context creation or decode failure inside llama.cpp
    #[error("Model error: {0}\n💡 Check that the model supports embeddings and that memory is available")]
    Model(String),

    #[error("Text processing error: {0}")]
    TextProcessing(String),

    #[error("Input text cannot be empty")]
    EmptyInput,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    pub fn model<S: Into<String>>(message: S) -> Self {
        Self::Model(message.into())
    }

    pub fn text_processing<S: Into<String>>(message: S) -> Self {
        Self::TextProcessing(message.into())
    }
}

impl LlamaError for EmbeddingError {
    fn category(&self) -> ErrorCategory {
        match self {
            EmbeddingError::ModelLoader(model_error) => model_error.category(),
            EmbeddingError::Model(_) => ErrorCategory::System,
            EmbeddingError::TextProcessing(_) => ErrorCategory::User,
            EmbeddingError::EmptyInput => ErrorCategory::User,
            EmbeddingError::Configuration(_) => ErrorCategory::User,
            EmbeddingError::DimensionMismatch { .. } => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            EmbeddingError::ModelLoader(_) => "EMBEDDING_MODEL_LOADER",
            EmbeddingError::Model(_) => "EMBEDDING_MODEL",
            EmbeddingError::TextProcessing(_) => "EMBEDDING_TEXT_PROCESSING",
            EmbeddingError::EmptyInput => "EMBEDDING_EMPTY_INPUT",
            EmbeddingError::Configuration(_) => "EMBEDDING_CONFIGURATION",
            EmbeddingError::DimensionMismatch { .. } => "EMBEDDING_DIMENSION_MISMATCH",
        }
    }
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(EmbeddingError::EmptyInput.category(), ErrorCategory::User);
        assert_eq!(
            EmbeddingError::model("decode").category(),
            ErrorCategory::System
        );
        let loader: EmbeddingError = llama_loader::ModelError::not_found("x").into();
        assert_eq!(loader.category(), ErrorCategory::User);
        assert_eq!(loader.error_code(), "EMBEDDING_MODEL_LOADER");
    }

    #[test]
    fn test_display() {
        let err = EmbeddingError::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Embedding dimension mismatch: expected 4, got 3"
        );
    }
}
