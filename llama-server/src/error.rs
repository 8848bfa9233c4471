//! Error responses in the OpenAI `{"error": {...}}` shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llama_chat::{ChatError, QueueError, SessionError};
use llama_common::error::{ErrorCategory, LlamaError};
use llama_embedding::EmbeddingError;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Malformed body or parameter
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The server was started without the model this route needs
    #[error("{0}")]
    Unsupported(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            other => StatusCode::from_u16(other.category().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// JSON body for this error, also used for SSE error events
    pub fn body(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.category().as_str(),
                "code": self.error_code(),
            }
        })
    }
}

impl LlamaError for ApiError {
    fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Chat(e) => e.category(),
            ApiError::Session(e) => e.category(),
            ApiError::Queue(e) => e.category(),
            ApiError::Embedding(e) => e.category(),
            ApiError::BadRequest(_) | ApiError::NotFound(_) => ErrorCategory::User,
            ApiError::Unsupported(_) => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Chat(e) => e.error_code(),
            ApiError::Session(e) => e.error_code(),
            ApiError::Queue(e) => e.error_code(),
            ApiError::Embedding(e) => e.error_code(),
            ApiError::BadRequest(_) => "API_BAD_REQUEST",
            ApiError::NotFound(_) => "API_NOT_FOUND",
            ApiError::Unsupported(_) => "API_UNSUPPORTED",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, self);
        } else {
            warn!("Request rejected with {}: {}", status, self);
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ApiError::bad_request("Missing or empty messages"), 400)]
    #[case(ChatError::invalid_request("x").into(), 400)]
    #[case(ChatError::TemplateRenderFailure("x".into()).into(), 400)]
    #[case(ChatError::TokenizeFailure("x".into()).into(), 400)]
    #[case(ChatError::ContextExceeded { used: 8, requested: 4, capacity: 8 }.into(), 400)]
    #[case(ChatError::decoding("x").into(), 500)]
    #[case(QueueError::Full.into(), 503)]
    #[case(SessionError::LimitExceeded { max: 4 }.into(), 503)]
    #[case(ApiError::Unsupported("no embedding model".into()), 500)]
    #[case(ApiError::NotFound("x".into()), 404)]
    fn test_status_mapping(#[case] error: ApiError, #[case] status: u16) {
        assert_eq!(error.status().as_u16(), status);
    }

    #[test]
    fn test_body_shape() {
        let body = ApiError::bad_request("Missing or empty messages").body();
        assert_eq!(body["error"]["message"], "Missing or empty messages");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "API_BAD_REQUEST");
    }
}
