//! Route handlers.

mod chat;
mod completions;
mod embeddings;
mod fim;
mod info;

pub use chat::chat_completions;
pub use completions::{completions, responses};
pub use embeddings::embeddings;
pub use fim::infill;
pub use info::{api_show, api_tags, health, model_detail, models, oai_to_text, props};

use crate::error::{ApiError, ApiResult};
use axum::http::HeaderMap;
use llama_chat::SessionId;

pub const SESSION_HEADER: &str = "x-session-id";

/// Session named by the `X-Session-Id` header, falling back to the body field
pub(crate) fn requested_session(
    headers: &HeaderMap,
    body_field: Option<&str>,
) -> ApiResult<Option<SessionId>> {
    let header = headers
        .get(SESSION_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::bad_request("X-Session-Id must be ASCII"))
        })
        .transpose()?;
    match header.or(body_field).map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            ApiError::bad_request(format!("Invalid session id '{}': expected a ULID", raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_wins_over_body() {
        let header_id = SessionId::new();
        let body_id = SessionId::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            SESSION_HEADER,
            HeaderValue::from_str(&header_id.to_string()).unwrap(),
        );
        let chosen = requested_session(&headers, Some(&body_id.to_string())).unwrap();
        assert_eq!(chosen, Some(header_id));
    }

    #[test]
    fn test_no_session_is_ephemeral() {
        assert_eq!(requested_session(&HeaderMap::new(), None).unwrap(), None);
        assert_eq!(requested_session(&HeaderMap::new(), Some(" ")).unwrap(), None);
    }

    #[test]
    fn test_bad_session_id() {
        let result = requested_session(&HeaderMap::new(), Some("not-a-ulid"));
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
