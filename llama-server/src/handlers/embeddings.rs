use crate::error::{ApiError, ApiResult};
use crate::openai::{parse_body, EmbeddingInput, EmbeddingsRequest};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// `POST /v1/embeddings`
///
/// Answers with the bare vector for a string input and a list of vectors for
/// a list input.
pub async fn embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<Value>> {
    let embedder = state.embedder.clone().ok_or_else(|| {
        ApiError::Unsupported(
            "No embedding model is loaded; start the server with --emb-model".to_string(),
        )
    })?;
    let request: EmbeddingsRequest = parse_body(&body)?;
    match request.input {
        Some(EmbeddingInput::Single(text)) => {
            let embedding = embedder.embed(&text).await?;
            Ok(Json(json!(embedding.vector)))
        }
        Some(EmbeddingInput::Batch(texts)) if !texts.is_empty() => {
            let mut vectors = Vec::with_capacity(texts.len());
            for text in &texts {
                vectors.push(embedder.embed(text).await?.vector);
            }
            Ok(Json(json!(vectors)))
        }
        _ => Err(ApiError::bad_request("\"input\" must be a string or a non-empty list of strings")),
    }
}
