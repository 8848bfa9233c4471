use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use llama_chat::{ChatError, FimRequest};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// `POST /infill` and `POST /fim`: `{content}` between the prefix and suffix
pub async fn infill(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<Value>> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::from(ChatError::invalid_request("Invalid JSON body")))?;
    let request = FimRequest::from_json(&body)?;
    debug!(
        "Infill with {} prefix bytes, {} suffix bytes, {} extra chunks",
        request.input_prefix.len(),
        request.input_suffix.len(),
        request.input_extra.len()
    );

    let engine = state.engine.clone();
    let context_config = state.config.context.clone();
    let outcome = state
        .run(None, move |_| {
            llama_chat::infill(engine.as_ref(), &context_config, &request)
        })
        .await?;
    Ok(Json(json!({ "content": outcome.text })))
}
