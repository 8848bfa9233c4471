use crate::error::{ApiError, ApiResult};
use crate::openai::{parse_body, to_chat_messages, MessagesOnly, ModelList, ModelObject};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "name": "avllm",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.uptime_secs(),
    }))
}

/// `GET /v1/models`
pub async fn models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let mut data = vec![ModelObject::new(state.model_name(), state.created())];
    if let Some(embedder) = &state.embedder {
        data.push(ModelObject::new(embedder.name(), state.created()));
    }
    Json(ModelList {
        object: "list",
        data,
    })
}

/// `GET /v1/models/{model}`
pub async fn model_detail(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> ApiResult<Json<ModelObject>> {
    let known = model == state.model_name()
        || state
            .embedder
            .as_ref()
            .is_some_and(|embedder| embedder.name() == model);
    if !known {
        return Err(ApiError::NotFound(format!("Model '{}' not found", model)));
    }
    Ok(Json(ModelObject::new(model, state.created())))
}

fn details() -> Value {
    json!({
        "parent_model": "",
        "format": "gguf",
        "family": "",
        "families": [],
        "parameter_size": "",
        "quantization_level": "",
    })
}

/// `GET /api/tags`, the Ollama model listing
pub async fn api_tags(State(state): State<Arc<AppState>>) -> Json<Value> {
    let name = state.model_name();
    Json(json!({
        "models": [{
            "name": name,
            "model": name,
            "modified_at": "",
            "size": "",
            "digest": "",
            "type": "model",
            "capabilities": ["completion"],
            "details": details(),
        }],
        "object": "list",
        "data": [{
            "id": name,
            "object": "model",
            "created": state.created(),
            "owned_by": "avllm",
            "meta": { "n_ctx_train": state.engine.n_ctx_train() },
        }],
    }))
}

/// `POST /api/show`
pub async fn api_show(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "template": state.engine.template().name(),
        "model_info": { "llama.context_length": state.engine.n_ctx_train() },
        "modelfile": "",
        "parameters": "",
        "details": details(),
        "capabilities": ["completion"],
    }))
}

/// `GET /props`
pub async fn props(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "total_slots": state.config.n_parallel(),
        "model_path": state.config.model_path,
        "bos_token": state.engine.bos_text(),
        "eos_token": state.engine.eos_text(),
    }))
}

/// `POST /model/oai_to_text`: the prompt the chat template makes of `messages`
pub async fn oai_to_text(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<String> {
    let request: MessagesOnly = parse_body(&body)?;
    let messages = to_chat_messages(request.messages.as_deref())?;
    Ok(state.engine.template().apply(&messages, true)?)
}
