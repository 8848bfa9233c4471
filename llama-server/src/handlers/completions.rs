use crate::error::{ApiError, ApiResult};
use crate::openai::{
    parse_body, response_object, to_chat_messages, ChunkBuilder, ChunkKind, CompletionRequest,
    ResponsesInput, ResponsesRequest, SamplingFields, TextCompletion,
};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use llama_chat::{
    run_generation, ChatError, FinishReason, GenerationOutcome, InferenceContext, InferenceEngine,
    SamplingParams, Token,
};
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Generate from raw prompt tokens, treating a prompt that does not fit as an error
fn generate_raw(
    engine: &dyn InferenceEngine,
    ctx: &mut dyn InferenceContext,
    prompt: &[Token],
    sampling: &SamplingParams,
    max_tokens: usize,
    on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<GenerationOutcome, ChatError> {
    let outcome = run_generation(engine, ctx, prompt, sampling, max_tokens, on_token)?;
    if outcome.finish_reason == FinishReason::ContextExceeded && outcome.tokens_generated == 0 {
        return Err(ChatError::ContextExceeded {
            used: ctx.used_cells(),
            requested: prompt.len(),
            capacity: ctx.capacity(),
        });
    }
    Ok(outcome)
}

/// `POST /v1/completions`
pub async fn completions(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Response> {
    let request: CompletionRequest = parse_body(&body)?;
    let prompt = request
        .prompt
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("\"prompt\" is required"))?;
    let max_tokens = request.max_tokens.unwrap_or(state.config.n_predict);
    let sampling = request.sampling.to_params(state.config.repeat_penalty)?;
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.model_name().to_string());

    let tokens = state.engine.tokenize(prompt, true)?;
    if tokens.len() >= max_tokens {
        return Err(ApiError::bad_request(format!(
            "Prompt has {} tokens, which is not less than max_tokens ({})",
            tokens.len(),
            max_tokens
        )));
    }
    debug!("Completion of {} prompt tokens", tokens.len());

    let engine = state.engine.clone();
    let context_config = state.config.context.clone();

    if !request.stream.unwrap_or(false) {
        let outcome = state
            .run(None, move |cancel| {
                let mut ctx = engine.new_context(&context_config)?;
                generate_raw(
                    engine.as_ref(),
                    ctx.as_mut(),
                    &tokens,
                    &sampling,
                    max_tokens,
                    &mut |_| {
                        if cancel.is_cancelled() {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    },
                )
            })
            .await?;
        return Ok(Json(TextCompletion::new(model, &outcome)).into_response());
    }

    let chunks = ChunkBuilder::new(ChunkKind::Text, model);
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    let job_tx = tx.clone();
    let job_chunks = chunks.clone();
    let handle = state
        .queue
        .submit(None, move |_| {
            let mut ctx = engine.new_context(&context_config)?;
            generate_raw(
                engine.as_ref(),
                ctx.as_mut(),
                &tokens,
                &sampling,
                max_tokens,
                &mut |piece| match job_tx.blocking_send(Ok(job_chunks.content(piece))) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                },
            )
        })
        .await?;

    tokio::spawn(async move {
        let result = match handle.wait().await {
            Ok(result) => result.map_err(ApiError::from),
            Err(e) => Err(ApiError::from(e)),
        };
        match result {
            Ok(outcome) => {
                let _ = tx.send(Ok(chunks.finish(&outcome))).await;
                let _ = tx.send(Ok(ChunkBuilder::done())).await;
            }
            Err(e) => {
                let _ = tx.send(Ok(ChunkBuilder::error(&e))).await;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// `POST /v1/responses`
///
/// Input continues one server-wide context; `instructions: "restart"` clears
/// it first.
pub async fn responses(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<serde_json::Value>> {
    let request: ResponsesRequest = parse_body(&body)?;
    let text = match &request.input {
        Some(ResponsesInput::Text(text)) if !text.is_empty() => text.clone(),
        Some(ResponsesInput::Messages(messages)) => {
            let messages = to_chat_messages(Some(messages.as_slice()))?;
            state.engine.template().apply(&messages, true)?
        }
        _ => return Err(ApiError::bad_request("Input is required")),
    };
    let restart = request.restarts();
    let max_tokens = request.max_output_tokens.unwrap_or(state.config.n_predict);
    let sampling = SamplingFields::default().to_params(state.config.repeat_penalty)?;
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.model_name().to_string());

    let engine = state.engine.clone();
    let context_config = state.config.context.clone();
    let mut shared = state.responses.clone().lock_owned().await;

    let outcome = state
        .run(None, move |cancel| {
            if restart {
                if let Some(ctx) = shared.as_deref_mut() {
                    info!("Restarting the responses context");
                    ctx.clear();
                }
            }
            if shared.is_none() {
                *shared = Some(engine.new_context(&context_config)?);
            }
            let ctx = shared
                .as_deref_mut()
                .ok_or_else(|| ChatError::context_init("responses context missing"))?;
            let tokens = engine.tokenize(&text, ctx.used_cells() == 0)?;
            generate_raw(
                engine.as_ref(),
                ctx,
                &tokens,
                &sampling,
                max_tokens,
                &mut |_| {
                    if cancel.is_cancelled() {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            )
        })
        .await?;

    Ok(Json(response_object(&model, &outcome)))
}
