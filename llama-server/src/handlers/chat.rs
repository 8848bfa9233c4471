use super::requested_session;
use crate::error::{ApiError, ApiResult};
use crate::openai::{parse_body, ChatCompletion, ChatCompletionRequest, ChunkBuilder, ChunkKind};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use llama_chat::{
    ChatError, ChatMessage, FinishReason, GenerationOutcome, GenerationRequest, InferenceEngine,
    SessionState,
};
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Messages of `incoming` the session has not seen yet
///
/// Clients resend the whole conversation each time. When the session's
/// transcript is a strict prefix only the tail is new; any other history means
/// the client started over and the session is reset.
fn reconcile(session: &mut SessionState, incoming: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let known = session.messages().len();
    if known < incoming.len() && session.messages() == &incoming[..known] {
        return incoming[known..].to_vec();
    }
    if known > 0 {
        info!(
            "Session {} history diverged from the request, starting over",
            session.id()
        );
        session.reset();
    }
    incoming
}

/// One chat turn on a locked session
///
/// A failed turn is rolled back so the session still matches its KV cache.
fn chat_turn(
    session: &mut SessionState,
    engine: &dyn InferenceEngine,
    request: GenerationRequest,
    cancel: &CancellationToken,
    sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<GenerationOutcome, ChatError> {
    let result = run_turn(session, engine, request, cancel, sink);
    if let Err(e) = &result {
        debug!("Session {} turn failed: {}", session.id(), e);
        session.rollback();
    }
    result
}

fn run_turn(
    session: &mut SessionState,
    engine: &dyn InferenceEngine,
    request: GenerationRequest,
    cancel: &CancellationToken,
    sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<GenerationOutcome, ChatError> {
    for message in reconcile(session, request.messages) {
        session.append(message.role, message.content)?;
    }
    let delta = session.render(engine.template())?;
    let outcome = session.generate(
        engine,
        &delta,
        &request.sampling,
        request.max_tokens,
        &mut |piece| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            sink(piece)
        },
    )?;

    if outcome.finish_reason == FinishReason::ContextExceeded && outcome.tokens_generated == 0 {
        return Err(session.context_exceeded(outcome.prompt_tokens));
    }
    if !session.is_exhausted() {
        session.record_reply(engine.template(), &outcome.text)?;
    }
    Ok(outcome)
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let request: ChatCompletionRequest = parse_body(&body)?;
    let generation = request.to_generation(state.config.n_predict, state.config.repeat_penalty)?;
    let session_id = requested_session(&headers, request.session_id.as_deref())?;
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.model_name().to_string());

    let shared = match session_id {
        Some(id) => state.sessions.get_or_create(id).await?,
        None => Arc::new(Mutex::new(state.sessions.ephemeral())),
    };
    // Held until the job finishes, so requests on one session run in order.
    let mut session = shared.lock_owned().await;
    debug!(
        "Chat request on session {} with {} messages (stream: {})",
        session.id(),
        generation.messages.len(),
        generation.stream
    );

    let engine = state.engine.clone();
    if !generation.stream {
        let outcome = state
            .run(session_id, move |cancel| {
                chat_turn(&mut session, engine.as_ref(), generation, cancel, &mut |_| {
                    ControlFlow::Continue(())
                })
            })
            .await?;
        return Ok(Json(ChatCompletion::new(model, &outcome)).into_response());
    }

    let chunks = ChunkBuilder::new(ChunkKind::Chat, model);
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    let _ = tx.send(Ok(chunks.role())).await;

    let job_tx = tx.clone();
    let job_chunks = chunks.clone();
    let handle = state
        .queue
        .submit(session_id, move |cancel| {
            chat_turn(&mut session, engine.as_ref(), generation, cancel, &mut |piece| {
                // A closed channel means the client went away.
                match job_tx.blocking_send(Ok(job_chunks.content(piece))) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            })
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

#[cfg(test)]
mod tests {
    use super::*;
    use llama_chat::{ContextConfig, MessageRole, ScriptedEngine, SessionId};

    fn session() -> SessionState {
        SessionState::new(SessionId::new(), ContextConfig::default())
    }

    #[test]
    fn test_reconcile_appends_only_the_tail() {
        let mut state = session();
        state.append(MessageRole::System, "s").unwrap();
        state.append(MessageRole::User, "u").unwrap();
        let incoming = vec![
            ChatMessage::system("s"),
            ChatMessage::user("u"),
            ChatMessage::assistant("a"),
            ChatMessage::user("v"),
        ];
        let new = reconcile(&mut state, incoming);
        assert_eq!(new, vec![ChatMessage::assistant("a"), ChatMessage::user("v")]);
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn test_reconcile_resets_on_divergence() {
        let mut state = session();
        state.append(MessageRole::User, "old").unwrap();
        let incoming = vec![ChatMessage::user("new")];
        let new = reconcile(&mut state, incoming.clone());
        assert_eq!(new, incoming);
        assert!(state.messages().is_empty());
    }

    #[test]
    fn test_reconcile_resets_on_identical_history() {
        let mut state = session();
        state.append(MessageRole::User, "same").unwrap();
        let new = reconcile(&mut state, vec![ChatMessage::user("same")]);
        assert_eq!(new.len(), 1);
        assert!(state.messages().is_empty());
    }

    #[test]
    fn test_failed_turn_rolls_back_the_session() {
        let engine = ScriptedEngine::builder().reply("Hello").reply("Fine").build();
        let cancel = CancellationToken::new();
        let mut state = session();
        let first = vec![ChatMessage::user("Hi")];
        chat_turn(&mut state, &engine, GenerationRequest::new(first), &cancel, &mut |_| {
            ControlFlow::Continue(())
        })
        .unwrap();

        let history = vec![
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello"),
            ChatMessage::user("Again"),
        ];
        engine.fail_decode_after(0);
        let failed = chat_turn(
            &mut state,
            &engine,
            GenerationRequest::new(history.clone()),
            &cancel,
            &mut |_| ControlFlow::Continue(()),
        );
        assert!(matches!(failed, Err(ChatError::DecodeFailure(_))));
        assert_eq!(state.messages(), &history[..2]);
        assert_eq!(state.used_cells(), 0);
        assert_eq!(state.sent_offset(), 0);

        let retried = chat_turn(
            &mut state,
            &engine,
            GenerationRequest::new(history),
            &cancel,
            &mut |_| ControlFlow::Continue(()),
        )
        .unwrap();
        assert_eq!(retried.text, "Fine");
        assert_eq!(state.messages().len(), 4);
    }
}
