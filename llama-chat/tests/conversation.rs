//! Multi-turn conversations driven through the session store and request queue

use llama_chat::engine::scripted::EOS;
use llama_chat::{
    ContextConfig, FinishReason, InferenceEngine, MessageRole, QueueConfig, RequestQueue,
    SamplingParams, ScriptedEngine, SessionConfig, SessionId, SessionPhase, SessionStore,
};
use std::ops::ControlFlow;
use std::sync::Arc;

fn store() -> SessionStore {
    SessionStore::new(SessionConfig::default(), ContextConfig::default())
}

#[tokio::test]
async fn test_two_turns_through_the_queue() {
    let engine: Arc<dyn InferenceEngine> = Arc::new(
        ScriptedEngine::builder()
            .reply("Hi there.")
            .reply("Still here.")
            .build(),
    );

    let store = store();
    let queue = RequestQueue::new(QueueConfig::default());
    let id = SessionId::new();

    let mut replies = Vec::new();
    for (i, text) in ["hello", "are you there?"].into_iter().enumerate() {
        let session = store.get_or_create(id).await.unwrap();
        let mut guard = session.lock_owned().await;
        if i == 0 {
            guard.append(MessageRole::System, "Be brief.").unwrap();
        }
        let engine = engine.clone();
        let text = text.to_string();
        let handle = queue
            .submit(Some(id), move |_| {
                let mut streamed = String::new();
                let outcome = guard.turn(
                    engine.as_ref(),
                    MessageRole::User,
                    &text,
                    &SamplingParams::default(),
                    64,
                    &mut |piece| {
                        streamed.push_str(piece);
                        ControlFlow::Continue(())
                    },
                );
                (outcome, streamed)
            })
            .await
            .unwrap();
        let (outcome, streamed) = handle.wait().await.unwrap();
        let outcome = outcome.unwrap();
        assert_eq!(outcome.text, streamed);
        assert_eq!(outcome.finish_reason, FinishReason::EndOfGeneration);
        replies.push(outcome);
    }

    assert_eq!(replies[0].text, "Hi there.");
    assert_eq!(replies[1].text, "Still here.");
    // The second prompt only carries the new user turn.
    assert!(replies[1].prompt_tokens < replies[0].prompt_tokens);

    let session = store.get(&id).await.unwrap();
    let state = session.lock().await;
    assert_eq!(state.messages().len(), 5);
    assert_eq!(state.phase(), SessionPhase::Idle);
    assert!(state.sent_offset() <= state.rendered().len());
    assert!(state.rendered().ends_with("Still here.<|im_end|>\n"));

    queue.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_session_reports_length_then_rejects() {
    let engine = ScriptedEngine::builder().reply("abcdefghij").endless().build();
    let store = SessionStore::new(
        SessionConfig::default(),
        ContextConfig {
            n_ctx: 40,
            n_batch: 64,
        },
    );
    let id = SessionId::new();
    let session = store.get_or_create(id).await.unwrap();
    let mut state = session.lock().await;

    let outcome = state
        .turn(
            &engine,
            MessageRole::User,
            "hi",
            &SamplingParams::default(),
            1000,
            &mut |_| ControlFlow::Continue(()),
        )
        .unwrap();
    assert_eq!(outcome.finish_reason, FinishReason::ContextExceeded);
    assert_eq!(outcome.finish_reason.as_openai(), "length");
    assert!(outcome.tokens_generated > 0);
    assert!(state.is_exhausted());

    assert!(state.append(MessageRole::User, "more").is_err());
    state.reset();
    assert_eq!(state.phase(), SessionPhase::Idle);
    assert!(state.messages().is_empty());
}

#[test]
fn test_end_of_generation_token_is_not_text() {
    let engine = ScriptedEngine::replying("x");
    assert!(engine.is_end_of_generation(EOS));
    assert!(!engine.is_end_of_generation(256 + b'x' as i32));
}
