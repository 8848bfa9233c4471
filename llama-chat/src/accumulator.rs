//! Session prompt accumulator.
//!
//! A session keeps the full transcript, the last rendered prompt, and a byte
//! offset marking how much of that prompt is already in the session's KV
//! cache. Each turn renders the transcript again and only the new suffix is
//! tokenized and decoded, so a long conversation never re-processes its
//! history.
//!
//! ```text
//! append ──▶ PendingRender ──render──▶ PendingGenerate ──generate──▶ Idle
//!                                                          │
//!                                                          └──▶ ContextExceeded (terminal)
//! ```

use crate::engine::{ContextConfig, InferenceContext, InferenceEngine};
use crate::error::ChatError;
use crate::generation::{run_generation, TokenCallback};
use crate::template::ChatTemplate;
use crate::types::{ChatMessage, FinishReason, GenerationOutcome, MessageRole, SamplingParams, SessionId};
use tracing::{debug, warn};

/// Where a session is in its turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// Messages appended since the last render
    PendingRender,
    /// A rendered delta is waiting to be decoded
    PendingGenerate,
    /// The context window is full; only [`SessionState::reset`] recovers
    ContextExceeded,
}

/// Newly rendered prompt text not yet sent to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDelta {
    pub text: String,
    /// Byte range of `text` within the full rendered prompt
    pub start: usize,
    pub end: usize,
}

impl RenderedDelta {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// One conversation and the KV cache that mirrors it
pub struct SessionState {
    id: SessionId,
    messages: Vec<ChatMessage>,
    rendered: String,
    sent_offset: usize,
    context: Option<Box<dyn InferenceContext>>,
    context_config: ContextConfig,
    phase: SessionPhase,
    /// Messages and rendered bytes as of the last completed turn
    committed_messages: usize,
    committed_rendered: usize,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("messages", &self.messages.len())
            .field("rendered", &self.rendered.len())
            .field("sent_offset", &self.sent_offset)
            .field("has_context", &self.context.is_some())
            .field("phase", &self.phase)
            .finish()
    }
}

impl SessionState {
    pub fn new(id: SessionId, context_config: ContextConfig) -> Self {
        Self {
            id,
            messages: Vec::new(),
            rendered: String::new(),
            sent_offset: 0,
            context: None,
            context_config,
            phase: SessionPhase::Idle,
            committed_messages: 0,
            committed_rendered: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub fn sent_offset(&self) -> usize {
        self.sent_offset
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase == SessionPhase::ContextExceeded
    }

    /// Cells of the session's KV cache in use; zero before the first turn
    pub fn used_cells(&self) -> usize {
        self.context.as_ref().map_or(0, |ctx| ctx.used_cells())
    }

    /// The error reported when this session cannot take `requested` more tokens
    pub fn context_exceeded(&self, requested: usize) -> ChatError {
        ChatError::ContextExceeded {
            used: self.used_cells(),
            requested,
            capacity: self
                .context
                .as_ref()
                .map_or(self.context_config.n_ctx as usize, |ctx| ctx.capacity()),
        }
    }

    /// Add a message to the transcript
    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> Result<(), ChatError> {
        if self.is_exhausted() {
            return Err(self.context_exceeded(0));
        }
        let content = content.into();
        if content.is_empty() {
            return Err(ChatError::invalid_request("Message content cannot be empty"));
        }
        self.messages.push(ChatMessage::new(role, content));
        self.phase = SessionPhase::PendingRender;
        Ok(())
    }

    fn render_extension(
        &self,
        template: &dyn ChatTemplate,
        add_generation_prompt: bool,
    ) -> Result<String, ChatError> {
        let rendered = template.apply(&self.messages, add_generation_prompt)?;
        if !rendered.starts_with(self.rendered.as_str()) {
            return Err(ChatError::TemplateRenderFailure(format!(
                "rendered prompt no longer extends the previous one ({} -> {} bytes)",
                self.rendered.len(),
                rendered.len()
            )));
        }
        Ok(rendered)
    }

    /// Render the transcript and return the part not yet sent
    ///
    /// Fails with [`ChatError::TemplateRenderFailure`], leaving the session
    /// untouched, when the new render does not extend the previous one.
    pub fn render(&mut self, template: &dyn ChatTemplate) -> Result<RenderedDelta, ChatError> {
        if self.is_exhausted() {
            return Err(self.context_exceeded(0));
        }
        let rendered = self.render_extension(template, true)?;
        let start = self.sent_offset;
        let end = rendered.len();
        let delta = RenderedDelta {
            text: rendered[start..end].to_string(),
            start,
            end,
        };
        self.rendered = rendered;
        self.sent_offset = end;
        self.phase = SessionPhase::PendingGenerate;
        debug!(
            "Session {} rendered {} new bytes ({}..{})",
            self.id,
            delta.text.len(),
            start,
            end
        );
        Ok(delta)
    }

    /// Decode `delta` and generate a reply, streaming pieces to `on_token`
    ///
    /// The context is created on first use. Running out of context is not an
    /// error: the outcome carries [`FinishReason::ContextExceeded`] with the
    /// text produced so far, and the session becomes terminal.
    pub fn generate(
        &mut self,
        engine: &dyn InferenceEngine,
        delta: &RenderedDelta,
        sampling: &SamplingParams,
        max_tokens: usize,
        on_token: &mut TokenCallback<'_>,
    ) -> Result<GenerationOutcome, ChatError> {
        if self.is_exhausted() {
            return Err(self.context_exceeded(0));
        }
        if self.context.is_none() {
            self.context = Some(engine.new_context(&self.context_config)?);
        }
        let ctx = self
            .context
            .as_deref_mut()
            .ok_or_else(|| ChatError::context_init("context missing"))?;

        let add_special = ctx.used_cells() == 0;
        let result = engine
            .tokenize(&delta.text, add_special)
            .and_then(|tokens| run_generation(engine, ctx, &tokens, sampling, max_tokens, on_token));
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Session {} turn failed, rolling back: {}", self.id, e);
                self.rollback();
                return Err(e);
            }
        };

        self.phase = if outcome.finish_reason == FinishReason::ContextExceeded {
            warn!(
                "Session {} ran out of context after {} tokens",
                self.id, outcome.tokens_generated
            );
            SessionPhase::ContextExceeded
        } else {
            SessionPhase::Idle
        };
        Ok(outcome)
    }

    /// Append the assistant's reply and move `sent_offset` past it
    ///
    /// The reply tokens are already in the KV cache, so the next delta must
    /// start right after them; whatever the template puts after the reply
    /// (its end-of-turn marker) stays unsent. An empty reply is recorded too.
    /// Templates that trim the reply are matched on the trimmed text.
    pub fn record_reply(&mut self, template: &dyn ChatTemplate, reply: &str) -> Result<(), ChatError> {
        let before = self.rendered.len();
        self.messages.push(ChatMessage::assistant(reply));
        let located = self.render_extension(template, false).and_then(|rendered| {
            let end = reply_end(&rendered[before..], reply).ok_or_else(|| {
                ChatError::TemplateRenderFailure(
                    "assistant reply not found in the rendered prompt".to_string(),
                )
            })?;
            Ok((rendered, before + end))
        });
        let (rendered, sent_offset) = match located {
            Ok(located) => located,
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        };
        self.sent_offset = sent_offset;
        self.rendered = rendered;
        self.committed_messages = self.messages.len();
        self.committed_rendered = self.rendered.len();
        Ok(())
    }

    /// Undo a turn that did not complete
    ///
    /// Messages appended since the last recorded reply are dropped. If any of
    /// the turn's prompt may have reached the KV cache, the cache is cleared
    /// and the next render sends the whole transcript again.
    pub fn rollback(&mut self) {
        if self.is_exhausted() {
            return;
        }
        self.messages.truncate(self.committed_messages);
        self.rendered.truncate(self.committed_rendered);
        if self.sent_offset > self.committed_rendered {
            if let Some(ctx) = self.context.as_deref_mut() {
                ctx.clear();
            }
            self.sent_offset = 0;
        }
        self.phase = SessionPhase::Idle;
        debug!(
            "Session {} rolled back to {} messages",
            self.id,
            self.messages.len()
        );
    }

    /// One full turn: append, render, generate and record the reply
    pub fn turn(
        &mut self,
        engine: &dyn InferenceEngine,
        role: MessageRole,
        content: &str,
        sampling: &SamplingParams,
        max_tokens: usize,
        on_token: &mut TokenCallback<'_>,
    ) -> Result<GenerationOutcome, ChatError> {
        let result = self.append(role, content).and_then(|()| {
            let delta = self.render(engine.template())?;
            let outcome = self.generate(engine, &delta, sampling, max_tokens, on_token)?;
            if !self.is_exhausted() {
                self.record_reply(engine.template(), &outcome.text)?;
            }
            Ok(outcome)
        });
        if result.is_err() {
            self.rollback();
        }
        result
    }

    /// Drop the transcript and the KV cache, keeping the id
    pub fn reset(&mut self) {
        self.messages.clear();
        self.rendered.clear();
        self.sent_offset = 0;
        self.committed_messages = 0;
        self.committed_rendered = 0;
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.clear();
        }
        self.phase = SessionPhase::Idle;
        debug!("Session {} reset", self.id);
    }
}

/// Byte offset just past `reply` at the start of `tail`
fn reply_end(tail: &str, reply: &str) -> Option<usize> {
    if tail.starts_with(reply) {
        return Some(reply.len());
    }
    let trimmed = reply.trim();
    tail.find(trimmed).map(|start| start + trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::template::ChatmlTemplate;
    use proptest::prelude::*;
    use std::ops::ControlFlow;

    fn session(n_ctx: u32) -> SessionState {
        SessionState::new(
            SessionId::new(),
            ContextConfig {
                n_ctx,
                n_batch: 512,
            },
        )
    }

    fn collect(pieces: &mut Vec<String>) -> impl FnMut(&str) -> ControlFlow<()> + '_ {
        move |piece| {
            pieces.push(piece.to_string());
            ControlFlow::Continue(())
        }
    }

    #[test]
    fn test_system_and_user_render() {
        let mut state = session(1024);
        state.append(MessageRole::System, "You are helpful.").unwrap();
        state.append(MessageRole::User, "Hi").unwrap();
        assert_eq!(state.phase(), SessionPhase::PendingRender);

        let delta = state.render(&ChatmlTemplate).unwrap();
        let expected = ChatmlTemplate
            .apply(state.messages(), true)
            .unwrap();
        assert_eq!(delta.text, expected);
        assert_eq!(delta.start, 0);
        assert_eq!(state.sent_offset(), expected.len());
        assert_eq!(state.phase(), SessionPhase::PendingGenerate);
    }

    #[test]
    fn test_empty_content_rejected() {
        let mut state = session(1024);
        assert!(matches!(
            state.append(MessageRole::User, ""),
            Err(ChatError::InvalidRequest(_))
        ));
        assert!(state.messages().is_empty());
    }

    #[test]
    fn test_duplicate_roles_accepted() {
        let mut state = session(1024);
        state.append(MessageRole::User, "a").unwrap();
        state.append(MessageRole::User, "b").unwrap();
        state.append(MessageRole::Assistant, "c").unwrap();
        assert_eq!(state.messages().len(), 3);
    }

    struct ShrinkingTemplate;

    impl ChatTemplate for ShrinkingTemplate {
        fn apply(&self, messages: &[ChatMessage], _: bool) -> Result<String, ChatError> {
            // Only ever shows the latest message, so the render shrinks.
            Ok(messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }

        fn name(&self) -> &str {
            "shrinking"
        }
    }

    #[test]
    fn test_prefix_mismatch_leaves_state_untouched() {
        let mut state = session(1024);
        state.append(MessageRole::User, "a long first message").unwrap();
        state.render(&ShrinkingTemplate).unwrap();
        let offset = state.sent_offset();
        let rendered = state.rendered().to_string();

        state.append(MessageRole::User, "short").unwrap();
        let result = state.render(&ShrinkingTemplate);
        assert!(matches!(result, Err(ChatError::TemplateRenderFailure(_))));
        assert_eq!(state.sent_offset(), offset);
        assert_eq!(state.rendered(), rendered);
    }

    #[test]
    fn test_two_turns_decode_only_the_delta() {
        let engine = ScriptedEngine::builder().reply("Hello").reply("Fine").build();
        let log = engine.decode_log();
        let mut state = session(1024);
        let mut pieces = Vec::new();

        state.append(MessageRole::System, "sys").unwrap();
        let first = state
            .turn(
                &engine,
                MessageRole::User,
                "Hi",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(first.text, "Hello");
        assert_eq!(pieces.concat(), "Hello");

        let after_first = state.used_cells();
        let rendered_first = state.rendered().to_string();
        log.clear();
        pieces.clear();

        let second = state
            .turn(
                &engine,
                MessageRole::User,
                "How are you?",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(second.text, "Fine");
        assert_eq!(pieces.concat(), "Fine");

        // The second prompt batch holds exactly the text after the first reply.
        let full = ChatmlTemplate
            .apply(&state.messages()[..4], true)
            .unwrap();
        let delta_text = &full[rendered_first.len() - "<|im_end|>\n".len()..];
        assert!(delta_text.starts_with("<|im_end|>\n<|im_start|>user\nHow are you?"));
        let expected_tokens = engine.tokenize(delta_text, false).unwrap();
        assert_eq!(log.batches()[0], expected_tokens);
        assert_eq!(
            state.used_cells(),
            after_first + expected_tokens.len() + "Fine".len()
        );
    }

    #[test]
    fn test_context_exceeded_is_terminal() {
        let engine = ScriptedEngine::builder().reply("abcdefghij").endless().build();
        let mut state = session(48);
        let mut pieces = Vec::new();
        state.append(MessageRole::User, "Hi").unwrap();
        let delta = state.render(&ChatmlTemplate).unwrap();
        let prompt_len = engine.tokenize(&delta.text, true).unwrap().len();

        let outcome = state
            .generate(
                &engine,
                &delta,
                &SamplingParams::default(),
                1000,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::ContextExceeded);
        assert_eq!(outcome.tokens_generated, 48 - prompt_len + 1);
        assert_eq!(pieces.concat(), outcome.text);
        assert!(state.is_exhausted());

        assert!(matches!(
            state.append(MessageRole::User, "more"),
            Err(ChatError::ContextExceeded { .. })
        ));

        state.reset();
        assert!(!state.is_exhausted());
        assert_eq!(state.used_cells(), 0);
        state.append(MessageRole::User, "again").unwrap();
    }

    #[test]
    fn test_record_reply_keeps_offset_after_reply() {
        let mut state = session(1024);
        state.append(MessageRole::User, "Hi").unwrap();
        let delta = state.render(&ChatmlTemplate).unwrap();
        state.record_reply(&ChatmlTemplate, "Hello").unwrap();
        assert_eq!(state.sent_offset(), delta.end + "Hello".len());
        assert_eq!(&state.rendered()[state.sent_offset()..], "<|im_end|>\n");
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn test_empty_reply_keeps_session_usable() {
        let engine = ScriptedEngine::builder().reply("").reply("Fine").build();
        let mut state = session(1024);
        let mut pieces = Vec::new();

        let first = state
            .turn(
                &engine,
                MessageRole::User,
                "Hi",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(first.text, "");
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1], ChatMessage::assistant(""));
        assert_eq!(&state.rendered()[state.sent_offset()..], "<|im_end|>\n");

        let second = state
            .turn(
                &engine,
                MessageRole::User,
                "Still there?",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(second.text, "Fine");
        assert_eq!(state.messages().len(), 4);
    }

    struct TrimmingTemplate;

    impl ChatTemplate for TrimmingTemplate {
        fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String, ChatError> {
            let mut out = String::new();
            for m in messages {
                out.push_str(&format!("<|start|>{}\n{}<|eot|>", m.role, m.content.trim()));
            }
            if add_generation_prompt {
                out.push_str("<|start|>assistant\n");
            }
            Ok(out)
        }

        fn name(&self) -> &str {
            "trimming"
        }
    }

    #[test]
    fn test_trimmed_reply_leaves_end_of_turn_unsent() {
        let mut state = session(1024);
        state.append(MessageRole::User, "Hi").unwrap();
        state.render(&TrimmingTemplate).unwrap();
        let before = state.rendered().len();

        state.record_reply(&TrimmingTemplate, " Hello\n").unwrap();
        assert_eq!(state.sent_offset(), before + "Hello".len());
        assert_eq!(&state.rendered()[state.sent_offset()..], "<|eot|>");

        state.append(MessageRole::User, "More").unwrap();
        let delta = state.render(&TrimmingTemplate).unwrap();
        assert_eq!(delta.text, "<|eot|><|start|>user\nMore<|eot|><|start|>assistant\n");
    }

    #[test]
    fn test_failed_decode_rolls_back_the_turn() {
        let engine = ScriptedEngine::builder().reply("Hello").reply("Fine").build();
        let log = engine.decode_log();
        let mut state = session(1024);
        let mut pieces = Vec::new();

        state
            .turn(
                &engine,
                MessageRole::User,
                "Hi",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert!(state.used_cells() > 0);

        engine.fail_decode_after(0);
        let failed = state.turn(
            &engine,
            MessageRole::User,
            "Again",
            &SamplingParams::default(),
            64,
            &mut collect(&mut pieces),
        );
        assert!(matches!(failed, Err(ChatError::DecodeFailure(_))));
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.used_cells(), 0);
        assert_eq!(state.sent_offset(), 0);
        assert_eq!(state.phase(), SessionPhase::Idle);

        log.clear();
        let retried = state
            .turn(
                &engine,
                MessageRole::User,
                "Again",
                &SamplingParams::default(),
                64,
                &mut collect(&mut pieces),
            )
            .unwrap();
        assert_eq!(retried.text, "Fine");
        // The whole transcript goes to the cleared cache in one prompt batch.
        let prompt = ChatmlTemplate.apply(&state.messages()[..3], true).unwrap();
        assert_eq!(log.batches()[0], engine.tokenize(&prompt, true).unwrap());
    }

    proptest! {
        #[test]
        fn deltas_and_replies_concatenate_to_sent_prefix(
            turns in prop::collection::vec(("[a-z é]{1,12}", "[a-z é]{1,12}"), 1..6)
        ) {
            let mut state = session(1024);
            let mut sent = String::new();
            for (question, answer) in &turns {
                state.append(MessageRole::User, question.clone()).unwrap();
                let previous = state.rendered().to_string();
                let delta = state.render(&ChatmlTemplate).unwrap();
                prop_assert!(state.rendered().starts_with(&previous));
                sent.push_str(&delta.text);
                prop_assert_eq!(sent.as_str(), state.rendered());

                state.record_reply(&ChatmlTemplate, answer).unwrap();
                sent.push_str(answer);
                prop_assert!(state.sent_offset() <= state.rendered().len());
                prop_assert!(state.rendered().is_char_boundary(state.sent_offset()));
                prop_assert_eq!(sent.as_str(), &state.rendered()[..state.sent_offset()]);
            }
        }
    }
}
