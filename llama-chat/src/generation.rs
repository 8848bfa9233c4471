//! The token loop shared by chat sessions, completions and fill-in-middle.

use crate::engine::{InferenceContext, InferenceEngine, Token};
use crate::error::ChatError;
use crate::types::{FinishReason, GenerationOutcome, SamplingParams};
use std::ops::ControlFlow;
use tracing::{debug, trace};

/// Per-token callback; `ControlFlow::Break` stops generation after this token
pub type TokenCallback<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

/// Joins token byte pieces into whole UTF-8 characters
///
/// Byte-level vocabularies split multi-byte characters across tokens; a piece
/// is only released once it forms valid UTF-8. Bytes that can never become
/// valid are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes` and return whatever complete text is now available
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush anything left over at the end of generation
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Decode `tokens` in slices no larger than the context's batch limit
pub fn decode_chunked(ctx: &mut dyn InferenceContext, tokens: &[Token]) -> Result<(), ChatError> {
    let batch = ctx.max_batch().max(1);
    for chunk in tokens.chunks(batch) {
        ctx.decode(chunk)?;
    }
    Ok(())
}

fn would_overflow(ctx: &dyn InferenceContext, batch_len: usize) -> bool {
    ctx.used_cells() + batch_len > ctx.capacity()
}

/// Decode `prompt` and sample until EOG, `max_tokens`, a callback stop or a
/// full context
///
/// Running out of context is reported as [`FinishReason::ContextExceeded`];
/// an outcome with zero generated tokens and that reason means the prompt
/// itself did not fit and nothing was decoded.
pub fn run_generation(
    engine: &dyn InferenceEngine,
    ctx: &mut dyn InferenceContext,
    prompt: &[Token],
    sampling: &SamplingParams,
    max_tokens: usize,
    on_token: &mut TokenCallback<'_>,
) -> Result<GenerationOutcome, ChatError> {
    if prompt.is_empty() {
        return Err(ChatError::invalid_request("Prompt is empty"));
    }

    let mut outcome = GenerationOutcome {
        text: String::new(),
        prompt_tokens: prompt.len(),
        tokens_generated: 0,
        finish_reason: FinishReason::EndOfGeneration,
    };

    if would_overflow(ctx, prompt.len()) {
        debug!(
            "Prompt of {} tokens does not fit: {} of {} cells used",
            prompt.len(),
            ctx.used_cells(),
            ctx.capacity()
        );
        outcome.finish_reason = FinishReason::ContextExceeded;
        return Ok(outcome);
    }

    decode_chunked(ctx, prompt)?;
    ctx.begin_sampling(sampling);
    debug!(
        "Prompt decoded ({} tokens, {} cells used), sampling",
        prompt.len(),
        ctx.used_cells()
    );

    let mut utf8 = Utf8Accumulator::new();
    loop {
        if outcome.tokens_generated >= max_tokens {
            outcome.finish_reason = FinishReason::MaxTokens;
            break;
        }

        let token = ctx.sample_next()?;
        if engine.is_end_of_generation(token) {
            trace!("End of generation token {}", token);
            outcome.finish_reason = FinishReason::EndOfGeneration;
            break;
        }
        outcome.tokens_generated += 1;

        let piece = utf8.push(&engine.token_bytes(token)?);
        let flow = if piece.is_empty() {
            ControlFlow::Continue(())
        } else {
            outcome.text.push_str(&piece);
            on_token(&piece)
        };

        if would_overflow(ctx, 1) {
            debug!("Context full after {} tokens", outcome.tokens_generated);
            outcome.finish_reason = FinishReason::ContextExceeded;
            break;
        }
        // Decoded even when stopping so the cache matches the returned text.
        ctx.decode(&[token])?;

        if flow.is_break() {
            outcome.finish_reason = FinishReason::Stopped;
            break;
        }
    }

    let rest = utf8.finish();
    if !rest.is_empty() {
        outcome.text.push_str(&rest);
        let _ = on_token(&rest);
    }

    debug!(
        "Generation finished: {} tokens, reason {:?}",
        outcome.tokens_generated, outcome.finish_reason
    );
    Ok(outcome)
}
