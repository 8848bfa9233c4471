//! The seam between chat logic and the inference library.
//!
//! [`InferenceEngine`] owns the model (vocabulary, template, special tokens)
//! and hands out [`InferenceContext`]s, each an independent KV cache with its
//! own sampler. Sessions, completions and FIM only ever talk to these traits.

mod llama;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use llama::{LlamaEngine, NativeTemplate};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{DecodeLog, ScriptedEngine, ScriptedEngineBuilder};

use crate::error::ChatError;
use crate::template::ChatTemplate;
use crate::types::SamplingParams;
use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};

/// Vocabulary id as used by llama.cpp
pub type Token = i32;

/// Special tokens delimiting a fill-in-middle prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FimTokens {
    pub prefix: Token,
    pub suffix: Token,
    pub middle: Token,
    /// File separator for repository-level context, when the model has one
    pub separator: Option<Token>,
}

/// Size of an inference context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Largest batch submitted to a single decode call
    pub n_batch: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: 1024,
            n_batch: 4096,
        }
    }
}

impl ValidatedConfig for ContextConfig {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        ensure_range("n_ctx", self.n_ctx, 16, 1_048_576)?;
        ensure_range("n_batch", self.n_batch, 1, 1_048_576)?;
        Ok(())
    }

    fn description() -> &'static str {
        "Inference context settings"
    }
}

/// A loaded model
pub trait InferenceEngine: Send + Sync {
    /// Identifier reported to API clients, normally the model file name
    fn name(&self) -> &str;

    fn new_context(&self, config: &ContextConfig) -> Result<Box<dyn InferenceContext>, ChatError>;

    /// Tokenize `text`; `add_special` adds BOS when the vocabulary wants it.
    /// Special-token spellings inside `text` are always parsed.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, ChatError>;

    /// Raw bytes of one token, possibly a partial UTF-8 sequence
    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, ChatError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    fn template(&self) -> &dyn ChatTemplate;

    /// FIM tokens, or [`ChatError::MissingCapability`] naming the first missing one
    fn fim_tokens(&self) -> Result<FimTokens, ChatError>;

    /// BOS token when the vocabulary prepends one to new sequences
    fn bos_token(&self) -> Option<Token>;

    fn bos_text(&self) -> String;

    fn eos_text(&self) -> String;

    /// Context length the model was trained with
    fn n_ctx_train(&self) -> u32;
}

/// One KV cache plus sampler state, owned by a single session or request
pub trait InferenceContext: Send {
    /// Total cells in the context window
    fn capacity(&self) -> usize;

    /// Cells already holding decoded tokens
    fn used_cells(&self) -> usize;

    /// Largest slice accepted by one [`InferenceContext::decode`] call
    fn max_batch(&self) -> usize;

    /// Append `tokens` to the cache; logits are kept for the last one only
    fn decode(&mut self, tokens: &[Token]) -> Result<(), ChatError>;

    /// Install a fresh sampler for the next generation
    fn begin_sampling(&mut self, params: &SamplingParams);

    /// Sample from the logits of the last decoded token
    fn sample_next(&mut self) -> Result<Token, ChatError>;

    /// Forget every decoded token
    fn clear(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_config_validation() {
        assert!(ContextConfig::default().validate().is_ok());
        let tiny = ContextConfig {
            n_ctx: 4,
            n_batch: 4,
        };
        assert!(tiny.validate().is_err());
        let no_batch = ContextConfig {
            n_ctx: 1024,
            n_batch: 0,
        };
        assert!(no_batch.validate().is_err());
    }
}
