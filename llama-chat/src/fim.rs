//! Fill-in-middle completion for code editors.

use crate::engine::{ContextConfig, FimTokens, InferenceEngine, Token};
use crate::error::ChatError;
use crate::generation::run_generation;
use crate::types::{FinishReason, GenerationOutcome, SamplingParams};
use serde_json::Value;
use std::ops::ControlFlow;
use tracing::debug;

/// Separator between extra context chunks for models without a file separator token
const CHUNK_SEPARATOR: &str = "\n\n--- snippet ---\n\n";
const DEFAULT_CHUNK_FILENAME: &str = "tmp";
const DEFAULT_N_PREDICT: usize = 128;

/// A snippet of surrounding code, e.g. another open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraChunk {
    pub text: String,
    pub filename: Option<String>,
}

/// Parsed body of a `/fim` or `/infill` request
#[derive(Debug, Clone, PartialEq)]
pub struct FimRequest {
    pub prompt: String,
    pub input_prefix: String,
    pub input_suffix: String,
    pub input_extra: Vec<ExtraChunk>,
    pub n_predict: usize,
    pub sampling: SamplingParams,
}

fn required_string(body: &Value, field: &str) -> Result<String, ChatError> {
    match body.get(field) {
        None => Err(ChatError::invalid_request(format!("\"{}\" is required", field))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ChatError::invalid_request(format!(
            "\"{}\" must be a string",
            field
        ))),
    }
}

impl FimRequest {
    pub fn new(input_prefix: impl Into<String>, input_suffix: impl Into<String>) -> Self {
        Self {
            prompt: String::new(),
            input_prefix: input_prefix.into(),
            input_suffix: input_suffix.into(),
            input_extra: Vec::new(),
            n_predict: DEFAULT_N_PREDICT,
            sampling: SamplingParams::fim_default(),
        }
    }

    /// Validate and parse a JSON request body
    pub fn from_json(body: &Value) -> Result<Self, ChatError> {
        if !body.is_object() {
            return Err(ChatError::invalid_request("Invalid JSON body"));
        }
        let prompt = match body.get("prompt") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ChatError::invalid_request("\"prompt\" must be a string")),
        };
        let input_prefix = required_string(body, "input_prefix")?;
        let input_suffix = required_string(body, "input_suffix")?;

        let mut input_extra = Vec::new();
        match body.get("input_extra") {
            None | Some(Value::Null) => {}
            Some(Value::Array(chunks)) => {
                for chunk in chunks {
                    let text = chunk.get("text").and_then(Value::as_str).ok_or_else(|| {
                        ChatError::invalid_request(
                            "extra_context chunk must contain a \"text\" field with a string value",
                        )
                    })?;
                    let filename = match chunk.get("filename") {
                        None => None,
                        Some(Value::String(s)) => Some(s.clone()),
                        Some(_) => {
                            return Err(ChatError::invalid_request(
                                "extra_context chunk's \"filename\" field must be a string",
                            ))
                        }
                    };
                    input_extra.push(ExtraChunk {
                        text: text.to_string(),
                        filename,
                    });
                }
            }
            Some(_) => {
                return Err(ChatError::invalid_request(
                    "\"input_extra\" must be an array of {\"filename\": string, \"text\": string}",
                ))
            }
        }

        let mut sampling = SamplingParams::fim_default();
        if let Some(top_k) = body.get("top_k").and_then(Value::as_i64) {
            sampling.top_k = top_k.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        }
        if let Some(top_p) = body.get("top_p").and_then(Value::as_f64) {
            sampling.top_p = top_p as f32;
        }
        if let Some(temperature) = body.get("temperature").and_then(Value::as_f64) {
            sampling.temperature = temperature as f32;
        }
        if let Some(seed) = body.get("seed").and_then(Value::as_u64) {
            sampling.seed = seed.min(u32::MAX as u64) as u32;
        }
        let n_predict = body
            .get("n_predict")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_N_PREDICT, |n| usize::try_from(n).unwrap_or(usize::MAX));

        Ok(Self {
            prompt,
            input_prefix,
            input_suffix,
            input_extra,
            n_predict,
            sampling,
        })
    }
}

fn extra_tokens(
    engine: &dyn InferenceEngine,
    fim: &FimTokens,
    chunks: &[ExtraChunk],
) -> Result<Vec<Token>, ChatError> {
    let mut tokens = Vec::new();
    for chunk in chunks {
        match fim.separator {
            Some(separator) => {
                let filename = chunk.filename.as_deref().unwrap_or(DEFAULT_CHUNK_FILENAME);
                tokens.push(separator);
                tokens.extend(engine.tokenize(&format!("{}\n", filename), false)?);
            }
            None => tokens.extend(engine.tokenize(CHUNK_SEPARATOR, false)?),
        }
        tokens.extend(engine.tokenize(&chunk.text, false)?);
    }
    Ok(tokens)
}

/// Lay out the FIM prompt
///
/// `[BOS] extra [PRE] prefix prompt [SUF] suffix [MID]`. The prefix keeps its
/// last `3/4 * n_batch` tokens, the suffix its first `n_batch/4 - 2 - prompt`
/// tokens, and extra context fills what is left of the window after reserving
/// `2 * n_predict` tokens for the answer.
pub fn format_infill(
    engine: &dyn InferenceEngine,
    request: &FimRequest,
    n_batch: usize,
    n_ctx: usize,
) -> Result<Vec<Token>, ChatError> {
    let fim = engine.fim_tokens()?;

    let prompt = engine.tokenize(&request.prompt, false)?;
    let prefix = engine.tokenize(&request.input_prefix, false)?;
    let suffix = engine.tokenize(&request.input_suffix, false)?;
    let extra = extra_tokens(engine, &fim, &request.input_extra)?;

    let prefix_take = prefix.len().min(3 * (n_batch / 4));
    let suffix_take = suffix
        .len()
        .min((n_batch / 4).saturating_sub(2 + prompt.len()));
    let extra_take = extra
        .len()
        .min(n_ctx.saturating_sub(n_batch + 2 * request.n_predict));
    debug!(
        "FIM layout: prefix {}/{}, suffix {}/{}, extra {}/{}",
        prefix_take,
        prefix.len(),
        suffix_take,
        suffix.len(),
        extra_take,
        extra.len()
    );

    let mut tokens = Vec::with_capacity(prefix_take + suffix_take + extra_take + prompt.len() + 4);
    if let Some(bos) = engine.bos_token() {
        tokens.push(bos);
    }
    tokens.extend_from_slice(&extra[extra.len() - extra_take..]);
    tokens.push(fim.prefix);
    tokens.extend_from_slice(&prefix[prefix.len() - prefix_take..]);
    tokens.extend_from_slice(&prompt);
    tokens.push(fim.suffix);
    tokens.extend_from_slice(&suffix[..suffix_take]);
    tokens.push(fim.middle);
    Ok(tokens)
}

/// Generate the text between `input_prefix` and `input_suffix` in a fresh context
///
/// An empty prefix yields an empty completion without touching the model.
pub fn infill(
    engine: &dyn InferenceEngine,
    context_config: &ContextConfig,
    request: &FimRequest,
) -> Result<GenerationOutcome, ChatError> {
    // Reported before the empty-prefix shortcut so a model without FIM support
    // fails the same way for every request.
    engine.fim_tokens()?;

    if request.input_prefix.is_empty() {
        debug!("input_prefix is empty");
        return Ok(GenerationOutcome {
            text: String::new(),
            prompt_tokens: 0,
            tokens_generated: 0,
            finish_reason: FinishReason::EndOfGeneration,
        });
    }

    let mut ctx = engine.new_context(context_config)?;
    let tokens = format_infill(
        engine,
        request,
        ctx.max_batch(),
        ctx.capacity(),
    )?;
    run_generation(
        engine,
        ctx.as_mut(),
        &tokens,
        &request.sampling,
        request.n_predict,
        &mut |_| ControlFlow::Continue(()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{BOS, FIM_MID, FIM_PRE, FIM_SEP, FIM_SUF};
    use crate::engine::ScriptedEngine;
    use rstest::rstest;
    use serde_json::json;

    fn bytes(text: &str) -> Vec<Token> {
        text.bytes().map(|b| 256 + b as Token).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let request = FimRequest::from_json(&json!({
            "input_prefix": "fn main() {",
            "input_suffix": "}"
        }))
        .unwrap();
        assert_eq!(request.n_predict, 128);
        assert_eq!(request.sampling, SamplingParams::fim_default());
        assert!(request.prompt.is_empty());
        assert!(request.input_extra.is_empty());
    }

    #[test]
    fn test_out_of_range_numbers_are_clamped() {
        let request = FimRequest::from_json(&json!({
            "input_prefix": "",
            "input_suffix": "",
            "top_k": 5_000_000_000i64,
            "seed": u64::MAX,
            "n_predict": u64::MAX
        }))
        .unwrap();
        assert_eq!(request.sampling.top_k, i32::MAX);
        assert_eq!(request.sampling.seed, u32::MAX);
        assert_eq!(request.n_predict, usize::try_from(u64::MAX).unwrap_or(usize::MAX));

        let negative = FimRequest::from_json(&json!({
            "input_prefix": "",
            "input_suffix": "",
            "top_k": -5_000_000_000i64
        }))
        .unwrap();
        assert_eq!(negative.sampling.top_k, i32::MIN);
    }

    #[rstest]
    #[case(json!({"input_suffix": ""}), "\"input_prefix\" is required")]
    #[case(json!({"input_prefix": ""}), "\"input_suffix\" is required")]
    #[case(json!({"input_prefix": "", "input_suffix": "", "prompt": 3}), "\"prompt\" must be a string")]
    #[case(
        json!({"input_prefix": "", "input_suffix": "", "input_extra": [{"filename": "a"}]}),
        "extra_context chunk must contain a \"text\" field with a string value"
    )]
    #[case(
        json!({"input_prefix": "", "input_suffix": "", "input_extra": [{"text": "x", "filename": 1}]}),
        "extra_context chunk's \"filename\" field must be a string"
    )]
    #[case(json!([1, 2]), "Invalid JSON body")]
    fn test_parse_errors(#[case] body: Value, #[case] message: &str) {
        match FimRequest::from_json(&body) {
            Err(ChatError::InvalidRequest(m)) => assert_eq!(m, message),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_layout() {
        let engine = ScriptedEngine::builder().with_fim(false).adds_bos(true).build();
        let mut request = FimRequest::new("abc", "xyz");
        request.prompt = "p".to_string();
        let tokens = format_infill(&engine, &request, 4096, 1024).unwrap();

        let mut expected = vec![BOS, FIM_PRE];
        expected.extend(bytes("abc"));
        expected.extend(bytes("p"));
        expected.push(FIM_SUF);
        expected.extend(bytes("xyz"));
        expected.push(FIM_MID);
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_prefix_and_suffix_are_trimmed() {
        let engine = ScriptedEngine::builder().with_fim(false).build();
        let request = FimRequest::new("0123456789", "abcdefghij");
        // n_batch 8: prefix keeps its last 6 tokens, suffix its first 8/4 - 2 = 0.
        let tokens = format_infill(&engine, &request, 8, 1024).unwrap();
        let mut expected = vec![FIM_PRE];
        expected.extend(bytes("456789"));
        expected.push(FIM_SUF);
        expected.push(FIM_MID);
        assert_eq!(tokens, expected);

        // n_batch 16: suffix keeps 16/4 - 2 = 2 tokens.
        let tokens = format_infill(&engine, &request, 16, 1024).unwrap();
        assert_eq!(&tokens[tokens.len() - 3..], &[256 + b'a' as Token, 256 + b'b' as Token, FIM_MID]);
    }

    #[test]
    fn test_extra_chunks_fill_remaining_context() {
        let engine = ScriptedEngine::builder().with_fim(true).build();
        let mut request = FimRequest::new("a", "b");
        request.n_predict = 4;
        request.input_extra = vec![ExtraChunk {
            text: "xy".to_string(),
            filename: Some("f".to_string()),
        }];
        // n_ctx 64 - n_batch 48 - 2*4 leaves room for 8 extra tokens.
        let tokens = format_infill(&engine, &request, 48, 64).unwrap();
        let mut expected = vec![FIM_SEP];
        expected.extend(bytes("f\nxy"));
        expected.push(FIM_PRE);
        assert_eq!(&tokens[..6], &expected[..]);

        // With no room the extra context is dropped.
        let tokens = format_infill(&engine, &request, 60, 64).unwrap();
        assert_eq!(tokens[0], FIM_PRE);
    }

    #[test]
    fn test_snippet_separator_without_file_token() {
        let engine = ScriptedEngine::builder().with_fim(false).build();
        let mut request = FimRequest::new("a", "b");
        request.n_predict = 0;
        request.input_extra = vec![ExtraChunk {
            text: "z".to_string(),
            filename: None,
        }];
        let tokens = format_infill(&engine, &request, 8, 1024).unwrap();
        let mut expected = bytes(CHUNK_SEPARATOR);
        expected.extend(bytes("z"));
        expected.push(FIM_PRE);
        assert_eq!(&tokens[..expected.len()], &expected[..]);
    }

    #[test]
    fn test_infill_generates_middle() {
        let engine = ScriptedEngine::builder()
            .reply("    println!(\"hi\");")
            .with_fim(false)
            .build();
        let request = FimRequest::new("fn main() {\n", "\n}\n");
        let outcome = infill(&engine, &ContextConfig::default(), &request).unwrap();
        assert_eq!(outcome.text, "    println!(\"hi\");");
    }

    #[test]
    fn test_infill_respects_n_predict() {
        let engine = ScriptedEngine::builder().reply("abcdef").endless().with_fim(false).build();
        let mut request = FimRequest::new("x", "y");
        request.n_predict = 3;
        let outcome = infill(&engine, &ContextConfig::default(), &request).unwrap();
        assert_eq!(outcome.text, "abc");
        assert_eq!(outcome.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_empty_prefix_gives_empty_content() {
        let engine = ScriptedEngine::builder().with_fim(false).build();
        let log = engine.decode_log();
        let outcome = infill(&engine, &ContextConfig::default(), &FimRequest::new("", "y")).unwrap();
        assert!(outcome.text.is_empty());
        assert!(log.batches().is_empty());
    }

    #[test]
    fn test_model_without_fim_tokens() {
        let engine = ScriptedEngine::replying("x");
        let result = infill(&engine, &ContextConfig::default(), &FimRequest::new("a", "b"));
        match result {
            Err(ChatError::MissingCapability(m)) => assert_eq!(m, "prefix token is missing."),
            other => panic!("unexpected {:?}", other),
        }
    }
}
