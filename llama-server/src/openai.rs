//! Request and response bodies of the OpenAI-compatible routes.

use crate::error::{ApiError, ApiResult};
use axum::body::Bytes;
use axum::response::sse::Event;
use llama_chat::{ChatMessage, GenerationOutcome, GenerationRequest, MessageRole, SamplingParams};
use llama_common::ValidatedConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use ulid::Ulid;

/// Parse a JSON request body, reporting syntax errors as 400
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A message as clients send it; `content` may be a string or a list of text parts
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl WireMessage {
    pub fn to_chat_message(&self) -> ApiResult<ChatMessage> {
        let role = MessageRole::from_str(&self.role)?;
        let content = match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => {
                return Err(ApiError::bad_request(format!(
                    "Message with role {} has no content",
                    self.role
                )))
            }
            other => {
                return Err(ApiError::bad_request(format!(
                    "Unsupported message content: {}",
                    other
                )))
            }
        };
        Ok(ChatMessage::new(role, content))
    }
}

pub fn to_chat_messages(messages: Option<&[WireMessage]>) -> ApiResult<Vec<ChatMessage>> {
    match messages {
        Some(messages) if !messages.is_empty() => {
            messages.iter().map(WireMessage::to_chat_message).collect()
        }
        _ => Err(ApiError::bad_request("Missing or empty messages")),
    }
}

/// Sampling fields shared by the chat and completion bodies
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingFields {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub seed: Option<u32>,
}

impl SamplingFields {
    /// Greedy unless the client asks for a temperature
    pub fn to_params(&self, repeat_penalty: f32) -> ApiResult<SamplingParams> {
        let mut params = SamplingParams::greedy().with_repeat_penalty(repeat_penalty);
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            params.top_p = top_p;
        }
        if let Some(top_k) = self.top_k {
            params.top_k = top_k;
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        params
            .validate()
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        Ok(params)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Option<Vec<WireMessage>>,
    pub model: Option<String>,
    pub stream: Option<bool>,
    pub max_tokens: Option<usize>,
    pub max_completion_tokens: Option<usize>,
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingFields,
}

impl ChatCompletionRequest {
    pub fn to_generation(&self, default_max_tokens: usize, repeat_penalty: f32) -> ApiResult<GenerationRequest> {
        let request = GenerationRequest {
            messages: to_chat_messages(self.messages.as_deref())?,
            sampling: self.sampling.to_params(repeat_penalty)?,
            max_tokens: self
                .max_tokens
                .or(self.max_completion_tokens)
                .unwrap_or(default_max_tokens),
            stream: self.stream.unwrap_or(false),
        };
        request.validate()?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn from_outcome(outcome: &GenerationOutcome) -> Self {
        Self {
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.tokens_generated,
            total_tokens: outcome.prompt_tokens + outcome.tokens_generated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

impl ChatCompletion {
    pub fn new(model: String, outcome: &GenerationOutcome) -> Self {
        Self {
            id: format!("chatcmpl-{}", Ulid::new()),
            object: "chat.completion",
            created: unix_now(),
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(outcome.text.clone()),
                finish_reason: outcome.finish_reason.as_openai(),
            }],
            usage: Usage::from_outcome(outcome),
        }
    }
}

/// Which OpenAI object a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Chat,
    Text,
}

/// Builds the SSE events of one streamed response; every chunk shares an id
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    id: String,
    created: i64,
    model: String,
    kind: ChunkKind,
}

impl ChunkBuilder {
    pub fn new(kind: ChunkKind, model: String) -> Self {
        let prefix = match kind {
            ChunkKind::Chat => "chatcmpl",
            ChunkKind::Text => "cmpl",
        };
        Self {
            id: format!("{}-{}", prefix, Ulid::new()),
            created: unix_now(),
            model,
            kind,
        }
    }

    fn event(&self, choice: Value, usage: Option<Usage>) -> Event {
        let object = match self.kind {
            ChunkKind::Chat => "chat.completion.chunk",
            ChunkKind::Text => "text_completion",
        };
        let mut chunk = json!({
            "id": self.id,
            "object": object,
            "created": self.created,
            "model": self.model,
            "choices": [choice],
        });
        if let Some(usage) = usage {
            chunk["usage"] = json!(usage);
        }
        Event::default().data(chunk.to_string())
    }

    /// Opening chunk announcing the assistant role (chat streams only)
    pub fn role(&self) -> Event {
        self.event(
            json!({"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}),
            None,
        )
    }

    pub fn content(&self, text: &str) -> Event {
        let choice = match self.kind {
            ChunkKind::Chat => {
                json!({"index": 0, "delta": {"content": text}, "finish_reason": null})
            }
            ChunkKind::Text => json!({"index": 0, "text": text, "finish_reason": null}),
        };
        self.event(choice, None)
    }

    pub fn finish(&self, outcome: &GenerationOutcome) -> Event {
        let reason = outcome.finish_reason.as_openai();
        let choice = match self.kind {
            ChunkKind::Chat => json!({"index": 0, "delta": {}, "finish_reason": reason}),
            ChunkKind::Text => json!({"index": 0, "text": "", "finish_reason": reason}),
        };
        self.event(choice, Some(Usage::from_outcome(outcome)))
    }

    pub fn done() -> Event {
        Event::default().data("[DONE]")
    }

    pub fn error(error: &ApiError) -> Event {
        Event::default().event("error").data(error.body().to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub sampling: SamplingFields,
}

#[derive(Debug, Serialize)]
pub struct TextCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Value>,
    pub usage: Usage,
}

impl TextCompletion {
    pub fn new(model: String, outcome: &GenerationOutcome) -> Self {
        Self {
            id: format!("cmpl-{}", Ulid::new()),
            object: "text_completion",
            created: unix_now(),
            model,
            choices: vec![json!({
                "index": 0,
                "text": outcome.text,
                "logprobs": null,
                "finish_reason": outcome.finish_reason.as_openai(),
            })],
            usage: Usage::from_outcome(outcome),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Messages(Vec<WireMessage>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    pub input: Option<ResponsesInput>,
    pub instructions: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<usize>,
}

impl ResponsesRequest {
    /// `instructions: "restart"` drops the shared responses context first
    pub fn restarts(&self) -> bool {
        self.instructions.as_deref() == Some("restart")
    }
}

/// OpenAI `response` object for `/v1/responses`
pub fn response_object(model: &str, outcome: &GenerationOutcome) -> Value {
    let id = Ulid::new();
    let incomplete = outcome.finish_reason.as_openai() == "length";
    json!({
        "id": format!("resp_{}", id),
        "object": "response",
        "created_at": unix_now(),
        "status": if incomplete { "incomplete" } else { "completed" },
        "error": null,
        "incomplete_details": if incomplete { json!({"reason": "max_output_tokens"}) } else { Value::Null },
        "model": model,
        "output": [{
            "type": "message",
            "id": format!("msg_{}", id),
            "status": "completed",
            "role": "assistant",
            "content": [{"type": "output_text", "text": outcome.text, "annotations": []}],
        }],
        "usage": {
            "input_tokens": outcome.prompt_tokens,
            "output_tokens": outcome.tokens_generated,
            "total_tokens": outcome.prompt_tokens + outcome.tokens_generated,
        },
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsRequest {
    pub input: Option<EmbeddingInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelObject {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: "model",
            created,
            owned_by: "avllm",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesOnly {
    pub messages: Option<Vec<WireMessage>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_chat::FinishReason;
    use rstest::rstest;

    fn body(value: Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatCompletionRequest =
            parse_body(&body(json!({"messages": [{"role": "user", "content": "hi"}]}))).unwrap();
        let generation = request.to_generation(1024, 1.1).unwrap();
        assert_eq!(generation.messages, vec![ChatMessage::user("hi")]);
        assert_eq!(generation.max_tokens, 1024);
        assert!(!generation.stream);
        assert!(generation.sampling.is_greedy());
        assert!(generation.sampling.has_repeat_penalty());
    }

    #[rstest]
    #[case(json!({}))]
    #[case(json!({"messages": []}))]
    fn test_missing_messages(#[case] value: Value) {
        let request: ChatCompletionRequest = parse_body(&body(value)).unwrap();
        let error = request.to_generation(16, 1.0).unwrap_err();
        assert_eq!(error.to_string(), "Missing or empty messages");
        assert_eq!(error.status().as_u16(), 400);
    }

    #[test]
    fn test_content_parts_are_joined() {
        let message: WireMessage = serde_json::from_value(json!({
            "role": "developer",
            "content": [{"type": "text", "text": "a"}, {"type": "image_url"}, {"type": "text", "text": "b"}]
        }))
        .unwrap();
        assert_eq!(message.to_chat_message().unwrap(), ChatMessage::system("a\nb"));
    }

    #[test]
    fn test_invalid_json() {
        let result: ApiResult<ChatCompletionRequest> = parse_body(&Bytes::from_static(b"{nope"));
        assert!(matches!(result, Err(ApiError::BadRequest(m)) if m.starts_with("Invalid JSON body")));
    }

    #[test]
    fn test_out_of_range_sampling_rejected() {
        let fields = SamplingFields {
            top_p: Some(2.0),
            ..Default::default()
        };
        assert!(fields.to_params(1.0).is_err());
    }

    #[test]
    fn test_chat_completion_shape() {
        let outcome = GenerationOutcome {
            text: "hello".into(),
            prompt_tokens: 3,
            tokens_generated: 5,
            finish_reason: FinishReason::MaxTokens,
        };
        let value = serde_json::to_value(ChatCompletion::new("m".into(), &outcome)).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        assert_eq!(value["choices"][0]["finish_reason"], "length");
        assert_eq!(value["usage"]["total_tokens"], 8);
    }

    #[test]
    fn test_embedding_input_forms() {
        let single: EmbeddingsRequest = serde_json::from_value(json!({"input": "a"})).unwrap();
        assert!(matches!(single.input, Some(EmbeddingInput::Single(_))));
        let batch: EmbeddingsRequest = serde_json::from_value(json!({"input": ["a", "b"]})).unwrap();
        assert!(matches!(batch.input, Some(EmbeddingInput::Batch(v)) if v.len() == 2));
    }
}
