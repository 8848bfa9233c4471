use crate::error::ChatError;
use llama_common::config::ensure_range;
use llama_common::{CommonError, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = ChatError;

    /// `developer` is the newer OpenAI spelling of `system`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" | "developer" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(ChatError::invalid_request(format!(
                "Unsupported message role: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Token sampling settings for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub top_k: i32,
    pub top_p: f32,
    /// Minimum candidates kept by top-p
    pub min_keep: usize,
    /// `<= 0` selects greedy sampling
    pub temperature: f32,
    pub seed: u32,
    /// `1.0` disables the repetition penalty
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
}

impl SamplingParams {
    /// Deterministic argmax sampling, used for chat unless the request overrides it
    pub fn greedy() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            min_keep: 1,
            temperature: 0.0,
            seed: u32::MAX,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }

    /// Settings used for fill-in-middle requests
    pub fn fim_default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.89,
            min_keep: 20,
            temperature: 1.0,
            seed: u32::MAX,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    pub fn with_repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = penalty;
        self
    }

    pub fn has_repeat_penalty(&self) -> bool {
        (self.repeat_penalty - 1.0).abs() > f32::EPSILON
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::greedy()
    }
}

impl ValidatedConfig for SamplingParams {
    type Error = CommonError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.top_k < 0 {
            return Err(CommonError::validation(format!(
                "top_k must not be negative, got {}",
                self.top_k
            )));
        }
        ensure_range("top_p", self.top_p, 0.0, 1.0)?;
        ensure_range("temperature", self.temperature, 0.0, 10.0)?;
        ensure_range("repeat_penalty", self.repeat_penalty, 0.0, 10.0)?;
        Ok(())
    }

    fn description() -> &'static str {
        "Sampling parameters"
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    MaxTokens,
    /// The token callback asked to stop
    Stopped,
    /// The next batch would not fit in the context window
    ContextExceeded,
    Cancelled,
}

impl FinishReason {
    /// Value of the OpenAI `finish_reason` field
    pub fn as_openai(&self) -> &'static str {
        match self {
            FinishReason::EndOfGeneration | FinishReason::Stopped | FinishReason::Cancelled => {
                "stop"
            }
            FinishReason::MaxTokens | FinishReason::ContextExceeded => "length",
        }
    }
}

/// Result of one completed generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
}

/// One chat turn as received from a client
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    pub max_tokens: usize,
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            sampling: SamplingParams::default(),
            max_tokens: 1024,
            stream: false,
        }
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.messages.is_empty() {
            return Err(ChatError::invalid_request("Missing or empty messages"));
        }
        if self.max_tokens == 0 {
            return Err(ChatError::invalid_request("max_tokens must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("system", MessageRole::System)]
    #[case("developer", MessageRole::System)]
    #[case("user", MessageRole::User)]
    #[case("assistant", MessageRole::Assistant)]
    fn test_role_parsing(#[case] input: &str, #[case] expected: MessageRole) {
        assert_eq!(input.parse::<MessageRole>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_role_is_invalid_request() {
        assert!(matches!(
            "tool".parse::<MessageRole>(),
            Err(ChatError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_session_id_round_trip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_sampling_defaults() {
        let greedy = SamplingParams::default();
        assert!(greedy.is_greedy());
        assert!(!greedy.has_repeat_penalty());
        assert!(greedy.validate().is_ok());

        let fim = SamplingParams::fim_default();
        assert!(!fim.is_greedy());
        assert_eq!(fim.min_keep, 20);
        assert_eq!(fim.seed, 4_294_967_295);

        let bad = SamplingParams {
            top_p: 1.5,
            ..SamplingParams::default()
        };
        assert!(bad.validate().is_err());
    }

    #[rstest]
    #[case(FinishReason::EndOfGeneration, "stop")]
    #[case(FinishReason::Stopped, "stop")]
    #[case(FinishReason::MaxTokens, "length")]
    #[case(FinishReason::ContextExceeded, "length")]
    fn test_openai_finish_reason(#[case] reason: FinishReason, #[case] expected: &str) {
        assert_eq!(reason.as_openai(), expected);
    }

    #[test]
    fn test_empty_request_rejected() {
        let request = GenerationRequest::new(vec![]);
        assert!(matches!(
            request.validate(),
            Err(ChatError::InvalidRequest(m)) if m == "Missing or empty messages"
        ));
        assert!(GenerationRequest::new(vec![ChatMessage::user("hi")])
            .validate()
            .is_ok());
    }
}
