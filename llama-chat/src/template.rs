//! Chat templates: turning a message list into prompt text.

use crate::error::ChatError;
use crate::types::ChatMessage;

/// Renders a conversation into the text the model was trained on
pub trait ChatTemplate: Send + Sync {
    /// Render `messages`, optionally followed by the assistant turn opener
    fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, ChatError>;

    fn name(&self) -> &str;
}

/// ChatML, used when a model ships no usable template of its own
#[derive(Debug, Clone, Default)]
pub struct ChatmlTemplate;

impl ChatmlTemplate {
    pub const TURN_START: &'static str = "<|im_start|>";
    pub const TURN_END: &'static str = "<|im_end|>";
}

impl ChatTemplate for ChatmlTemplate {
    fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, ChatError> {
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str(Self::TURN_START);
            prompt.push_str(message.role.as_str());
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str(Self::TURN_END);
            prompt.push('\n');
        }
        if add_generation_prompt {
            prompt.push_str(Self::TURN_START);
            prompt.push_str("assistant\n");
        }
        Ok(prompt)
    }

    fn name(&self) -> &str {
        "chatml"
    }
}
