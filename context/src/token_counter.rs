//! Approximate token counting.
//!
//! Vendor tokenizers are not public, so every count here is the same cheap
//! heuristic: one token per four characters, rounded up. It is consistent
//! across providers, which matters more for budgeting than accuracy does.

use helm_types::{Conversation, Message, Segment};

const CHARS_PER_TOKEN: usize = 4;

/// Stateless estimator. `Copy` so managers and compressors can each hold one.
///
/// # Example
///
/// ```
/// use helm_context::TokenCounter;
///
/// let counter = TokenCounter::new();
/// assert_eq!(counter.count_str("Hello"), 2);
/// assert_eq!(counter.count_str(""), 0);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCounter;

impl TokenCounter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// `ceil(chars / 4)`, counted in Unicode scalar values.
    #[must_use]
    pub fn count_str(&self, text: &str) -> u32 {
        let tokens = text.chars().count().div_ceil(CHARS_PER_TOKEN);
        u32::try_from(tokens).unwrap_or(u32::MAX)
    }

    /// Sum over text, serialized tool-call input, and tool-result content.
    #[must_use]
    pub fn count_message(&self, message: &Message) -> u32 {
        message
            .content
            .iter()
            .map(|segment| match segment {
                Segment::Text { text } => self.count_str(text),
                Segment::ToolCall { input, .. } => match serde_json::to_string(input) {
                    Ok(serialized) => self.count_str(&serialized),
                    Err(_) => 0,
                },
                Segment::ToolResult { content, .. } => self.count_str(content),
            })
            .fold(0u32, u32::saturating_add)
    }

    #[must_use]
    pub fn count_messages(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .map(|message| self.count_message(message))
            .fold(0u32, u32::saturating_add)
    }

    #[must_use]
    pub fn count_conversation(&self, conversation: &Conversation) -> u32 {
        self.count_messages(conversation.messages())
    }
}
