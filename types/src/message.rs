//! Conversation domain model.
//!
//! A [`Conversation`] is an ordered list of [`Message`]s; each message is a
//! role plus an ordered list of [`Segment`]s. Vendor wire shapes are converted
//! into this model at the adapter boundary and never leak past it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ApiUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    /// A tool invocation requested by the assistant.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The outcome of executing a tool call.
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A tool call requested by the model, borrowed out of a [`Segment::ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolCallRef<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Segment>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: Vec<Segment>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Segment::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Segment::text(text)])
    }

    /// A user message carrying tool results, in the order given.
    #[must_use]
    pub fn tool_results(results: Vec<Segment>) -> Self {
        Self::new(Role::User, results)
    }

    /// Concatenated text of all text segments.
    #[must_use]
    pub fn text(&self) -> String {
        self.content.iter().filter_map(Segment::as_text).collect()
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = ToolCallRef<'_>> {
        self.content.iter().filter_map(|segment| match segment {
            Segment::ToolCall { id, name, input } => Some(ToolCallRef { id, name, input }),
            _ => None,
        })
    }

    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|segment| match segment {
            Segment::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("tool result in message {message_index} references unknown tool call {call_id}")]
    OrphanToolResult {
        call_id: String,
        message_index: usize,
    },
}

/// Ordered message history owned by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Checks that every tool result references a tool call made by an
    /// earlier assistant message.
    pub fn validate(&self) -> Result<(), ConversationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (message_index, message) in self.messages.iter().enumerate() {
            if let Some(call_id) = message.tool_result_ids().find(|id| !seen.contains(id)) {
                return Err(ConversationError::OrphanToolResult {
                    call_id: call_id.to_string(),
                    message_index,
                });
            }
            if message.role == Role::Assistant {
                seen.extend(message.tool_calls().map(|call| call.id));
            }
        }
        Ok(())
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl FromIterator<Message> for Conversation {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// Vendor-reported reason a generation ended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

/// Vendor-independent output of one completion call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionResult {
    /// Text and tool-call segments, in the order the vendor produced them.
    pub segments: Vec<Segment>,
    pub stop_reason: StopReason,
    /// Chain-of-thought text for models that separate it. Never part of `segments`.
    pub reasoning: Option<String>,
    pub usage: Option<ApiUsage>,
}

impl CompletionResult {
    pub fn tool_calls(&self) -> impl Iterator<Item = ToolCallRef<'_>> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::ToolCall { id, name, input } => Some(ToolCallRef { id, name, input }),
            _ => None,
        })
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.segments.iter().filter_map(Segment::as_text).collect()
    }

    /// The assistant message to append to the conversation.
    #[must_use]
    pub fn into_message(self) -> Message {
        Message::new(Role::Assistant, self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionResult, Conversation, ConversationError, Message, Role, Segment};
    use serde_json::json;

    fn assistant_calling(id: &str) -> Message {
        Message::new(
            Role::Assistant,
            vec![
                Segment::text("let me look"),
                Segment::tool_call(id, "read_file", json!({"path": "src/main.rs"})),
            ],
        )
    }

    #[test]
    fn validate_accepts_paired_results() {
        let conversation = Conversation::from(vec![
            Message::user("open main"),
            assistant_calling("call_1"),
            Message::tool_results(vec![Segment::tool_result("call_1", "fn main() {}")]),
        ]);
        assert!(conversation.validate().is_ok());
    }

    #[test]
    fn validate_rejects_orphan_result() {
        let conversation = Conversation::from(vec![
            Message::user("open main"),
            Message::tool_results(vec![Segment::tool_result("call_9", "nope")]),
        ]);
        assert_eq!(
            conversation.validate(),
            Err(ConversationError::OrphanToolResult {
                call_id: "call_9".to_string(),
                message_index: 1,
            })
        );
    }

    #[test]
    fn validate_rejects_result_before_call() {
        let conversation = Conversation::from(vec![
            Message::tool_results(vec![Segment::tool_result("call_1", "early")]),
            assistant_calling("call_1"),
        ]);
        assert!(conversation.validate().is_err());
    }

    #[test]
    fn tool_calls_from_user_messages_do_not_count() {
        let conversation = Conversation::from(vec![
            Message::new(
                Role::User,
                vec![Segment::tool_call("call_1", "read_file", json!({}))],
            ),
            Message::tool_results(vec![Segment::tool_result("call_1", "x")]),
        ]);
        assert!(conversation.validate().is_err());
    }

    #[test]
    fn message_text_concatenates_text_segments_only() {
        let message = assistant_calling("call_1");
        assert_eq!(message.text(), "let me look");
        assert_eq!(message.tool_calls().count(), 1);
    }

    #[test]
    fn completion_result_becomes_assistant_message() {
        let result = CompletionResult {
            segments: vec![Segment::text("done")],
            reasoning: Some("thought about it".to_string()),
            ..CompletionResult::default()
        };
        let message = result.into_message();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text(), "done");
    }

    #[test]
    fn segment_serializes_with_type_tag() {
        let value = serde_json::to_value(Segment::tool_result("call_1", "ok")).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_result", "call_id": "call_1", "content": "ok"})
        );
    }
}
