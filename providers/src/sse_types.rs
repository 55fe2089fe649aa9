//! Typed SSE event structures for provider responses.
//!
//! These types enable compile-time validation of provider JSON responses.
//! Parse errors happen at the serde boundary, not scattered through parsing logic.
//!
//! # Design
//!
//! Each provider module defines:
//! - An event enum tagged by the `type` field (or a chunk struct for untagged formats)
//! - Supporting structs for nested data
//! - `#[serde(default)]` for optional fields with sensible defaults

pub mod claude {
    use serde::Deserialize;

    /// Top-level Claude SSE event, tagged by `type` field.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Event {
        MessageStart {
            message: MessageInfo,
        },
        MessageDelta {
            delta: Option<MessageDeltaInfo>,
            usage: Option<OutputUsage>,
        },
        ContentBlockStart {
            index: u32,
            content_block: ContentBlock,
        },
        ContentBlockDelta {
            index: u32,
            delta: Delta,
        },
        ContentBlockStop {
            index: u32,
        },
        MessageStop,
        /// Ping events (keepalive)
        Ping,
        Error {
            error: ErrorInfo,
        },
        /// Unknown event type - allows forward compatibility
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        #[serde(default, rename = "type")]
        pub error_type: String,
        #[serde(default)]
        pub message: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageInfo {
        pub usage: Option<InputUsage>,
    }

    /// Input token usage from message_start.
    ///
    /// Note: Anthropic's `input_tokens` is non-cached tokens only.
    /// Total input = input_tokens + cache_read + cache_creation
    #[derive(Debug, Deserialize, Default)]
    pub struct InputUsage {
        #[serde(default)]
        pub input_tokens: u32,
        #[serde(default)]
        pub cache_read_input_tokens: u32,
        #[serde(default)]
        pub cache_creation_input_tokens: u32,
    }

    impl InputUsage {
        /// Total input tokens including cached.
        #[must_use]
        pub fn total_input_tokens(&self) -> u32 {
            self.input_tokens
                .saturating_add(self.cache_read_input_tokens)
                .saturating_add(self.cache_creation_input_tokens)
        }
    }

    /// Output token usage from message_delta.
    #[derive(Debug, Deserialize, Default)]
    pub struct OutputUsage {
        #[serde(default)]
        pub output_tokens: u32,
    }

    /// The `delta` object inside a `message_delta` event. The stop reason is
    /// kept raw so unrecognized values survive as `StopReason::Other`.
    #[derive(Debug, Deserialize)]
    pub struct MessageDeltaInfo {
        #[serde(default)]
        pub stop_reason: Option<String>,
    }

    /// Content block in content_block_start.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ContentBlock {
        Text {
            #[serde(default)]
            text: String,
        },
        ToolUse {
            #[serde(default)]
            id: String,
            #[serde(default)]
            name: String,
        },
        Thinking {
            #[serde(default)]
            thinking: String,
        },
        /// Unknown block type - forward compatibility
        #[serde(other)]
        Unknown,
    }

    /// Delta in content_block_delta.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Delta {
        TextDelta {
            text: String,
        },
        ThinkingDelta {
            thinking: String,
        },
        SignatureDelta {
            signature: String,
        },
        InputJsonDelta {
            partial_json: String,
        },
        /// Unknown delta type - forward compatibility
        #[serde(other)]
        Unknown,
    }

}

/// OpenAI Chat Completions streaming chunks, as served by DeepSeek and local
/// OpenAI-compatible servers.
pub mod chat {
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default)]
    pub struct Chunk {
        #[serde(default)]
        pub choices: Vec<Choice>,
        /// Present on the trailing chunk when `stream_options.include_usage` is set.
        #[serde(default)]
        pub usage: Option<Usage>,
        /// In-band error object some servers emit instead of an HTTP error.
        #[serde(default)]
        pub error: Option<ErrorInfo>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Choice {
        #[serde(default)]
        pub delta: Delta,
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Delta {
        #[serde(default)]
        pub content: Option<String>,
        /// DeepSeek reasoner chain-of-thought.
        #[serde(default)]
        pub reasoning_content: Option<String>,
        /// Some servers send `null` rather than omitting the field.
        #[serde(default)]
        pub tool_calls: Option<Vec<ToolCallDelta>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ToolCallDelta {
        /// Position of the call within the message; fragments are keyed by it.
        #[serde(default)]
        pub index: u32,
        #[serde(default)]
        pub id: Option<String>,
        #[serde(default)]
        pub function: Option<FunctionDelta>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct FunctionDelta {
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub arguments: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Usage {
        #[serde(default)]
        pub prompt_tokens: u32,
        #[serde(default)]
        pub completion_tokens: u32,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct ErrorInfo {
        #[serde(default)]
        pub message: String,
        #[serde(default, rename = "type")]
        pub error_type: Option<String>,
        #[serde(default)]
        pub code: Option<serde_json::Value>,
    }

    #[cfg(test)]
    mod tests {
        use super::Chunk;

        #[test]
        fn deserialize_content_chunk() {
            let json = r#"{
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hi"}, "finish_reason": null}]
            }"#;
            let chunk: Chunk = serde_json::from_str(json).unwrap();
            assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
            assert!(chunk.choices[0].finish_reason.is_none());
        }

        #[test]
        fn deserialize_tool_call_fragment() {
            let json = r#"{
                "choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 1, "id": "call_b", "type": "function", "function": {"name": "grep", "arguments": ""}}
                ]}}]
            }"#;
            let chunk: Chunk = serde_json::from_str(json).unwrap();
            let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
            let call = &calls[0];
            assert_eq!(call.index, 1);
            assert_eq!(call.id.as_deref(), Some("call_b"));
            assert_eq!(
                call.function.as_ref().and_then(|f| f.name.as_deref()),
                Some("grep")
            );
        }

        #[test]
        fn deserialize_usage_only_chunk() {
            let json = r#"{"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}}"#;
            let chunk: Chunk = serde_json::from_str(json).unwrap();
            assert!(chunk.choices.is_empty());
            let usage = chunk.usage.unwrap();
            assert_eq!(usage.prompt_tokens, 12);
            assert_eq!(usage.completion_tokens, 7);
        }

        #[test]
        fn deserialize_in_band_error() {
            let json = r#"{"error": {"message": "model is loading", "type": "server_error", "code": 503}}"#;
            let chunk: Chunk = serde_json::from_str(json).unwrap();
            let error = chunk.error.unwrap();
            assert_eq!(error.message, "model is loading");
            assert_eq!(error.error_type.as_deref(), Some("server_error"));
        }
    }
}
