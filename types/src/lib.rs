//! Core domain types for Helm.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod message;

pub use message::{
    CompletionResult, Conversation, ConversationError, Message, Role, Segment, StopReason,
    ToolCallRef,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Provider Types
// ============================================================================

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Claude,
    DeepSeek,
    /// Locally hosted OpenAI-compatible server (llama.cpp, Ollama, vLLM).
    Local,
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::DeepSeek => "deepseek",
            Provider::Local => "local",
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Claude => "Claude",
            Provider::DeepSeek => "DeepSeek",
            Provider::Local => "Local",
        }
    }

    #[must_use]
    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::Claude => "ANTHROPIC_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
            Provider::Local => "HELM_LOCAL_API_KEY",
        }
    }

    #[must_use]
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Claude => "claude-sonnet-4-5-20250929",
            Provider::DeepSeek => "deepseek-chat",
            Provider::Local => "qwen2.5-coder",
        }
    }

    /// Whether calls to this provider can proceed without an API key.
    #[must_use]
    pub fn key_optional(&self) -> bool {
        matches!(self, Provider::Local)
    }

    /// Parse provider from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "anthropic" => Some(Provider::Claude),
            "deepseek" => Some(Provider::DeepSeek),
            "local" | "ollama" | "llama.cpp" | "vllm" => Some(Provider::Local),
            _ => None,
        }
    }

    /// Infer provider from model name prefix.
    #[must_use]
    pub fn from_model_name(model: &str) -> Option<Self> {
        let lower = model.trim().to_ascii_lowercase();
        if lower.starts_with("claude-") {
            Some(Provider::Claude)
        } else if lower.starts_with("deepseek-") {
            Some(Provider::DeepSeek)
        } else {
            None
        }
    }

    #[must_use]
    pub fn all() -> &'static [Provider] {
        &[Provider::Claude, Provider::DeepSeek, Provider::Local]
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// API Key Types
// ============================================================================

/// Provider-scoped API key.
///
/// Note: `Debug` is manually implemented to redact the key value, preventing accidental
/// credential disclosure in logs or error messages.
#[derive(Clone)]
pub enum ApiKey {
    Claude(String),
    DeepSeek(String),
    Local(String),
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiKey::Claude(_) => write!(f, "ApiKey::Claude(<redacted>)"),
            ApiKey::DeepSeek(_) => write!(f, "ApiKey::DeepSeek(<redacted>)"),
            ApiKey::Local(_) => write!(f, "ApiKey::Local(<redacted>)"),
        }
    }
}

impl ApiKey {
    #[must_use]
    pub fn new(provider: Provider, key: impl Into<String>) -> Self {
        let key = key.into();
        match provider {
            Provider::Claude => ApiKey::Claude(key),
            Provider::DeepSeek => ApiKey::DeepSeek(key),
            Provider::Local => ApiKey::Local(key),
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        match self {
            ApiKey::Claude(_) => Provider::Claude,
            ApiKey::DeepSeek(_) => Provider::DeepSeek,
            ApiKey::Local(_) => Provider::Local,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ApiKey::Claude(key) | ApiKey::DeepSeek(key) | ApiKey::Local(key) => key,
        }
    }
}

// ============================================================================
// Generation Parameters
// ============================================================================

/// Per-call generation parameters supplied by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 8192,
            temperature: None,
            system_prompt: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Token usage reported by the vendor for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ApiUsage {
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Merge a later report into this one. Vendors report input and output
    /// usage in separate events; a zero field never overwrites a known value.
    pub fn merge(&mut self, other: ApiUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Normalized live event delivered while a completion streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content delta.
    TextDelta(String),
    /// Reasoning content delta, for models that separate chain-of-thought.
    ReasoningDelta(String),
    /// A tool call whose arguments finished streaming and parsed.
    ToolUse(ToolCall),
    Usage(ApiUsage),
}

// ============================================================================
// Tool Calling Types
// ============================================================================

/// Definition of a tool that can be called by the LLM.
///
/// This follows the standard function calling schema used by Claude and `OpenAI`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (function name).
    pub name: String,
    /// A description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A completed tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call (used to match results).
    pub id: String,
    pub name: String,
    /// The arguments to pass to the tool, as parsed JSON.
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

impl From<ToolCall> for Segment {
    fn from(call: ToolCall) -> Self {
        Segment::ToolCall {
            id: call.id,
            name: call.name,
            input: call.input,
        }
    }
}

impl From<ToolCallRef<'_>> for ToolCall {
    fn from(call: ToolCallRef<'_>) -> Self {
        Self {
            id: call.id.to_string(),
            name: call.name.to_string(),
            input: call.input.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiKey, ApiUsage, Provider, Segment, ToolCall};
    use serde_json::json;

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new(Provider::DeepSeek, "sk-live-secret");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("sk-live-secret"));
        assert_eq!(rendered, "ApiKey::DeepSeek(<redacted>)");
        assert_eq!(key.provider(), Provider::DeepSeek);
        assert_eq!(key.as_str(), "sk-live-secret");
    }

    #[test]
    fn provider_parse_accepts_aliases() {
        assert_eq!(Provider::parse("Anthropic"), Some(Provider::Claude));
        assert_eq!(Provider::parse(" deepseek "), Some(Provider::DeepSeek));
        assert_eq!(Provider::parse("ollama"), Some(Provider::Local));
        assert_eq!(Provider::parse("gemini"), None);
    }

    #[test]
    fn provider_from_model_name() {
        assert_eq!(
            Provider::from_model_name("claude-opus-4-5-20251101"),
            Some(Provider::Claude)
        );
        assert_eq!(
            Provider::from_model_name("deepseek-reasoner"),
            Some(Provider::DeepSeek)
        );
        assert_eq!(Provider::from_model_name("llama3"), None);
    }

    #[test]
    fn usage_merge_keeps_known_fields() {
        let mut usage = ApiUsage {
            input_tokens: 120,
            output_tokens: 0,
        };
        usage.merge(ApiUsage {
            input_tokens: 0,
            output_tokens: 45,
        });
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 45);
        assert_eq!(usage.total(), 165);
    }

    #[test]
    fn tool_call_converts_to_segment() {
        let segment: Segment = ToolCall::new("toolu_1", "grep", json!({"pattern": "fn"})).into();
        assert_eq!(
            segment,
            Segment::tool_call("toolu_1", "grep", json!({"pattern": "fn"}))
        );
    }
}
