//! Shared client for OpenAI-compatible Chat Completions endpoints.
//!
//! DeepSeek and local servers (llama.cpp, Ollama, vLLM) speak the same
//! streaming dialect: `choices[0].delta` chunks, tool calls split into
//! fragments keyed by `index`, a `finish_reason`, an optional trailing usage
//! chunk, and a `[DONE]` sentinel.

use std::collections::BTreeMap;

use serde_json::json;

use crate::sse::{DecodeAction, SseDecoder, typed_payload};
use crate::sse_types::chat as typed;
use crate::{
    ApiKey, ApiUsage, CompletionRequest, CompletionResult, InFlight, InactivityTimer, Provider,
    ProviderError, StreamObserver, ToolCall, ToolDefinition, http,
};
use helm_types::{Role, Segment, StopReason};

// ============================================================================
// Request body
// ============================================================================

fn push_user(messages: &mut Vec<serde_json::Value>, segments: &[Segment]) {
    let mut text = String::new();
    for segment in segments {
        match segment {
            // Tool messages must directly follow the assistant turn that requested them.
            Segment::ToolResult {
                call_id, content, ..
            } => messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content
            })),
            Segment::Text { text: part } => text.push_str(part),
            Segment::ToolCall { id, .. } => {
                tracing::debug!(call_id = %id, "Ignoring tool call in user message");
            }
        }
    }
    if !text.is_empty() {
        messages.push(json!({ "role": "user", "content": text }));
    }
}

fn push_assistant(messages: &mut Vec<serde_json::Value>, segments: &[Segment]) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for segment in segments {
        match segment {
            Segment::Text { text: part } => text.push_str(part),
            Segment::ToolCall { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": input.to_string()
                }
            })),
            Segment::ToolResult { call_id, .. } => {
                tracing::debug!(call_id = %call_id, "Ignoring tool result in assistant message");
            }
        }
    }
    if text.is_empty() && tool_calls.is_empty() {
        return;
    }
    let mut message = serde_json::Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert(
        "content".into(),
        if text.is_empty() {
            serde_json::Value::Null
        } else {
            json!(text)
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), json!(tool_calls));
    }
    messages.push(serde_json::Value::Object(message));
}

fn tool_schemas(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters
                }
            })
        })
        .collect()
}

pub(crate) fn build_request_body(
    request: &CompletionRequest<'_>,
    model: &str,
    include_usage: bool,
) -> serde_json::Value {
    let params = request.params;
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if let Some(prompt) = params.system_prompt.as_deref()
        && !prompt.trim().is_empty()
    {
        messages.push(json!({ "role": "system", "content": prompt }));
    }

    for message in request.conversation {
        match message.role {
            Role::User => push_user(&mut messages, &message.content),
            Role::Assistant => push_assistant(&mut messages, &message.content),
        }
    }

    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(true));
    body.insert("max_tokens".into(), json!(params.max_tokens));

    if include_usage {
        body.insert("stream_options".into(), json!({ "include_usage": true }));
    }

    if let Some(temperature) = params.temperature {
        body.insert("temperature".into(), json!(temperature));
    }

    if !request.tools.is_empty() {
        body.insert("tools".into(), json!(tool_schemas(request.tools)));
    }

    serde_json::Value::Object(body)
}

// ============================================================================
// Stream decoder
// ============================================================================

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulated state for one Chat Completions stream.
#[derive(Debug)]
pub(crate) struct ChatDecoder {
    provider_name: &'static str,
    text: String,
    reasoning: String,
    /// Fragments keyed by the vendor's `index`; several calls may interleave.
    pending: BTreeMap<u32, PartialToolCall>,
    calls: Vec<ToolCall>,
    stop_reason: Option<StopReason>,
    usage: Option<ApiUsage>,
}

fn map_finish_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        other => StopReason::Other(other.to_string()),
    }
}

impl ChatDecoder {
    pub(crate) fn new(provider_name: &'static str) -> Self {
        Self {
            provider_name,
            text: String::new(),
            reasoning: String::new(),
            pending: BTreeMap::new(),
            calls: Vec::new(),
            stop_reason: None,
            usage: None,
        }
    }

    fn apply_fragment(&mut self, fragment: typed::ToolCallDelta) {
        let partial = self.pending.entry(fragment.index).or_default();
        if let Some(id) = fragment.id
            && !id.is_empty()
        {
            partial.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name
                && partial.name.is_empty()
            {
                partial.name = name;
            }
            if let Some(arguments) = function.arguments {
                partial.arguments.push_str(&arguments);
            }
        }
    }

    /// Parse every pending call in index order. Malformed arguments drop only
    /// the offending call.
    fn complete_tool_calls(&mut self, observer: &dyn StreamObserver) {
        for (index, partial) in std::mem::take(&mut self.pending) {
            if partial.name.is_empty() {
                tracing::warn!(index, provider = self.provider_name, "Dropping unnamed tool call");
                continue;
            }
            let raw = if partial.arguments.trim().is_empty() {
                "{}"
            } else {
                partial.arguments.as_str()
            };
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(input) => {
                    let id = if partial.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        partial.id
                    };
                    let call = ToolCall::new(id, partial.name, input);
                    observer.on_tool_use(&call);
                    self.calls.push(call);
                }
                Err(e) => {
                    tracing::warn!(
                        %e,
                        index,
                        tool = %partial.name,
                        provider = self.provider_name,
                        argument_bytes = partial.arguments.len(),
                        "Dropping tool call with malformed arguments"
                    );
                }
            }
        }
    }

    pub(crate) fn into_result(self) -> CompletionResult {
        let mut segments = Vec::with_capacity(self.calls.len() + 1);
        if !self.text.is_empty() {
            segments.push(Segment::Text { text: self.text });
        }
        let has_tool_calls = !self.calls.is_empty();
        segments.extend(self.calls.into_iter().map(Segment::from));
        let stop_reason = self.stop_reason.unwrap_or(if has_tool_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        CompletionResult {
            segments,
            stop_reason,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            usage: self.usage,
        }
    }
}

impl SseDecoder for ChatDecoder {
    fn decode(
        &mut self,
        json: serde_json::Value,
        observer: &dyn StreamObserver,
    ) -> Result<DecodeAction, ProviderError> {
        let Some(chunk) = typed_payload::<typed::Chunk>(json, self.provider_name) else {
            return Ok(DecodeAction::Continue);
        };

        if let Some(error) = chunk.error {
            let kind = error
                .error_type
                .or_else(|| error.code.as_ref().and_then(|c| c.as_str().map(str::to_string)))
                .unwrap_or_else(|| "stream_error".to_string());
            return Err(ProviderError::from_vendor_error(&kind, error.message));
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content
                && !reasoning.is_empty()
            {
                observer.on_reasoning_delta(&reasoning);
                self.reasoning.push_str(&reasoning);
            }
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                observer.on_text_delta(&content);
                self.text.push_str(&content);
            }
            for fragment in delta.tool_calls.into_iter().flatten() {
                self.apply_fragment(fragment);
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(map_finish_reason(&reason));
                self.complete_tool_calls(observer);
            }
        }

        if let Some(usage) = chunk.usage {
            let usage = ApiUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
            self.usage = Some(usage);
            observer.on_usage(usage);
        }

        Ok(DecodeAction::Continue)
    }

    fn finalize(&mut self, observer: &dyn StreamObserver) {
        self.complete_tool_calls(observer);
    }

    fn completed_on_eof(&self) -> bool {
        self.stop_reason.is_some()
    }

    fn provider_name(&self) -> &'static str {
        self.provider_name
    }
}

// ============================================================================
// Client
// ============================================================================

/// Connection details for one Chat Completions endpoint.
#[derive(Debug)]
pub struct ChatCompletionsClient {
    provider: Provider,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<ApiKey>,
    model: String,
    include_usage: bool,
    in_flight: InFlight,
}

impl ChatCompletionsClient {
    pub fn new(
        provider: Provider,
        base_url: &str,
        api_key: Option<ApiKey>,
        model: impl Into<String>,
        settings: &http::HttpSettings,
    ) -> Result<Self, ProviderError> {
        if let Some(key) = &api_key
            && key.provider() != provider
        {
            return Err(ProviderError::Request(format!(
                "{} key cannot be used with {}",
                key.provider().display_name(),
                provider.display_name()
            )));
        }
        Ok(Self {
            provider,
            client: http::build_client(settings)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
            include_usage: true,
            in_flight: InFlight::default(),
        })
    }

    /// Some servers reject `stream_options`; turn it off for them.
    pub fn with_include_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) async fn stream(
        &self,
        request: &CompletionRequest<'_>,
        observer: &dyn StreamObserver,
    ) -> Result<CompletionResult, ProviderError> {
        let abort = self.in_flight.begin(&request.options.abort);
        let model = request.model(&self.model);
        let body = build_request_body(request, model, self.include_usage);
        let provider_name = self.provider.display_name();

        tracing::debug!(
            provider = provider_name,
            model,
            messages = request.conversation.len(),
            tools = request.tools.len(),
            "Sending chat completions request"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key
            && !key.as_str().is_empty()
        {
            builder = builder.bearer_auth(key.as_str());
        }

        let mut timer = InactivityTimer::new(request.options.idle_timeout);
        let response = crate::send_request(builder, &abort, &mut timer).await?;
        let mut decoder = ChatDecoder::new(provider_name);
        crate::stream_response(response, &mut decoder, observer, &abort, &mut timer).await?;
        Ok(decoder.into_result())
    }
}
