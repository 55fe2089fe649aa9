//! Anthropic Messages API adapter.
//!
//! Tool calling uses `tool_use` / `tool_result` content blocks. Extended
//! thinking arrives as `thinking` blocks; their text is collected into the
//! reasoning side buffer and never replayed into history.

use std::collections::BTreeMap;

use serde_json::json;

use crate::sse::{DecodeAction, SseDecoder, typed_payload};
use crate::sse_types::claude as typed;
use crate::{
    ApiKey, ApiUsage, CompletionRequest, CompletionResult, InFlight, InactivityTimer, Provider,
    ProviderAdapter, ProviderError, StreamObserver, ToolCall, ToolDefinition, http,
};
use helm_types::{Message, Segment, StopReason};

/// Canonical Anthropic API base URL.
pub const CLAUDE_API_BASE_URL: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Request body
// ============================================================================

fn content_blocks(message: &Message) -> Vec<serde_json::Value> {
    message
        .content
        .iter()
        .filter_map(|segment| match segment {
            // The API rejects empty text blocks.
            Segment::Text { text } if text.is_empty() => None,
            Segment::Text { text } => Some(json!({ "type": "text", "text": text })),
            Segment::ToolCall { id, name, input } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input
            })),
            Segment::ToolResult {
                call_id,
                content,
                is_error,
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
                "is_error": is_error
            })),
        })
        .collect()
}

fn tool_schemas(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters
            })
        })
        .collect()
}

pub(crate) fn build_request_body(
    request: &CompletionRequest<'_>,
    model: &str,
) -> serde_json::Value {
    let mut api_messages: Vec<serde_json::Value> = Vec::new();

    for message in request.conversation {
        let blocks = content_blocks(message);
        if blocks.is_empty() {
            tracing::debug!(role = message.role.as_str(), "Skipping empty message");
            continue;
        }
        // Consecutive same-role messages are merged; the API requires alternation.
        if let Some(last) = api_messages.last_mut()
            && last["role"].as_str() == Some(message.role.as_str())
            && let Some(content) = last["content"].as_array_mut()
        {
            content.extend(blocks);
            continue;
        }
        api_messages.push(json!({
            "role": message.role.as_str(),
            "content": blocks
        }));
    }

    let params = request.params;
    let mut body = serde_json::Map::new();
    body.insert("model".into(), json!(model));
    body.insert("max_tokens".into(), json!(params.max_tokens));
    body.insert("stream".into(), json!(true));
    body.insert("messages".into(), json!(api_messages));

    if let Some(prompt) = params.system_prompt.as_deref()
        && !prompt.trim().is_empty()
    {
        body.insert("system".into(), json!(prompt));
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

#[derive(Debug)]
enum Block {
    Text(String),
    Tool {
        id: String,
        name: String,
        json: String,
    },
    Thinking,
    Other,
}

/// Accumulated state for one Claude message, keyed by content block index.
#[derive(Debug, Default)]
pub(crate) struct ClaudeDecoder {
    open: BTreeMap<u32, Block>,
    finished: BTreeMap<u32, Segment>,
    reasoning: String,
    stop_reason: Option<StopReason>,
    usage: Option<ApiUsage>,
}

fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" => StopReason::EndTurn,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        other => StopReason::Other(other.to_string()),
    }
}

impl ClaudeDecoder {
    fn record_usage(&mut self, usage: ApiUsage, observer: &dyn StreamObserver) {
        self.usage.get_or_insert_with(ApiUsage::default).merge(usage);
        observer.on_usage(usage);
    }

    fn close_block(&mut self, index: u32, observer: &dyn StreamObserver) {
        let Some(block) = self.open.remove(&index) else {
            return;
        };
        match block {
            Block::Text(text) => {
                if !text.is_empty() {
                    self.finished.insert(index, Segment::Text { text });
                }
            }
            Block::Tool { id, name, json } => {
                let raw = if json.trim().is_empty() { "{}" } else { &json };
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(input) => {
                        let call = ToolCall::new(id, name, input);
                        observer.on_tool_use(&call);
                        self.finished.insert(index, call.into());
                    }
                    Err(e) => {
                        tracing::warn!(
                            %e,
                            tool = %name,
                            call_id = %id,
                            argument_bytes = json.len(),
                            "Dropping tool call with malformed arguments"
                        );
                    }
                }
            }
            Block::Thinking | Block::Other => {}
        }
    }

    pub(crate) fn into_result(self) -> CompletionResult {
        let has_tool_calls = self
            .finished
            .values()
            .any(|s| matches!(s, Segment::ToolCall { .. }));
        let stop_reason = self.stop_reason.unwrap_or(if has_tool_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        CompletionResult {
            segments: self.finished.into_values().collect(),
            stop_reason,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            usage: self.usage,
        }
    }
}

impl SseDecoder for ClaudeDecoder {
    fn decode(
        &mut self,
        json: serde_json::Value,
        observer: &dyn StreamObserver,
    ) -> Result<DecodeAction, ProviderError> {
        // Deserialize into typed event - forward compatible via Unknown variant
        let Some(event) = typed_payload::<typed::Event>(json, "Claude") else {
            return Ok(DecodeAction::Continue);
        };

        match event {
            typed::Event::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.record_usage(
                        ApiUsage {
                            input_tokens: usage.total_input_tokens(),
                            output_tokens: 0,
                        },
                        observer,
                    );
                }
            }

            typed::Event::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.and_then(|d| d.stop_reason) {
                    self.stop_reason = Some(map_stop_reason(&reason));
                }
                if let Some(usage) = usage
                    && usage.output_tokens > 0
                {
                    self.record_usage(
                        ApiUsage {
                            input_tokens: 0,
                            output_tokens: usage.output_tokens,
                        },
                        observer,
                    );
                }
            }

            typed::Event::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    typed::ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            observer.on_text_delta(&text);
                        }
                        Block::Text(text)
                    }
                    typed::ContentBlock::ToolUse { id, name } => {
                        if id.is_empty() || name.is_empty() {
                            tracing::warn!(
                                index,
                                call_id = %id,
                                tool = %name,
                                "Discarding tool call without id or name"
                            );
                            Block::Other
                        } else {
                            Block::Tool {
                                id,
                                name,
                                json: String::new(),
                            }
                        }
                    }
                    typed::ContentBlock::Thinking { thinking } => {
                        if !thinking.is_empty() {
                            observer.on_reasoning_delta(&thinking);
                            self.reasoning.push_str(&thinking);
                        }
                        Block::Thinking
                    }
                    typed::ContentBlock::Unknown => Block::Other,
                };
                self.open.insert(index, block);
            }

            typed::Event::ContentBlockDelta { index, delta } => match delta {
                typed::Delta::TextDelta { text } => {
                    observer.on_text_delta(&text);
                    match self
                        .open
                        .entry(index)
                        .or_insert_with(|| Block::Text(String::new()))
                    {
                        Block::Text(buffer) => buffer.push_str(&text),
                        other => tracing::debug!(index, ?other, "Text delta for non-text block"),
                    }
                }
                typed::Delta::ThinkingDelta { thinking } => {
                    observer.on_reasoning_delta(&thinking);
                    self.reasoning.push_str(&thinking);
                }
                typed::Delta::InputJsonDelta { partial_json } => match self.open.get_mut(&index) {
                    Some(Block::Tool { json, .. }) => json.push_str(&partial_json),
                    _ => tracing::debug!(index, "Input JSON delta without open tool block"),
                },
                typed::Delta::SignatureDelta { .. } | typed::Delta::Unknown => {}
            },

            typed::Event::ContentBlockStop { index } => {
                self.close_block(index, observer);
            }

            typed::Event::MessageStop => return Ok(DecodeAction::Done),

            typed::Event::Error { error } => {
                let message = if error.message.is_empty() {
                    format!("Claude stream error: {}", error.error_type)
                } else {
                    error.message
                };
                return Err(ProviderError::from_vendor_error(&error.error_type, message));
            }

            typed::Event::Ping | typed::Event::Unknown => {}
        }

        Ok(DecodeAction::Continue)
    }

    fn finalize(&mut self, observer: &dyn StreamObserver) {
        let open: Vec<u32> = self.open.keys().copied().collect();
        for index in open {
            self.close_block(index, observer);
        }
    }

    fn provider_name(&self) -> &'static str {
        "Claude"
    }
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug)]
pub struct ClaudeAdapter {
    client: reqwest::Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
    in_flight: InFlight,
}

impl ClaudeAdapter {
    pub fn new(api_key: ApiKey, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, model, CLAUDE_API_BASE_URL, &http::HttpSettings::default())
    }

    pub fn with_base_url(
        api_key: ApiKey,
        model: impl Into<String>,
        base_url: impl Into<String>,
        settings: &http::HttpSettings,
    ) -> Result<Self, ProviderError> {
        if api_key.provider() != Provider::Claude {
            return Err(ProviderError::Request(format!(
                "{} key cannot be used with Claude",
                api_key.provider().display_name()
            )));
        }
        Ok(Self {
            client: http::build_client(settings)?,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            in_flight: InFlight::default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn run(
        &self,
        request: &CompletionRequest<'_>,
        observer: &dyn StreamObserver,
    ) -> Result<CompletionResult, ProviderError> {
        let abort = self.in_flight.begin(&request.options.abort);
        let model = request.model(&self.model);
        let body = build_request_body(request, model);

        tracing::debug!(
            model,
            messages = request.conversation.len(),
            tools = request.tools.len(),
            "Sending Claude request"
        );

        let builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let mut timer = InactivityTimer::new(request.options.idle_timeout);
        let response = crate::send_request(builder, &abort, &mut timer).await?;
        let mut decoder = ClaudeDecoder::default();
        crate::stream_response(response, &mut decoder, observer, &abort, &mut timer).await?;
        Ok(decoder.into_result())
    }
}

impl ProviderAdapter for ClaudeAdapter {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest<'a>,
        observer: &'a dyn StreamObserver,
    ) -> impl Future<Output = Result<CompletionResult, ProviderError>> + Send + 'a {
        self.run(request, observer)
    }
}
