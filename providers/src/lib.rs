//! LLM provider adapters with unified streaming support.
//!
//! # Architecture
//!
//! Every vendor is reached through a [`ProviderAdapter`]:
//!
//! - [`claude`] - Anthropic Messages API
//! - [`deepseek`] - DeepSeek Chat Completions API
//! - [`local`] - Locally hosted OpenAI-compatible servers
//!
//! The two Chat Completions vendors share the decoder in [`openai_compat`].
//! [`AnyAdapter`] dispatches on the provider chosen at startup.
//!
//! # Streaming
//!
//! Adapters decode the vendor's SSE framing into live [`StreamObserver`]
//! callbacks while accumulating a [`CompletionResult`]. Deltas are delivered in
//! arrival order; tool calls are reported once their arguments have fully
//! streamed and parsed.
//!
//! # Resilience
//!
//! [`retry::stream_with_retry`] wraps an adapter call with bounded retry and a
//! hard timeout. Each call also carries a rolling inactivity window
//! ([`StreamOptions::idle_timeout`]) enforced inside the stream loop.
//!
//! # Error Handling
//!
//! All failures are [`ProviderError`]s. A stalled stream yields
//! [`ProviderError::Timeout`]; a user abort yields [`ProviderError::Cancelled`].

pub mod claude;
pub mod deepseek;
mod error;
pub mod http;
mod idle;
pub mod local;
pub mod openai_compat;
pub mod retry;
mod sse;
pub mod sse_types;

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::{ErrorKind, ProviderError};
pub use helm_types;
pub use idle::InactivityTimer;

pub(crate) use helm_types::{
    ApiKey, ApiUsage, CompletionResult, Conversation, GenerationParams, Provider, StreamEvent,
    ToolCall, ToolDefinition,
};

pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Observer
// ============================================================================

/// Live callbacks for a streaming call. All methods default to no-ops.
pub trait StreamObserver: Send + Sync {
    fn on_text_delta(&self, _delta: &str) {}

    fn on_reasoning_delta(&self, _delta: &str) {}

    /// A tool call whose arguments finished streaming and parsed.
    fn on_tool_use(&self, _call: &ToolCall) {}

    fn on_usage(&self, _usage: ApiUsage) {}
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

impl StreamObserver for mpsc::UnboundedSender<StreamEvent> {
    fn on_text_delta(&self, delta: &str) {
        let _ = self.send(StreamEvent::TextDelta(delta.to_string()));
    }

    fn on_reasoning_delta(&self, delta: &str) {
        let _ = self.send(StreamEvent::ReasoningDelta(delta.to_string()));
    }

    fn on_tool_use(&self, call: &ToolCall) {
        let _ = self.send(StreamEvent::ToolUse(call.clone()));
    }

    fn on_usage(&self, usage: ApiUsage) {
        let _ = self.send(StreamEvent::Usage(usage));
    }
}

// ============================================================================
// Request
// ============================================================================

/// Per-call streaming controls.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Cooperative cancellation. Cancelling aborts the transport stream.
    pub abort: CancellationToken,
    /// Maximum silence between stream events before the call fails with `Timeout`.
    pub idle_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            abort: CancellationToken::new(),
            idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        }
    }
}

impl StreamOptions {
    #[must_use]
    pub fn new(abort: CancellationToken, idle_timeout: Duration) -> Self {
        Self {
            abort,
            idle_timeout,
        }
    }
}

/// Normalized input to one completion call. Borrowed for the duration of the
/// call only.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub conversation: &'a Conversation,
    pub tools: &'a [ToolDefinition],
    pub params: &'a GenerationParams,
    pub options: StreamOptions,
}

impl<'a> CompletionRequest<'a> {
    #[must_use]
    pub fn new(
        conversation: &'a Conversation,
        tools: &'a [ToolDefinition],
        params: &'a GenerationParams,
        options: StreamOptions,
    ) -> Self {
        Self {
            conversation,
            tools,
            params,
            options,
        }
    }

    /// Model to request: the per-call override, else the adapter default.
    pub(crate) fn model<'m>(&'m self, adapter_model: &'m str) -> &'m str {
        if self.params.model.trim().is_empty() {
            adapter_model
        } else {
            &self.params.model
        }
    }
}

// ============================================================================
// Adapter contract
// ============================================================================

/// One vendor's streaming completion endpoint.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Default model used when the request does not name one.
    fn model(&self) -> &str;

    /// Stream one completion, reporting deltas to `observer` as they arrive.
    ///
    /// Starting a call invalidates any call still in flight on this instance.
    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest<'a>,
        observer: &'a dyn StreamObserver,
    ) -> impl Future<Output = Result<CompletionResult, ProviderError>> + Send + 'a;
}

/// Single-flight cancellation slot held by every adapter instance.
#[derive(Debug, Default)]
pub struct InFlight {
    current: Mutex<Option<CancellationToken>>,
}

impl InFlight {
    /// Begin a call: cancel the previous call's token and hand out a fresh
    /// child of `abort`.
    pub fn begin(&self, abort: &CancellationToken) -> CancellationToken {
        let token = abort.child_token();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.replace(token.clone())
            && !previous.is_cancelled()
        {
            tracing::debug!("Superseding in-flight request");
            previous.cancel();
        }
        token
    }

    /// Cancel whatever call is in flight, if any.
    pub fn cancel(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = current.as_ref() {
            token.cancel();
        }
    }
}

/// Run `decoder` over a response from [`send_request`], continuing the same
/// inactivity window.
pub(crate) async fn stream_response<D>(
    response: reqwest::Response,
    decoder: &mut D,
    observer: &dyn StreamObserver,
    abort: &CancellationToken,
    timer: &mut InactivityTimer,
) -> Result<(), ProviderError>
where
    D: sse::SseDecoder,
{
    if !response.status().is_success() {
        return Err(http::error_from_response(response, timer, abort).await);
    }
    sse::process_sse_stream(response.bytes_stream(), decoder, observer, abort, timer).await
}

/// Send `request`. Waiting for response headers counts against `timer`, so a
/// server that never answers fails with `Timeout` like a stalled stream.
pub(crate) async fn send_request(
    request: reqwest::RequestBuilder,
    abort: &CancellationToken,
    timer: &mut InactivityTimer,
) -> Result<reqwest::Response, ProviderError> {
    let response = tokio::select! {
        biased;
        () = abort.cancelled() => return Err(ProviderError::Cancelled),
        () = timer.expired() => {
            tracing::warn!(window_secs = timer.window().as_secs(), "No response headers within idle window");
            return Err(ProviderError::Timeout { window: timer.window() });
        }
        response = request.send() => response?,
    };
    timer.touch();
    Ok(response)
}

// ============================================================================
// Dispatch
// ============================================================================

/// Adapter chosen at runtime.
#[derive(Debug)]
pub enum AnyAdapter {
    Claude(claude::ClaudeAdapter),
    DeepSeek(deepseek::DeepSeekAdapter),
    Local(local::LocalAdapter),
}

impl ProviderAdapter for AnyAdapter {
    fn provider(&self) -> Provider {
        match self {
            AnyAdapter::Claude(a) => a.provider(),
            AnyAdapter::DeepSeek(a) => a.provider(),
            AnyAdapter::Local(a) => a.provider(),
        }
    }

    fn model(&self) -> &str {
        match self {
            AnyAdapter::Claude(a) => a.model(),
            AnyAdapter::DeepSeek(a) => a.model(),
            AnyAdapter::Local(a) => a.model(),
        }
    }

    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest<'a>,
        observer: &'a dyn StreamObserver,
    ) -> impl Future<Output = Result<CompletionResult, ProviderError>> + Send + 'a {
        async move {
            match self {
                AnyAdapter::Claude(a) => a.stream_completion(request, observer).await,
                AnyAdapter::DeepSeek(a) => a.stream_completion(request, observer).await,
                AnyAdapter::Local(a) => a.stream_completion(request, observer).await,
            }
        }
    }
}

impl From<claude::ClaudeAdapter> for AnyAdapter {
    fn from(adapter: claude::ClaudeAdapter) -> Self {
        AnyAdapter::Claude(adapter)
    }
}

impl From<deepseek::DeepSeekAdapter> for AnyAdapter {
    fn from(adapter: deepseek::DeepSeekAdapter) -> Self {
        AnyAdapter::DeepSeek(adapter)
    }
}

impl From<local::LocalAdapter> for AnyAdapter {
    fn from(adapter: local::LocalAdapter) -> Self {
        AnyAdapter::Local(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::{InFlight, StreamObserver};
    use helm_types::{ApiUsage, StreamEvent, ToolCall};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn new_call_cancels_previous() {
        let in_flight = InFlight::default();
        let abort = CancellationToken::new();
        let first = in_flight.begin(&abort);
        let second = in_flight.begin(&abort);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!abort.is_cancelled());
    }

    #[test]
    fn user_abort_reaches_in_flight_call() {
        let in_flight = InFlight::default();
        let abort = CancellationToken::new();
        let token = in_flight.begin(&abort);
        abort.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn channel_observer_forwards_events_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_text_delta("Hel");
        tx.on_reasoning_delta("hmm");
        tx.on_text_delta("lo");
        tx.on_tool_use(&ToolCall::new("call_1", "ls", json!({})));
        tx.on_usage(ApiUsage {
            input_tokens: 1,
            output_tokens: 2,
        });

        assert_eq!(rx.try_recv().unwrap(), StreamEvent::TextDelta("Hel".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::ReasoningDelta("hmm".into())
        );
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::TextDelta("lo".into()));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::ToolUse(_)));
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Usage(_)));
    }
}
