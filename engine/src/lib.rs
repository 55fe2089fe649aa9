//! Per-turn orchestration for Helm.
//!
//! One turn prepares the conversation against the context budget, then makes
//! a single resilient streaming call:
//!
//! ```text
//! Engine::run_turn
//! ├── Conversation::validate
//! ├── ContextManager::prepare (compress if triggered, always truncate)
//! └── stream_with_retry (adapter call, cancel-aware backoff)
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use helm_context::{
    CompressionService, CompressionStats, ContextConfig, ContextManager, ContextUsage,
    NoCompression, PreparedContext,
};
pub use helm_providers::retry::RetryPolicy;
pub use helm_providers::{
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS, ErrorKind, ProviderAdapter, ProviderError, StreamObserver,
};
pub use helm_types::{
    ApiUsage, CompletionResult, Conversation, GenerationParams, Message, Provider, ToolCall,
    ToolDefinition,
};

use helm_providers::retry::stream_with_retry;
use helm_providers::{CompletionRequest, StreamOptions};

/// Result of one successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The conversation as sent, after compression and truncation.
    pub conversation: Conversation,
    pub result: CompletionResult,
    pub compression: Option<CompressionStats>,
    /// Messages dropped by truncation before the call.
    pub truncated: usize,
    pub usage: ContextUsage,
}

impl TurnOutcome {
    /// The sent conversation with the assistant reply appended.
    #[must_use]
    pub fn into_conversation(self) -> Conversation {
        let mut conversation = self.conversation;
        conversation.push(self.result.into_message());
        conversation
    }
}

#[derive(Debug)]
pub struct Engine<A, C = NoCompression> {
    adapter: A,
    context: ContextManager,
    compressor: Option<C>,
    policy: RetryPolicy,
    idle_timeout: Duration,
}

impl<A: ProviderAdapter> Engine<A, NoCompression> {
    pub fn new(adapter: A, context: ContextConfig) -> Self {
        Self {
            adapter,
            context: ContextManager::new(context),
            compressor: None,
            policy: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        }
    }
}

impl<A: ProviderAdapter, C: CompressionService> Engine<A, C> {
    /// Use `compressor` when the context config enables auto-compaction.
    pub fn with_compressor<D: CompressionService>(self, compressor: D) -> Engine<A, D> {
        Engine {
            adapter: self.adapter,
            context: self.context,
            compressor: Some(compressor),
            policy: self.policy,
            idle_timeout: self.idle_timeout,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Window usage for `conversation` under `params`' system prompt.
    #[must_use]
    pub fn usage(&self, conversation: &Conversation, params: &GenerationParams) -> ContextUsage {
        self.context_for(params).usage(conversation)
    }

    /// Context manager for one turn, with room reserved for the system prompt.
    fn context_for(&self, params: &GenerationParams) -> ContextManager {
        let mut context = self.context.clone();
        if let Some(prompt) = params.system_prompt.as_deref() {
            let tokens = context.counter().count_str(prompt);
            context.reserve_system_prompt(tokens);
        }
        context
    }

    /// Run one turn. The prepared conversation is handed back in the outcome;
    /// on error the caller keeps whatever copy it retained.
    pub async fn run_turn(
        &self,
        conversation: Conversation,
        tools: &[ToolDefinition],
        params: &GenerationParams,
        observer: &dyn StreamObserver,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ProviderError> {
        conversation
            .validate()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let context = self.context_for(params);
        let prepared = context
            .prepare(conversation, self.compressor.as_ref(), cancel)
            .await;

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if prepared.truncated > 0 {
            tracing::info!(dropped = prepared.truncated, "Truncated conversation history");
        }

        let options = StreamOptions::new(cancel.clone(), self.idle_timeout);
        let request = CompletionRequest::new(&prepared.conversation, tools, params, options);
        let result = stream_with_retry(&self.adapter, &request, observer, &self.policy, None).await;

        let result = match result {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(
                    provider = %self.adapter.provider(),
                    kind = ?error.kind(),
                    error = %error,
                    "Turn failed"
                );
                return Err(error);
            }
        };

        tracing::debug!(
            provider = %self.adapter.provider(),
            stop_reason = ?result.stop_reason,
            tool_calls = result.tool_calls().count(),
            "Turn complete"
        );

        let PreparedContext {
            conversation,
            compression,
            truncated,
            usage,
        } = prepared;

        Ok(TurnOutcome {
            conversation,
            result,
            compression,
            truncated,
            usage,
        })
    }
}
