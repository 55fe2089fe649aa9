//! LLM-backed compression.
//!
//! Everything except the newest `keep_recent` messages is rendered as a
//! transcript and summarized by the configured provider. The summary replaces
//! those messages as a single user message.

use std::fmt::Write;
use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio_util::sync::CancellationToken;

use helm_providers::retry::{RetryPolicy, stream_with_retry};
use helm_providers::{
    CompletionRequest, DEFAULT_STREAM_IDLE_TIMEOUT_SECS, NoopObserver, ProviderAdapter,
    StreamOptions,
};
use helm_types::{Conversation, GenerationParams, Message, Role, Segment};

use crate::compression::{Compression, CompressionConfig, CompressionService, CompressionStats};
use crate::TokenCounter;

/// Marker that starts every summary message.
pub const SUMMARY_PREFIX: &str = "[Earlier conversation summary]";

const MAX_SUMMARY_TOKENS: u32 = 2048;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Summarize the conversation \
transcript you are given so that an assistant can continue the work without it.

REQUIREMENTS:
1. Preserve key facts, decisions, file paths, and code identifiers
2. Keep the chronological order of what was done
3. Note unresolved questions and pending actions
4. Write plain prose; start directly with the content";

/// Render `messages` as a numbered plain-text transcript.
pub fn build_transcript(messages: &[Message]) -> String {
    let mut transcript = String::new();
    for (index, message) in messages.iter().enumerate() {
        let role = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        for segment in &message.content {
            let _ = match segment {
                Segment::Text { text } => {
                    write!(transcript, "[Message {index}] {role}: {text}\n\n")
                }
                Segment::ToolCall { name, input, .. } => write!(
                    transcript,
                    "[Message {index}] {role} (Tool Call: {name}): {input}\n\n"
                ),
                Segment::ToolResult {
                    content, is_error, ..
                } => {
                    let status = if *is_error { "Error" } else { "Result" };
                    write!(transcript, "[Message {index}] Tool {status}: {content}\n\n")
                }
            };
        }
    }
    transcript
}

/// First index of the verbatim tail. Moved earlier while the tail would
/// begin on tool results whose calls are being summarized.
fn split_point(messages: &[Message], keep_recent: usize) -> usize {
    let mut split = messages.len().saturating_sub(keep_recent);
    while split > 0 && split < messages.len() && messages[split].tool_result_ids().next().is_some()
    {
        split -= 1;
    }
    split
}

/// Compression service that asks a provider to summarize older history.
#[derive(Debug)]
pub struct SummarizingCompressor<A> {
    adapter: A,
    model: String,
    policy: RetryPolicy,
    idle_timeout: Duration,
    counter: TokenCounter,
}

impl<A: ProviderAdapter> SummarizingCompressor<A> {
    /// Summarize with `adapter`'s default model.
    pub fn new(adapter: A) -> Self {
        let model = adapter.model().to_string();
        Self {
            adapter,
            model,
            policy: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            counter: TokenCounter::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    async fn summarize(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        let transcript = build_transcript(messages);
        let prompt = Conversation::from(vec![Message::user(format!(
            "Conversation:\n{transcript}"
        ))]);
        let params = GenerationParams::new(self.model.clone())
            .with_max_tokens(MAX_SUMMARY_TOKENS)
            .with_system_prompt(SUMMARY_SYSTEM_PROMPT);
        let options = StreamOptions::new(cancel.clone(), self.idle_timeout);
        let request = CompletionRequest::new(&prompt, &[], &params, options);

        let result = stream_with_retry(&self.adapter, &request, &NoopObserver, &self.policy, None)
            .await
            .map_err(|e| anyhow!("summarization request failed: {e}"))?;

        let summary = result.text().trim().to_string();
        if summary.is_empty() {
            bail!("summarizer returned no text");
        }
        Ok(summary)
    }

    async fn run(
        &self,
        conversation: &Conversation,
        config: &CompressionConfig,
        cancel: &CancellationToken,
    ) -> Result<Compression> {
        let messages = conversation.messages();
        let split = split_point(messages, config.keep_recent);
        if split == 0 {
            bail!(
                "nothing to summarize: {} messages, keeping {}",
                messages.len(),
                config.keep_recent
            );
        }

        let original_tokens = self.counter.count_messages(messages);
        let summary = self.summarize(&messages[..split], cancel).await?;

        let mut compressed: Vec<Message> = Vec::with_capacity(messages.len() - split + 1);
        compressed.push(Message::user(format!("{SUMMARY_PREFIX}\n{summary}")));
        compressed.extend_from_slice(&messages[split..]);
        let compressed_tokens = self.counter.count_messages(&compressed);

        if compressed_tokens >= original_tokens {
            bail!(
                "summary did not reduce size ({compressed_tokens} >= {original_tokens} tokens)"
            );
        }

        let compressed_count = compressed.len();
        Ok(Compression {
            compressed_messages: Conversation::from(compressed),
            stats: CompressionStats {
                original_count: messages.len(),
                compressed_count,
                original_tokens,
                compressed_tokens,
                saved_tokens: original_tokens - compressed_tokens,
                method: "summary".to_string(),
            },
        })
    }
}

impl<A: ProviderAdapter> CompressionService for SummarizingCompressor<A> {
    fn compress<'a>(
        &'a self,
        conversation: &'a Conversation,
        config: &'a CompressionConfig,
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = Result<Compression>> + Send + 'a {
        self.run(conversation, config, cancel)
    }
}
