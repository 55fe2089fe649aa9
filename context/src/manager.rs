//! Context Manager - prepares a conversation for the next provider call.

use helm_types::Conversation;
use tokio_util::sync::CancellationToken;

use crate::compression::{CompressionConfig, CompressionService, CompressionStats};
use crate::truncation::{Truncation, TruncationBudget, truncate};
use crate::{ContextUsage, TokenCounter, auto_compress_if_needed};

pub const DEFAULT_MAX_CONTEXT_TOKENS: u32 = 180_000;
pub const DEFAULT_SYSTEM_PROMPT_TOKENS: u32 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextConfig {
    pub max_context_tokens: u32,
    /// Reserved for the system prompt; never available to history.
    pub system_prompt_tokens: u32,
    /// Keep the original request in front of the truncation window.
    pub keep_first: bool,
    pub compression: CompressionConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            system_prompt_tokens: DEFAULT_SYSTEM_PROMPT_TOKENS,
            keep_first: true,
            compression: CompressionConfig::default(),
        }
    }
}

impl ContextConfig {
    #[must_use]
    pub fn budget(&self) -> TruncationBudget {
        TruncationBudget {
            max_context_tokens: self.max_context_tokens,
            system_prompt_tokens: self.system_prompt_tokens,
            keep_first: self.keep_first,
        }
    }
}

/// A conversation ready to send, plus what was done to get it there.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedContext {
    pub conversation: Conversation,
    /// Set when auto-compression replaced older history.
    pub compression: Option<CompressionStats>,
    /// Messages dropped by truncation.
    pub truncated: usize,
    pub usage: ContextUsage,
}

#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
    counter: TokenCounter,
}

impl ContextManager {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Reserve at least `tokens` for the system prompt.
    pub fn reserve_system_prompt(&mut self, tokens: u32) {
        self.config.system_prompt_tokens = self.config.system_prompt_tokens.max(tokens);
    }

    #[must_use]
    pub fn counter(&self) -> TokenCounter {
        self.counter
    }

    /// Usage of the whole window, system reservation included.
    #[must_use]
    pub fn usage(&self, conversation: &Conversation) -> ContextUsage {
        let tokens = self
            .counter
            .count_conversation(conversation)
            .saturating_add(self.config.system_prompt_tokens);
        ContextUsage::new(tokens, self.config.max_context_tokens)
    }

    #[must_use]
    pub fn truncate(&self, conversation: Conversation) -> Truncation {
        truncate(conversation, &self.config.budget(), &self.counter)
    }

    /// Compress if configured and triggered, then truncate.
    ///
    /// Truncation always runs, so a failed or skipped compression still
    /// yields a conversation within budget.
    pub async fn prepare<S: CompressionService>(
        &self,
        conversation: Conversation,
        compressor: Option<&S>,
        cancel: &CancellationToken,
    ) -> PreparedContext {
        let usage = self.usage(&conversation);
        let outcome = auto_compress_if_needed(
            conversation,
            &self.config.compression,
            &usage,
            compressor,
            cancel,
        )
        .await;

        let truncation = self.truncate(outcome.conversation);
        let usage = ContextUsage::new(
            truncation
                .tokens
                .saturating_add(self.config.system_prompt_tokens),
            self.config.max_context_tokens,
        );

        tracing::debug!(
            messages = truncation.conversation.len(),
            truncated = truncation.dropped,
            compressed = outcome.compressed,
            usage = %usage.format_compact(),
            "Prepared context"
        );

        PreparedContext {
            conversation: truncation.conversation,
            compression: outcome.stats,
            truncated: truncation.dropped,
            usage,
        }
    }
}
