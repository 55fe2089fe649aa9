//! Compression triggering and the failure-safe auto-compression step.
//!
//! The [`CompressionService`] does the actual rewriting. This module only
//! decides when to ask for it and guarantees that a failed, cancelled, or
//! malformed attempt leaves the conversation untouched.

use std::future::Future;

use helm_types::Conversation;
use tokio_util::sync::CancellationToken;

use crate::ContextUsage;

/// When auto-compression fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionTrigger {
    /// Context usage at or above this percentage of the ceiling.
    Percentage { threshold: f32 },
    /// Estimated tokens at or above this count.
    Tokens { threshold: u32 },
    /// More than this many messages.
    Messages { threshold: usize },
}

impl Default for CompressionTrigger {
    fn default() -> Self {
        CompressionTrigger::Percentage { threshold: 80.0 }
    }
}

impl CompressionTrigger {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            CompressionTrigger::Percentage { .. } => "percentage",
            CompressionTrigger::Tokens { .. } => "tokens",
            CompressionTrigger::Messages { .. } => "messages",
        }
    }

    #[must_use]
    pub fn should_compress(&self, usage: &ContextUsage, message_count: usize) -> bool {
        match *self {
            CompressionTrigger::Percentage { threshold } => usage.percentage >= threshold,
            CompressionTrigger::Tokens { threshold } => usage.total_tokens >= threshold,
            CompressionTrigger::Messages { threshold } => message_count > threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionConfig {
    pub auto_compact: bool,
    pub trigger: CompressionTrigger,
    /// Newest messages a compressor must leave verbatim.
    pub keep_recent: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            auto_compact: false,
            trigger: CompressionTrigger::default(),
            keep_recent: 6,
        }
    }
}

/// Counts describing one successful compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionStats {
    pub original_count: usize,
    pub compressed_count: usize,
    pub original_tokens: u32,
    pub compressed_tokens: u32,
    pub saved_tokens: u32,
    pub method: String,
}

/// Output of a [`CompressionService`]: the rewritten history and its stats.
#[derive(Debug, Clone, PartialEq)]
pub struct Compression {
    pub compressed_messages: Conversation,
    pub stats: CompressionStats,
}

/// Rewrites older history into something smaller.
///
/// `cancel` is the turn's token. Provider requests made by the service carry it.
pub trait CompressionService: Send + Sync {
    fn compress<'a>(
        &'a self,
        conversation: &'a Conversation,
        config: &'a CompressionConfig,
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = anyhow::Result<Compression>> + Send + 'a;
}

/// Service that never compresses. Useful when no compressor is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionService for NoCompression {
    fn compress<'a>(
        &'a self,
        _conversation: &'a Conversation,
        _config: &'a CompressionConfig,
        _cancel: &'a CancellationToken,
    ) -> impl Future<Output = anyhow::Result<Compression>> + Send + 'a {
        async { Err(anyhow::anyhow!("no compression service configured")) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoCompressOutcome {
    pub conversation: Conversation,
    pub compressed: bool,
    pub stats: Option<CompressionStats>,
}

impl AutoCompressOutcome {
    fn unchanged(conversation: Conversation) -> Self {
        Self {
            conversation,
            compressed: false,
            stats: None,
        }
    }
}

/// Compress `conversation` if `config` allows it and `usage` warrants it.
///
/// Never fails. Any error from the service, a cancellation, or a result that
/// breaks tool-call pairing returns the original conversation.
pub async fn auto_compress_if_needed<S: CompressionService>(
    conversation: Conversation,
    config: &CompressionConfig,
    usage: &ContextUsage,
    service: Option<&S>,
    cancel: &CancellationToken,
) -> AutoCompressOutcome {
    if !config.auto_compact {
        return AutoCompressOutcome::unchanged(conversation);
    }
    if !config.trigger.should_compress(usage, conversation.len()) {
        return AutoCompressOutcome::unchanged(conversation);
    }
    let Some(service) = service else {
        tracing::debug!("Compression triggered but no service is configured");
        return AutoCompressOutcome::unchanged(conversation);
    };

    tracing::info!(
        method = config.trigger.method(),
        tokens = usage.total_tokens,
        percentage = usage.percentage,
        messages = conversation.len(),
        "Compressing conversation"
    );

    let attempt = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::info!("Compression cancelled");
            return AutoCompressOutcome::unchanged(conversation);
        }
        result = service.compress(&conversation, config, cancel) => result,
    };

    match attempt {
        Ok(compression) => {
            if let Err(e) = compression.compressed_messages.validate() {
                tracing::warn!(%e, "Compressed conversation is invalid; keeping original");
                return AutoCompressOutcome::unchanged(conversation);
            }
            if compression.compressed_messages.is_empty() {
                tracing::warn!("Compression produced an empty conversation; keeping original");
                return AutoCompressOutcome::unchanged(conversation);
            }
            tracing::info!(
                original_count = compression.stats.original_count,
                compressed_count = compression.stats.compressed_count,
                saved_tokens = compression.stats.saved_tokens,
                "Compressed conversation"
            );
            AutoCompressOutcome {
                conversation: compression.compressed_messages,
                compressed: true,
                stats: Some(compression.stats),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Compression failed; continuing with original conversation");
            AutoCompressOutcome::unchanged(conversation)
        }
    }
}
