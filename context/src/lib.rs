//! Context window management: token estimation, truncation, and compression.
//!
//! # Architecture
//!
//! ```text
//! ContextManager::prepare
//! ├── auto_compress_if_needed (CompressionService, failure-safe)
//! └── truncate (always; suffix window + optional first message)
//!
//! PreparedContext
//! └── conversation, compression stats, dropped count, ContextUsage
//! ```

mod compression;
mod manager;
mod summarization;
mod token_counter;
mod truncation;
mod usage;

pub use compression::{
    AutoCompressOutcome, Compression, CompressionConfig, CompressionService, CompressionStats,
    CompressionTrigger, NoCompression, auto_compress_if_needed,
};
pub use manager::{
    ContextConfig, ContextManager, DEFAULT_MAX_CONTEXT_TOKENS, DEFAULT_SYSTEM_PROMPT_TOKENS,
    PreparedContext,
};
pub use summarization::{SUMMARY_PREFIX, SummarizingCompressor, build_transcript};
pub use token_counter::TokenCounter;
pub use truncation::{Truncation, TruncationBudget, truncate};
pub use usage::ContextUsage;
