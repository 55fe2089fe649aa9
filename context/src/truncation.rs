//! Suffix-biased truncation.
//!
//! When a conversation exceeds the available budget, the newest messages are
//! kept greedily until the next older one would overflow. Optionally the first
//! message (usually the original request) is retained in front of the window.
//! Everything in between is dropped.

use std::collections::HashSet;

use helm_types::{Conversation, Message};

use crate::TokenCounter;

/// Budget inputs for [`truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationBudget {
    pub max_context_tokens: u32,
    /// Tokens reserved for the system prompt, subtracted from the ceiling.
    pub system_prompt_tokens: u32,
    pub keep_first: bool,
}

impl TruncationBudget {
    #[must_use]
    pub fn available(&self) -> u32 {
        self.max_context_tokens
            .saturating_sub(self.system_prompt_tokens)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    pub conversation: Conversation,
    /// Number of messages removed. Zero on the fast path.
    pub dropped: usize,
    /// Estimated tokens of the returned conversation.
    pub tokens: u32,
}

/// Index of the first message in `window` holding a tool result whose call
/// is not in `known` or in an earlier window message.
fn first_orphan<'a>(
    known: &HashSet<&'a str>,
    window: impl Iterator<Item = (usize, &'a Message)>,
) -> Option<usize> {
    let mut seen = known.clone();
    for (index, message) in window {
        if message.tool_result_ids().any(|id| !seen.contains(id)) {
            return Some(index);
        }
        seen.extend(message.tool_calls().map(|call| call.id));
    }
    None
}

/// Fit `conversation` into `budget`.
///
/// The most recent message always survives, even when it alone exceeds the
/// budget. The first message survives when `keep_first` is set and it fits
/// alongside the most recent one; otherwise truncation falls back to a plain
/// suffix window. The window never starts on a message whose tool results
/// belong to dropped calls, unless that message is the most recent.
#[must_use]
pub fn truncate(
    conversation: Conversation,
    budget: &TruncationBudget,
    counter: &TokenCounter,
) -> Truncation {
    let messages = conversation.messages();
    let available = budget.available();
    let costs: Vec<u32> = messages.iter().map(|m| counter.count_message(m)).collect();
    let total = costs.iter().copied().fold(0u32, u32::saturating_add);

    if total <= available || messages.len() <= 1 {
        return Truncation {
            conversation,
            dropped: 0,
            tokens: total,
        };
    }

    let last = messages.len() - 1;
    let keep_first = if budget.keep_first {
        let reserved = costs[0].saturating_add(costs[last]);
        if reserved > available {
            tracing::warn!(
                first_tokens = costs[0],
                last_tokens = costs[last],
                available,
                "First message does not fit alongside the latest; dropping it"
            );
            false
        } else {
            true
        }
    } else {
        false
    };

    let floor = usize::from(keep_first);
    let mut remaining = if keep_first {
        available - costs[0]
    } else {
        available
    };

    // Newest message is unconditional.
    let mut start = last;
    if costs[last] > remaining {
        tracing::warn!(
            tokens = costs[last],
            available = remaining,
            "Latest message alone exceeds the context budget"
        );
        remaining = 0;
    } else {
        remaining -= costs[last];
    }
    while start > floor && costs[start - 1] <= remaining {
        start -= 1;
        remaining -= costs[start];
    }

    let known: HashSet<&str> = if keep_first {
        messages[0].tool_calls().map(|call| call.id).collect()
    } else {
        HashSet::new()
    };
    while start < last {
        match first_orphan(&known, messages.iter().enumerate().skip(start)) {
            Some(orphan) if orphan < last => start = orphan + 1,
            _ => break,
        }
    }

    let mut kept: Vec<Message> = Vec::with_capacity(last - start + 2);
    let mut tokens = 0u32;
    let mut source = conversation.into_messages();
    let window = source.split_off(start);
    if keep_first && let Some(first) = source.into_iter().next() {
        tokens = tokens.saturating_add(costs[0]);
        kept.push(first);
    }
    tokens = costs[start..]
        .iter()
        .copied()
        .fold(tokens, u32::saturating_add);
    kept.extend(window);

    let dropped = (last + 1).saturating_sub(kept.len());
    tracing::info!(dropped, tokens, available, "Truncated conversation");

    Truncation {
        conversation: Conversation::from(kept),
        dropped,
        tokens,
    }
}
