//! Context budgeter.
//!
//! Token counts here are an approximation: one token per four characters,
//! rounded up, plus a fixed framing overhead per message.  There is no
//! tokenizer behind it and the numbers will drift from what the provider
//! bills.  Compaction thresholds are tuned against this heuristic, so it
//! must stay deterministic and cheap rather than exact.

use serde::{Deserialize, Serialize};

use crate::llm::types::{AgentRole, Message};

/// Approximate characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Approximate per-message framing overhead in tokens.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimate the token count of a single message.
pub fn estimate_message_tokens(message: &Message) -> usize {
    message.char_len().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate the token count of a history.
pub fn estimate_tokens(history: &[Message]) -> usize {
    history.iter().map(estimate_message_tokens).sum()
}

/// When a history is considered too large.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// The stated context window, in estimated tokens.
    pub context_window: usize,
    /// Fraction of the window at which compaction triggers, in (0, 1].
    pub compact_ratio: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            compact_ratio: 0.8,
        }
    }
}

impl ContextBudget {
    /// The estimated-token ceiling.
    pub fn ceiling(&self) -> usize {
        (self.context_window as f64 * self.compact_ratio).floor() as usize
    }

    /// Whether a history has reached the ceiling.  Pure predicate.
    pub fn should_compact(&self, history: &[Message]) -> bool {
        estimate_tokens(history) >= self.ceiling()
    }
}

/// Running estimated token totals for both roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTokens {
    pub director: usize,
    pub actor: usize,
}

impl RoleTokens {
    /// Record the current estimate for a role's history.
    pub fn record(&mut self, role: AgentRole, history: &[Message]) {
        let estimate = estimate_tokens(history);
        match role {
            AgentRole::Director => self.director = estimate,
            AgentRole::Actor => self.actor = estimate,
        }
    }

    /// The estimate for one role.
    pub fn get(&self, role: AgentRole) -> usize {
        match role {
            AgentRole::Director => self.director,
            AgentRole::Actor => self.actor,
        }
    }

    /// Sum across both roles.
    pub fn total(&self) -> usize {
        self.director + self.actor
    }
}
