//! Context compaction -- replace a long history with one synthesized summary.
//!
//! When a session's estimated size crosses its budget, the compactor:
//!
//! 1. Appends a fixed instruction turn asking for a structured summary.
//! 2. Issues one non-streaming completion call over the whole history.
//! 3. Builds a new history: a single user-role summary message (plus the
//!    most recent rounds, when configured to keep any).
//! 4. Records a [`BoundaryMarker`] describing the swap.
//!
//! The original history is only ever read.  If the summary call fails,
//! returns no text, or is cancelled, the caller keeps its history exactly as
//! it was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::estimate_tokens;
use crate::error::{AgentError, Result};
use crate::llm::provider::CompletionProvider;
use crate::llm::types::{ChatRequest, Message, ToolDefinition, Usage};

/// The instruction appended to the history to request a summary.
const SUMMARY_REQUEST: &str = "\
Your task is to create a detailed summary of the conversation so far. The summary \
replaces the conversation history, so it must let the work continue without losing \
context. Write plain prose under these headings, in this order:

1. Primary Request and Intent: what was asked for, in full.
2. Key Technical Concepts: technologies, frameworks, and decisions in play.
3. Files and Artifacts: every file or artifact examined, created, or modified, and why.
4. Errors and Fixes: each problem encountered and how it was resolved.
5. Pending Tasks: work that was requested and is not finished.
6. Current Work: precisely what was being done immediately before this request.
7. Next Step: the single next action, quoting the latest instruction where relevant.

Respond with the summary only. Do not call any tools.";

/// Wraps the summary in the synthetic continuation turn.
fn continuation_message(summary: &str) -> Message {
    Message::user(format!(
        "This session is being continued from an earlier conversation that ran out of \
         context. The summary below covers the earlier portion of the conversation.\n\n\
         {summary}\n\n\
         Continue the conversation from where it left off without asking any further \
         questions. Resume directly with the last task you were working on."
    ))
}

// ---------------------------------------------------------------------------
// Boundary marker
// ---------------------------------------------------------------------------

/// What caused a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompactionTrigger {
    /// The budgeter reported the history over its ceiling.
    Auto,
    /// Requested explicitly.
    Manual,
}

/// Audit record marking where compaction replaced history.
///
/// Never sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryMarker {
    pub trigger: CompactionTrigger,
    pub original_message_count: usize,
    pub original_token_estimate: usize,
    pub compacted_token_estimate: usize,
    pub timestamp: DateTime<Utc>,
}

/// A successful compaction, ready to be installed into a session.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// The replacement history.
    pub history: Vec<Message>,
    /// The synthetic summary message (first element of `history`).
    pub summary: Message,
    /// The audit record for this swap.
    pub boundary: BoundaryMarker,
    /// Usage of the summary call.
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Compactor
// ---------------------------------------------------------------------------

/// Settings for the summary call and the rebuilt history.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Maximum tokens for the summary response.
    pub summary_max_tokens: u32,
    /// Rounds kept verbatim after the summary.  Zero keeps none.
    pub keep_recent_rounds: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            summary_max_tokens: 4096,
            keep_recent_rounds: 0,
        }
    }
}

/// Summarizes histories through the completion provider.
#[derive(Clone)]
pub struct Compactor {
    provider: Arc<dyn CompletionProvider>,
    config: CompactorConfig,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

/// What the summary request should look like for a given session.
#[derive(Debug, Clone, Copy)]
pub struct SummaryContext<'a> {
    /// The model the session uses.
    pub model: &'a str,
    /// The session's system prompt.
    pub system: Option<&'a str>,
    /// The session's tool definitions; histories containing tool calls are
    /// only valid alongside them.
    pub tools: &'a [ToolDefinition],
}

impl Compactor {
    /// Create a compactor.
    pub fn new(provider: Arc<dyn CompletionProvider>, config: CompactorConfig) -> Self {
        Self { provider, config }
    }

    /// Summarize `history` and build its replacement.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::CompactionFailed`] when the history is empty,
    /// the provider call fails, or the response has no text, and
    /// [`AgentError::CompactionCancelled`] when `cancel` fires while the
    /// summary call is in flight.  The input is never modified.
    pub async fn compact(
        &self,
        history: &[Message],
        context: SummaryContext<'_>,
        trigger: CompactionTrigger,
        cancel: &CancellationToken,
    ) -> Result<Compaction> {
        if history.is_empty() {
            return Err(AgentError::CompactionFailed {
                reason: "nothing to compact".into(),
            });
        }

        let original_token_estimate = estimate_tokens(history);
        info!(
            messages = history.len(),
            tokens = original_token_estimate,
            ?trigger,
            "compacting conversation history"
        );

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.extend_from_slice(history);
        messages.push(Message::user(SUMMARY_REQUEST));

        let request = ChatRequest {
            model: context.model.to_owned(),
            system: context.system.map(str::to_owned),
            messages,
            tools: context.tools.to_vec(),
            max_tokens: Some(self.config.summary_max_tokens),
            reasoning_budget: None,
            temperature: Some(0.0),
        };

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(?trigger, "compaction cancelled, history unchanged");
                return Err(AgentError::CompactionCancelled);
            }
            completion = self.provider.complete(&request) => completion,
        };
        let completion = completion.map_err(|e| AgentError::CompactionFailed {
            reason: format!("summary request failed: {e}"),
        })?;

        let summary_text = completion.message.text();
        if summary_text.trim().is_empty() {
            warn!("summary response carried no text block");
            return Err(AgentError::CompactionFailed {
                reason: "summary response contained no text".into(),
            });
        }
        debug!(summary_chars = summary_text.len(), "received conversation summary");

        let summary = continuation_message(summary_text.trim());
        let mut compacted = vec![summary.clone()];
        if self.config.keep_recent_rounds > 0 {
            compacted.extend(trim_to_recent_rounds(
                history,
                self.config.keep_recent_rounds,
            ));
        }

        let boundary = BoundaryMarker {
            trigger,
            original_message_count: history.len(),
            original_token_estimate,
            compacted_token_estimate: estimate_tokens(&compacted),
            timestamp: Utc::now(),
        };

        info!(
            original = boundary.original_message_count,
            compacted = compacted.len(),
            tokens_before = boundary.original_token_estimate,
            tokens_after = boundary.compacted_token_estimate,
            "compaction complete"
        );

        Ok(Compaction {
            history: compacted,
            summary,
            boundary,
            usage: completion.usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Round trimming
// ---------------------------------------------------------------------------

/// Keep only the last `keep` rounds of a history.
///
/// A round starts at a user-role message carrying text; user messages that
/// only answer tool calls continue the current round.  When the history has
/// `keep` rounds or fewer it is returned whole.
pub fn trim_to_recent_rounds(history: &[Message], keep: usize) -> Vec<Message> {
    if keep == 0 {
        return Vec::new();
    }

    let starts: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, m)| m.starts_round())
        .map(|(i, _)| i)
        .collect();

    if starts.len() <= keep {
        return history.to_vec();
    }

    history[starts[starts.len() - keep]..].to_vec()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
