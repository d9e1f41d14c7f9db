//! Director and Actor sessions.
//!
//! A [`Session`] owns one conversation history, one permission set, a model
//! selection, and an inactivity timeout.  Its single operation,
//! [`Session::submit_turn`], runs the inner turn loop:
//!
//! ```text
//! Sent -> StreamingResponse -> ToolCallsPending -> Dispatching -> ResultsAppended -> Sent
//!                          \-> Complete
//! ```
//!
//! A turn completes when the assembled message has no tool calls.  The loop
//! is bounded by a per-turn tool-call cap.  Provider errors are retried with
//! exponential backoff; cancellation and inactivity return the partial reply
//! instead of an error.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::estimate_tokens;
use crate::compaction::{BoundaryMarker, Compaction, CompactionTrigger, Compactor, SummaryContext};
use crate::error::{AgentError, Result};
use crate::llm::assembler::{
    Assembly, Interruption, StreamAssembler, StreamSinks, WatchdogConfig, assemble,
};
use crate::llm::provider::CompletionProvider;
use crate::llm::types::{AgentRole, ChatRequest, Message, Role, ToolCall, ToolResult, Usage};
use crate::tools::{DispatchOutcome, PermissionSet, ToolDispatcher};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static settings of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which role this session plays.
    pub role: AgentRole,
    /// Concrete model identifier; empty means the provider default.
    pub model: String,
    /// System prompt sent with every request.
    pub system_prompt: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: Option<u32>,
    /// Extended-reasoning budget, if enabled.
    pub reasoning_budget: Option<u32>,
    /// Abort a stream after this long without an event.
    pub inactivity_timeout: Duration,
    /// How often the watchdog checks for inactivity.
    pub watchdog_tick: Duration,
    /// Hard cap on tool calls within one turn.
    pub max_tool_calls_per_turn: u32,
}

impl SessionConfig {
    /// Defaults for a role.
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            model: String::new(),
            system_prompt: None,
            max_tokens: None,
            reasoning_budget: None,
            inactivity_timeout: Duration::from_secs(120),
            watchdog_tick: Duration::from_millis(500),
            max_tool_calls_per_turn: 50,
        }
    }
}

/// Retry policy for provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// The delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.backoff_factor.powi(retry.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Turn types
// ---------------------------------------------------------------------------

/// A callback observing each tool call as it completes.
pub type ToolObserver = Arc<dyn Fn(&ToolReport) + Send + Sync>;

/// Everything a turn needs besides the session itself.
#[derive(Clone)]
pub struct TurnContext<'a> {
    pub provider: &'a dyn CompletionProvider,
    pub dispatcher: &'a ToolDispatcher,
    pub sinks: &'a StreamSinks,
    pub cancel: &'a CancellationToken,
    pub retry: &'a RetryPolicy,
    pub on_tool: Option<ToolObserver>,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The agent replied without further tool calls.
    Complete,
    /// The stream went quiet; the reply is partial.
    TimedOut { idle: Duration },
    /// The turn was cancelled; the reply is partial.
    Cancelled,
    /// The per-turn tool-call cap was hit.
    ToolLoopExceeded { max_tool_calls: u32 },
}

impl TurnStatus {
    /// Whether the reply text is only what arrived before an interruption.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Cancelled)
    }
}

/// One executed tool call, as seen by observers.
#[derive(Debug, Clone)]
pub struct ToolReport {
    pub call_id: String,
    pub tool_name: String,
    pub is_error: bool,
    /// Error kind for failed calls.
    pub error_kind: Option<&'static str>,
    /// One-line human-readable summary.
    pub summary: String,
    /// Untruncated output.
    pub output: String,
    pub elapsed: Duration,
}

impl ToolReport {
    fn from_outcome(call: &ToolCall, outcome: &DispatchOutcome) -> Self {
        let summary = match &outcome.error {
            Some(e) => e.to_string(),
            None => format!(
                "{} ok ({} chars)",
                call.name,
                outcome.full_content.chars().count()
            ),
        };
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            is_error: outcome.result.is_error,
            error_kind: outcome.error.as_ref().map(|e| e.kind()),
            summary,
            output: outcome.full_content.clone(),
            elapsed: outcome.elapsed,
        }
    }
}

/// The result of one submitted turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The agent's final text (partial when interrupted).
    pub text: String,
    pub status: TurnStatus,
    pub tool_reports: Vec<ToolReport>,
    /// Usage summed over every provider call of the turn.
    pub usage: Usage,
    /// Number of provider calls the turn made, retries excluded.
    pub provider_calls: u32,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One agent's conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    history: Vec<Message>,
    boundaries: Vec<BoundaryMarker>,
    permissions: PermissionSet,
    /// Installed at the start of the next turn.
    staged_permissions: Option<PermissionSet>,
}

impl Session {
    /// Create a session with an empty history.
    pub fn new(config: SessionConfig, permissions: PermissionSet) -> Self {
        let id = Uuid::now_v7();
        info!(session_id = %id, role = %config.role, model = %config.model, "session created");
        Self {
            id,
            config,
            history: Vec::new(),
            boundaries: Vec::new(),
            permissions,
            staged_permissions: None,
        }
    }

    /// Create a session from a restored history.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> AgentRole {
        self.config.role
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn boundaries(&self) -> &[BoundaryMarker] {
        &self.boundaries
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.config.model = model.into();
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.config.inactivity_timeout
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the session holds any conversation.
    pub fn has_context(&self) -> bool {
        !self.history.is_empty()
    }

    /// Approximate token size of the history.
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.history)
    }

    /// Permissions in force for the current turn.
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Permissions the next turn will use.
    pub fn effective_permissions(&self) -> &PermissionSet {
        self.staged_permissions.as_ref().unwrap_or(&self.permissions)
    }

    /// Replace the permission set starting with the next turn.
    pub fn stage_permissions(&mut self, permissions: PermissionSet) {
        self.staged_permissions = Some(permissions);
    }

    /// Discard the conversation and start over under a fresh id.
    ///
    /// Permissions and model selection are kept.
    pub fn reset(&mut self) {
        let old = self.id;
        self.id = Uuid::now_v7();
        self.history.clear();
        self.boundaries.clear();
        info!(old_session_id = %old, session_id = %self.id, role = %self.config.role, "session reset");
    }

    // -- Compaction ----------------------------------------------------------

    /// Summarize the history and swap it in.
    ///
    /// On failure or cancellation the history is untouched and the error is
    /// returned.
    pub async fn compact(
        &mut self,
        compactor: &Compactor,
        dispatcher: &ToolDispatcher,
        trigger: CompactionTrigger,
        cancel: &CancellationToken,
    ) -> Result<BoundaryMarker> {
        let tools = dispatcher.definitions_for(self.effective_permissions());
        let context = SummaryContext {
            model: &self.config.model,
            system: self.config.system_prompt.as_deref(),
            tools: &tools,
        };
        let compaction = compactor
            .compact(&self.history, context, trigger, cancel)
            .await?;
        let marker = compaction.boundary.clone();
        self.apply_compaction(compaction);
        Ok(marker)
    }

    /// Install a compaction result: the history is replaced wholesale and
    /// the boundary recorded.  The session id is retained.
    pub fn apply_compaction(&mut self, compaction: Compaction) {
        debug!(
            session_id = %self.id,
            before = self.history.len(),
            after = compaction.history.len(),
            "installing compacted history"
        );
        self.history = compaction.history;
        self.boundaries.push(compaction.boundary);
    }

    // -- Turn loop -----------------------------------------------------------

    /// Submit one user-role input and run until the agent stops calling
    /// tools, the cap is hit, or the turn is interrupted.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: provider retries exhausted, non-retryable
    /// provider errors, and history invariant violations.  A failed turn is
    /// rolled back: the history is exactly what it was before the call.
    pub async fn submit_turn(
        &mut self,
        input: impl Into<String>,
        model_override: Option<&str>,
        ctx: TurnContext<'_>,
    ) -> Result<TurnOutcome> {
        if let Some(permissions) = self.staged_permissions.take() {
            debug!(session_id = %self.id, "applying staged permissions");
            self.permissions = permissions;
        }

        let before = self.history.len();
        let result = self.run_turn(input.into(), model_override, ctx).await;
        if let Err(e) = &result {
            warn!(
                session_id = %self.id,
                role = %self.config.role,
                discarded = self.history.len().saturating_sub(before),
                error = %e,
                "turn failed, rolling back history"
            );
            self.history.truncate(before);
        }
        result
    }

    async fn run_turn(
        &mut self,
        input: String,
        model_override: Option<&str>,
        ctx: TurnContext<'_>,
    ) -> Result<TurnOutcome> {
        self.history.push(Message::user(input));

        let model = model_override
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.model)
            .to_owned();
        let max_calls = self.config.max_tool_calls_per_turn;

        let mut usage = Usage::default();
        let mut tool_reports = Vec::new();
        let mut calls_used: u32 = 0;
        let mut provider_calls: u32 = 0;

        info!(session_id = %self.id, role = %self.config.role, model = %model, "turn started");

        loop {
            let request = self.build_request(&model, ctx.dispatcher);
            let assembly = self.stream_with_retry(&request, &ctx).await?;
            provider_calls += 1;
            usage.add(assembly.assembled.usage);

            if let Some(interruption) = assembly.interruption {
                let partial = assembly.assembled.message.without_tool_calls();
                let text = partial.text();
                if !partial.content.is_empty() {
                    self.history.push(partial);
                }
                let status = match interruption {
                    Interruption::Cancelled => TurnStatus::Cancelled,
                    Interruption::InactivityTimeout { idle } => TurnStatus::TimedOut { idle },
                };
                info!(session_id = %self.id, role = %self.config.role, ?status, "turn interrupted");
                return Ok(TurnOutcome {
                    text,
                    status,
                    tool_reports,
                    usage,
                    provider_calls,
                });
            }

            let message = assembly.assembled.message;
            let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
            let text = message.text();

            if calls.is_empty() {
                if !message.content.is_empty() {
                    self.history.push(message);
                }
                info!(
                    session_id = %self.id,
                    role = %self.config.role,
                    tool_calls = calls_used,
                    "turn complete"
                );
                return Ok(TurnOutcome {
                    text,
                    status: TurnStatus::Complete,
                    tool_reports,
                    usage,
                    provider_calls,
                });
            }

            self.history.push(message);

            if calls_used + calls.len() as u32 > max_calls {
                warn!(
                    session_id = %self.id,
                    role = %self.config.role,
                    max_tool_calls = max_calls,
                    "tool-call cap reached, turn stopped"
                );
                let results = calls
                    .iter()
                    .map(|call| {
                        ToolResult::error(
                            &call.id,
                            format!(
                                "Error: tool-call limit of {max_calls} per turn reached; call not executed"
                            ),
                        )
                    })
                    .collect();
                self.history.push(Message::tool_results(results));
                self.check_invariants()?;
                return Ok(TurnOutcome {
                    text,
                    status: TurnStatus::ToolLoopExceeded {
                        max_tool_calls: max_calls,
                    },
                    tool_reports,
                    usage,
                    provider_calls,
                });
            }

            let (results, cancelled) = self.dispatch_all(&calls, &ctx, &mut tool_reports).await;
            calls_used += calls.len() as u32;
            self.history.push(Message::tool_results(results));
            self.check_invariants()?;

            if cancelled {
                info!(session_id = %self.id, role = %self.config.role, "turn cancelled during tool dispatch");
                return Ok(TurnOutcome {
                    text,
                    status: TurnStatus::Cancelled,
                    tool_reports,
                    usage,
                    provider_calls,
                });
            }
        }
    }

    /// Execute calls in order.  Cancellation abandons the running call and
    /// answers every unfinished call with an error result, so the history
    /// stays well-formed.
    async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        ctx: &TurnContext<'_>,
        reports: &mut Vec<ToolReport>,
    ) -> (Vec<ToolResult>, bool) {
        let mut results = Vec::with_capacity(calls.len());
        let mut cancelled = false;

        for call in calls {
            if cancelled {
                results.push(ToolResult::error(
                    &call.id,
                    "Error: cancelled by operator before this call ran",
                ));
                continue;
            }

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                outcome = ctx.dispatcher.execute(&self.permissions, call) => Some(outcome),
            };

            match outcome {
                Some(outcome) => {
                    let report = ToolReport::from_outcome(call, &outcome);
                    if let Some(observer) = &ctx.on_tool {
                        observer(&report);
                    }
                    reports.push(report);
                    results.push(outcome.result);
                }
                None => {
                    cancelled = true;
                    warn!(tool = %call.name, call_id = %call.id, "tool call abandoned on cancellation");
                    results.push(ToolResult::error(
                        &call.id,
                        "Error: cancelled by operator while running",
                    ));
                }
            }
        }

        (results, cancelled)
    }

    fn build_request(&self, model: &str, dispatcher: &ToolDispatcher) -> ChatRequest {
        ChatRequest {
            model: model.to_owned(),
            system: self.config.system_prompt.clone(),
            messages: self.history.clone(),
            tools: dispatcher.definitions_for(&self.permissions),
            max_tokens: self.config.max_tokens,
            reasoning_budget: self.config.reasoning_budget,
            temperature: None,
        }
    }

    /// Run one provider call, retrying transient failures.
    async fn stream_with_retry(
        &self,
        request: &ChatRequest,
        ctx: &TurnContext<'_>,
    ) -> Result<Assembly> {
        let watchdog = WatchdogConfig {
            inactivity_timeout: self.config.inactivity_timeout,
            tick: self.config.watchdog_tick,
        };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let opened = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(interrupted(Interruption::Cancelled)),
                _ = tokio::time::sleep(watchdog.inactivity_timeout) => {
                    return Ok(interrupted(Interruption::InactivityTimeout {
                        idle: watchdog.inactivity_timeout,
                    }));
                }
                opened = ctx.provider.stream(request) => opened,
            };

            let result = match opened {
                Ok(events) => assemble(events, ctx.sinks, ctx.cancel, watchdog).await,
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(assembly) => return Ok(assembly),
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(role = %self.config.role, error = %err, "provider call failed");
                return Err(err);
            }

            if attempt > ctx.retry.max_retries {
                return Err(AgentError::ProviderRetriesExhausted {
                    role: self.config.role,
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = ctx.retry.delay_for(attempt);
            ctx.sinks.retry(attempt);
            warn!(
                role = %self.config.role,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "provider call failed, retrying"
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(interrupted(Interruption::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Verify the history's structure.
    ///
    /// The first message must be user-role, and every tool call must be
    /// answered by exactly one matching result before the next round or the
    /// next agent message.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |reason: String| AgentError::InvariantViolation {
            role: self.config.role,
            reason,
        };

        if let Some(first) = self.history.first()
            && first.role != Role::User
        {
            return Err(violation("history does not start with a user message".into()));
        }

        let mut pending: Vec<&str> = Vec::new();
        for (index, message) in self.history.iter().enumerate() {
            match message.role {
                Role::Agent => {
                    if !pending.is_empty() {
                        return Err(violation(format!(
                            "agent message {index} follows unresolved tool calls: {}",
                            pending.join(", ")
                        )));
                    }
                    pending = message
                        .tool_calls()
                        .into_iter()
                        .map(|c| c.id.as_str())
                        .collect();
                }
                Role::User => {
                    for result in message.tool_results_iter() {
                        let Some(pos) = pending.iter().position(|id| *id == result.call_id)
                        else {
                            return Err(violation(format!(
                                "tool result `{}` at message {index} answers no pending call",
                                result.call_id
                            )));
                        };
                        pending.swap_remove(pos);
                    }
                    if message.starts_round() && !pending.is_empty() {
                        return Err(violation(format!(
                            "new input at message {index} while tool calls are unresolved"
                        )));
                    }
                }
            }
        }

        if !pending.is_empty() {
            return Err(violation(format!(
                "unresolved tool calls at end of history: {}",
                pending.join(", ")
            )));
        }
        Ok(())
    }
}

fn interrupted(interruption: Interruption) -> Assembly {
    Assembly {
        assembled: StreamAssembler::new().finish_partial(),
        interruption: Some(interruption),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
