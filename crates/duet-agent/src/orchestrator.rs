//! The Director/Actor orchestrator.
//!
//! Top-level state machine of a run:
//!
//! ```text
//! AwaitingTask -> DirectorTurn -> (parse directive) -> ActorTurn -> DirectorTurn -> ...
//!                      |                 |
//!                      |                 +-> needsCorrection -> DirectorTurn (nudge)
//!                      |                 +-> finished
//!                      +-> Paused (operator) -> resume(instruction) -> ...
//! ```
//!
//! Turns strictly alternate; nothing runs concurrently with a turn except the
//! tool call or provider stream it is waiting on.  A round begins with each
//! Director turn and the round ceiling bounds the run.  Before every turn the
//! context budget of the session about to speak is checked and, when it is
//! over its ceiling, the session is compacted first.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::{ContextBudget, RoleTokens};
use crate::compaction::{BoundaryMarker, CompactionTrigger, Compactor};
use crate::config::DuetConfig;
use crate::directive::{Directive, DirectiveParser};
use crate::error::{AgentError, Result};
use crate::llm::assembler::StreamSinks;
use crate::llm::models::ModelRegistry;
use crate::llm::provider::CompletionProvider;
use crate::llm::types::{AgentRole, Message, Usage};
use crate::session::{
    RetryPolicy, Session, ToolObserver, ToolReport, TurnContext, TurnOutcome, TurnStatus,
};
use crate::tools::{PermissionSet, ToolDispatcher, ToolRegistry};
use crate::transcript::{TranscriptRecord, TranscriptWriter};

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Default Director system prompt.
pub const DIRECTOR_PROMPT: &str = "\
You are the Director in a two-agent team. You plan the work; a Worker with tools \
carries it out. Break the task into concrete steps, send the Worker one step at a \
time, and check each report before moving on.

Every reply must end in exactly one of:
- A line starting with `Tell worker:` followed by the Worker's next instruction. \
Everything after the marker is sent to the Worker verbatim. To pick the Worker's \
model for that step, put `[opus]`, `[sonnet]` or `[haiku]` right after the colon.
- A final line containing only `DONE`, once the task is complete and verified.

Worker reports arrive prefixed with `Worker says:`.";

/// Default Actor system prompt.
pub const ACTOR_PROMPT: &str = "\
You are the Worker in a two-agent team. A Director plans the task and sends you \
instructions. Carry out each instruction with your tools and verify the result. \
Then reply with a concise report of what you changed and what you found, including \
anything that failed. Ask the Director a question only when you are blocked.";

const CORRECTION_NUDGE: &str = "\
Your last reply contained neither a delegation nor a completion marker, so nothing \
was sent to the Worker. End your reply with a line starting with `Tell worker:` \
followed by the next instruction, or with a final line containing only `DONE` if \
the task is complete.";

const CUT_OFF_NOTE: &str = "\
(Note: the Director's message was cut off by a timeout, so this instruction may be \
incomplete. Do what is clearly intended and report what was unclear.)";

const RESUME_NOTE: &str = "The operator paused the run and resumed it. Continue where you left off.";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Progress notifications for a front end.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    RoundStarted {
        round: u32,
    },
    DirectiveParsed {
        round: u32,
        directive: &'static str,
        model_hint: Option<String>,
    },
    ToolCompleted {
        role: AgentRole,
        tool: String,
        is_error: bool,
        summary: String,
    },
    TurnCompleted {
        role: AgentRole,
        usage: Usage,
        /// Estimated history size after the turn.
        tokens: usize,
    },
    TurnTimedOut {
        role: AgentRole,
        idle: Duration,
    },
    ToolLoopExceeded {
        role: AgentRole,
        max_tool_calls: u32,
    },
    CompactionApplied {
        role: AgentRole,
        marker: BoundaryMarker,
    },
    CompactionFailed {
        role: AgentRole,
        reason: String,
    },
    CorrectionIssued {
        attempt: u32,
        max: u32,
    },
    PermissionsChanged {
        tool: String,
        granted: bool,
    },
    Paused {
        role: AgentRole,
    },
    Resumed {
        role: AgentRole,
    },
    Finished {
        rounds: u32,
    },
    RoundLimitReached {
        rounds: u32,
    },
    Failed {
        role: Option<AgentRole>,
        reason: String,
    },
}

/// How a call to [`Orchestrator::run`] or [`Orchestrator::resume`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The Director declared the task complete.
    Finished { rounds: u32, summary: String },
    /// The round ceiling was reached without a completion marker.
    RoundLimit { rounds: u32 },
    /// The operator paused the run; call [`Orchestrator::resume`].
    Paused { role: AgentRole },
}

/// Coarse orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    AwaitingTask,
    DirectorTurn,
    ActorTurn,
    Paused,
    Finished,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingTask => "awaiting task",
            Self::DirectorTurn => "director turn",
            Self::ActorTurn => "actor turn",
            Self::Paused => "paused",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Lets another task pause a running orchestrator.
///
/// Pausing cancels the in-flight provider stream or tool call.  The
/// orchestrator swaps in a fresh token when it resumes.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause.  Idempotent.
    pub fn pause(&self) {
        self.lock().cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn current(&self) -> CancellationToken {
        self.lock().clone()
    }

    fn rearm(&self) {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingTask,
    DirectorTurn {
        input: String,
    },
    ActorTurn {
        input: String,
        model_hint: Option<String>,
    },
    Paused {
        role: AgentRole,
    },
    Finished,
}

impl Phase {
    fn role(&self) -> Option<AgentRole> {
        match self {
            Self::DirectorTurn { .. } => Some(AgentRole::Director),
            Self::ActorTurn { .. } => Some(AgentRole::Actor),
            Self::Paused { role } => Some(*role),
            Self::AwaitingTask | Self::Finished => None,
        }
    }
}

enum Step {
    Next(Phase),
    Done(RunOutcome),
}

/// Drives one Director and one Actor session through a task.
pub struct Orchestrator {
    provider: Arc<dyn CompletionProvider>,
    dispatcher: ToolDispatcher,
    compactor: Compactor,
    models: ModelRegistry,
    parser: DirectiveParser,
    budget: ContextBudget,
    retry: RetryPolicy,
    max_rounds: u32,
    max_corrections: u32,

    director: Session,
    actor: Session,
    director_sinks: StreamSinks,
    actor_sinks: StreamSinks,

    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    transcript: Option<TranscriptWriter>,
    pause: PauseHandle,

    phase: Phase,
    round: u32,
    corrections: u32,
    tokens: RoleTokens,
    director_usage: Usage,
    actor_usage: Usage,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("state", &self.state())
            .field("round", &self.round)
            .field("max_rounds", &self.max_rounds)
            .field("director", &self.director.id())
            .field("actor", &self.actor.id())
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator from a validated configuration.
    ///
    /// Model names in the configuration are resolved through `models`;
    /// allow-lists are expanded against the tools in `registry`.
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<ToolRegistry>,
        models: ModelRegistry,
        config: &DuetConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (director_permissions, actor_permissions) = {
            let available: Vec<&str> = registry.names().collect();
            (
                PermissionSet::from_allow_list(
                    config.director.tools.iter().map(String::as_str),
                    available.iter().copied(),
                ),
                PermissionSet::from_allow_list(
                    config.actor.tools.iter().map(String::as_str),
                    available.iter().copied(),
                ),
            )
        };
        if !director_permissions.is_superset_of(&actor_permissions) {
            return Err(AgentError::ConfigError {
                reason: "actor tools must be a subset of director tools".into(),
            });
        }

        let mut director_config =
            config.session_config(AgentRole::Director, models.resolve(&config.director.model));
        director_config
            .system_prompt
            .get_or_insert_with(|| DIRECTOR_PROMPT.to_owned());
        let mut actor_config =
            config.session_config(AgentRole::Actor, models.resolve(&config.actor.model));
        actor_config
            .system_prompt
            .get_or_insert_with(|| ACTOR_PROMPT.to_owned());

        Ok(Self {
            compactor: Compactor::new(Arc::clone(&provider), config.compactor_config()),
            provider,
            dispatcher: ToolDispatcher::new(registry, config.dispatcher_config()),
            models,
            parser: DirectiveParser::new()?,
            budget: config.context_budget(),
            retry: config.retry_policy(),
            max_rounds: config.limits.max_rounds,
            max_corrections: config.limits.max_consecutive_corrections,
            director: Session::new(director_config, director_permissions),
            actor: Session::new(actor_config, actor_permissions),
            director_sinks: StreamSinks::none(),
            actor_sinks: StreamSinks::none(),
            events: None,
            transcript: None,
            pause: PauseHandle::new(),
            phase: Phase::AwaitingTask,
            round: 0,
            corrections: 0,
            tokens: RoleTokens::default(),
            director_usage: Usage::default(),
            actor_usage: Usage::default(),
        })
    }

    /// Send progress events to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Log every message, compaction, and tool call to a transcript.
    pub fn with_transcript(mut self, writer: TranscriptWriter) -> Self {
        self.transcript = Some(writer);
        self
    }

    /// Stream a role's text and reasoning chunks to `sinks`.
    pub fn with_sinks(mut self, role: AgentRole, sinks: StreamSinks) -> Self {
        match role {
            AgentRole::Director => self.director_sinks = sinks,
            AgentRole::Actor => self.actor_sinks = sinks,
        }
        self
    }

    /// A handle that pauses this orchestrator from another task.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    // -- Accessors -----------------------------------------------------------

    pub fn state(&self) -> OrchestratorState {
        match self.phase {
            Phase::AwaitingTask => OrchestratorState::AwaitingTask,
            Phase::DirectorTurn { .. } => OrchestratorState::DirectorTurn,
            Phase::ActorTurn { .. } => OrchestratorState::ActorTurn,
            Phase::Paused { .. } => OrchestratorState::Paused,
            Phase::Finished => OrchestratorState::Finished,
        }
    }

    pub fn director(&self) -> &Session {
        &self.director
    }

    pub fn actor(&self) -> &Session {
        &self.actor
    }

    /// Rounds started so far.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Latest estimated history sizes.
    pub fn tokens(&self) -> RoleTokens {
        self.tokens
    }

    /// Provider usage summed over every turn of a role.
    pub fn usage(&self, role: AgentRole) -> Usage {
        match role {
            AgentRole::Director => self.director_usage,
            AgentRole::Actor => self.actor_usage,
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    fn session(&self, role: AgentRole) -> &Session {
        match role {
            AgentRole::Director => &self.director,
            AgentRole::Actor => &self.actor,
        }
    }

    // -- Permissions ---------------------------------------------------------

    /// Allow the Actor to use a tool from its next turn on.
    ///
    /// Rejected when the tool is not registered or the Director does not
    /// hold it.
    pub fn grant_actor_tool(&mut self, tool_name: &str) -> Result<()> {
        if !self.dispatcher.registry().contains(tool_name) {
            return Err(AgentError::PermissionChangeRejected {
                tool_name: tool_name.to_owned(),
                reason: "no such tool is registered".into(),
            });
        }
        if !self.director.effective_permissions().allows(tool_name) {
            return Err(AgentError::PermissionChangeRejected {
                tool_name: tool_name.to_owned(),
                reason: "the director does not hold this tool".into(),
            });
        }

        let next = self.actor.effective_permissions().grant(tool_name);
        self.actor.stage_permissions(next);
        info!(tool = tool_name, "actor tool granted for next turn");
        self.emit(OrchestratorEvent::PermissionsChanged {
            tool: tool_name.to_owned(),
            granted: true,
        });
        Ok(())
    }

    /// Deny the Actor a tool from its next turn on.
    pub fn revoke_actor_tool(&mut self, tool_name: &str) -> Result<()> {
        if !self.dispatcher.registry().contains(tool_name) {
            return Err(AgentError::PermissionChangeRejected {
                tool_name: tool_name.to_owned(),
                reason: "no such tool is registered".into(),
            });
        }

        let next = self.actor.effective_permissions().revoke(tool_name);
        self.actor.stage_permissions(next);
        info!(tool = tool_name, "actor tool revoked for next turn");
        self.emit(OrchestratorEvent::PermissionsChanged {
            tool: tool_name.to_owned(),
            granted: false,
        });
        Ok(())
    }

    /// Discard the Actor's context.  The next delegation starts it fresh.
    pub fn reset_actor(&mut self) {
        self.actor.reset();
        self.tokens.record(AgentRole::Actor, self.actor.history());
    }

    // -- Run control ---------------------------------------------------------

    /// Start a task.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: provider retries exhausted, history invariant
    /// violations, a Director that stays ambiguous past the correction
    /// limit, or a call in the wrong state.
    pub async fn run(&mut self, task: impl Into<String>) -> Result<RunOutcome> {
        if self.phase != Phase::AwaitingTask {
            return Err(AgentError::InvalidState {
                reason: format!("cannot start a task while {}", self.state()),
            });
        }

        let task = task.into();
        info!(
            director_model = %self.director.model(),
            actor_model = %self.actor.model(),
            max_rounds = self.max_rounds,
            "run started"
        );
        self.record(TranscriptRecord::metadata(json!({
            "event": "task",
            "task": task,
            "directorModel": self.director.model(),
            "actorModel": self.actor.model(),
        })))
        .await;

        self.phase = Phase::DirectorTurn { input: task };
        self.drive().await
    }

    /// Continue a paused run, threading `instruction` into the session that
    /// was interrupted.  An empty instruction just continues.
    pub async fn resume(&mut self, instruction: &str) -> Result<RunOutcome> {
        let Phase::Paused { role } = self.phase else {
            return Err(AgentError::InvalidState {
                reason: format!("cannot resume while {}", self.state()),
            });
        };

        self.pause.rearm();
        let instruction = instruction.trim();
        let input = if instruction.is_empty() {
            RESUME_NOTE.to_owned()
        } else {
            format!(
                "The operator paused the run and added this instruction:\n\n{instruction}\n\n\
                 Take it into account and continue."
            )
        };

        info!(%role, "run resumed");
        self.emit(OrchestratorEvent::Resumed { role });
        self.record(TranscriptRecord::metadata(json!({
            "event": "resumed",
            "role": role,
            "instruction": instruction,
        })))
        .await;

        self.phase = match role {
            AgentRole::Director => Phase::DirectorTurn { input },
            AgentRole::Actor => Phase::ActorTurn {
                input,
                model_hint: None,
            },
        };
        self.drive().await
    }

    /// Compact a session now, regardless of its budget.
    ///
    /// On failure the history is unchanged and the error returned.
    pub async fn compact(
        &mut self,
        role: AgentRole,
        trigger: CompactionTrigger,
    ) -> Result<BoundaryMarker> {
        self.compact_with(role, trigger, &CancellationToken::new())
            .await
    }

    async fn compact_with(
        &mut self,
        role: AgentRole,
        trigger: CompactionTrigger,
        cancel: &CancellationToken,
    ) -> Result<BoundaryMarker> {
        let session = match role {
            AgentRole::Director => &mut self.director,
            AgentRole::Actor => &mut self.actor,
        };
        let result = session
            .compact(&self.compactor, &self.dispatcher, trigger, cancel)
            .await;

        match result {
            Ok(marker) => {
                let history = session.history().to_vec();
                self.tokens.record(role, &history);
                self.emit(OrchestratorEvent::CompactionApplied {
                    role,
                    marker: marker.clone(),
                });
                match TranscriptRecord::boundary(role, &marker, &history) {
                    Ok(record) => self.record(record).await,
                    Err(e) => warn!(%role, error = %e, "could not encode boundary record"),
                }
                Ok(marker)
            }
            Err(AgentError::CompactionCancelled) => {
                info!(%role, "compaction abandoned on pause");
                Err(AgentError::CompactionCancelled)
            }
            Err(e) => {
                warn!(%role, error = %e, "compaction failed, continuing with full history");
                self.emit(OrchestratorEvent::CompactionFailed {
                    role,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Finished);
            let role = phase.role();

            let step = match phase {
                Phase::DirectorTurn { input } => self.director_step(input).await,
                Phase::ActorTurn { input, model_hint } => self.actor_step(input, model_hint).await,
                Phase::Paused { role } => {
                    self.phase = Phase::Paused { role };
                    return Ok(RunOutcome::Paused { role });
                }
                Phase::AwaitingTask | Phase::Finished => {
                    return Err(AgentError::InvalidState {
                        reason: "no task is in progress".into(),
                    });
                }
            };

            match step {
                Ok(Step::Next(next)) => self.phase = next,
                Ok(Step::Done(outcome)) => {
                    self.phase = match &outcome {
                        RunOutcome::Paused { role } => Phase::Paused { role: *role },
                        RunOutcome::Finished { .. } | RunOutcome::RoundLimit { .. } => {
                            Phase::Finished
                        }
                    };
                    return Ok(outcome);
                }
                Err(e) => {
                    error!(role = ?role, round = self.round, error = %e, "run failed");
                    self.emit(OrchestratorEvent::Failed {
                        role,
                        reason: e.to_string(),
                    });
                    self.record(TranscriptRecord::metadata(json!({
                        "event": "failed",
                        "round": self.round,
                        "reason": e.to_string(),
                    })))
                    .await;
                    return Err(e);
                }
            }
        }
    }

    async fn director_step(&mut self, input: String) -> Result<Step> {
        if self.round >= self.max_rounds {
            warn!(rounds = self.round, "round limit reached without completion");
            self.emit(OrchestratorEvent::RoundLimitReached { rounds: self.round });
            self.record(TranscriptRecord::metadata(json!({
                "event": "roundLimit",
                "rounds": self.round,
            })))
            .await;
            return Ok(Step::Done(RunOutcome::RoundLimit { rounds: self.round }));
        }

        self.round += 1;
        let round = self.round;
        info!(round, "round started");
        self.emit(OrchestratorEvent::RoundStarted { round });

        let outcome = self.run_turn(AgentRole::Director, input, None).await?;
        if outcome.status == TurnStatus::Cancelled {
            // An interrupted director turn does not use up a round.
            self.round -= 1;
            return Ok(self.paused(AgentRole::Director));
        }

        let directive = self.parser.parse(&outcome.text, self.actor.has_context());

        if let TurnStatus::TimedOut { idle } = outcome.status {
            // Only a delegation survives a cut-off reply.
            return Ok(Step::Next(match directive.actor_input() {
                Some((payload, hint)) => {
                    self.directive_parsed(round, &directive);
                    self.corrections = 0;
                    Phase::ActorTurn {
                        input: format!("{payload}\n\n{CUT_OFF_NOTE}"),
                        model_hint: hint.map(str::to_owned),
                    }
                }
                None => Phase::DirectorTurn {
                    input: director_timeout_notice(idle),
                },
            }));
        }

        self.directive_parsed(round, &directive);
        match directive {
            Directive::Finished => {
                info!(rounds = round, "director declared the task complete");
                self.emit(OrchestratorEvent::Finished { rounds: round });
                self.record(TranscriptRecord::metadata(json!({
                    "event": "finished",
                    "rounds": round,
                })))
                .await;
                Ok(Step::Done(RunOutcome::Finished {
                    rounds: round,
                    summary: outcome.text,
                }))
            }
            Directive::NeedsCorrection => {
                if self.corrections >= self.max_corrections {
                    return Err(AgentError::DirectiveAmbiguous {
                        corrections: self.corrections,
                    });
                }
                self.corrections += 1;
                warn!(
                    round,
                    attempt = self.corrections,
                    max = self.max_corrections,
                    "director reply had no directive, re-prompting"
                );
                self.emit(OrchestratorEvent::CorrectionIssued {
                    attempt: self.corrections,
                    max: self.max_corrections,
                });

                let input = match outcome.status {
                    TurnStatus::ToolLoopExceeded { max_tool_calls } => format!(
                        "You reached the limit of {max_tool_calls} tool calls in one turn.\n\n{CORRECTION_NUDGE}"
                    ),
                    _ => CORRECTION_NUDGE.to_owned(),
                };
                Ok(Step::Next(Phase::DirectorTurn { input }))
            }
            Directive::Delegate {
                instruction: input,
                model_hint,
            }
            | Directive::ContinueActor {
                message: input,
                model_hint,
            } => {
                self.corrections = 0;
                Ok(Step::Next(Phase::ActorTurn { input, model_hint }))
            }
        }
    }

    async fn actor_step(&mut self, input: String, model_hint: Option<String>) -> Result<Step> {
        let model = model_hint.as_deref().map(|hint| self.models.resolve(hint));
        let outcome = self
            .run_turn(AgentRole::Actor, input.clone(), model.as_deref())
            .await?;

        let relay = match outcome.status {
            TurnStatus::Cancelled => return Ok(self.paused(AgentRole::Actor)),
            TurnStatus::Complete => worker_says(&outcome.text),
            TurnStatus::TimedOut { idle } => worker_timed_out(&input, idle, &outcome.text),
            TurnStatus::ToolLoopExceeded { max_tool_calls } => {
                worker_hit_tool_cap(max_tool_calls, &outcome.text)
            }
        };
        debug!(chars = relay.len(), "relaying actor reply to director");
        Ok(Step::Next(Phase::DirectorTurn { input: relay }))
    }

    /// Run one turn of a role: budget check, submit, then bookkeeping.
    async fn run_turn(
        &mut self,
        role: AgentRole,
        input: String,
        model: Option<&str>,
    ) -> Result<TurnOutcome> {
        let cancel = self.pause.current();
        // A compaction abandoned on pause leaves `cancel` fired, so the
        // submit below returns a cancelled turn straight away.
        self.compact_if_needed(role, &cancel).await;

        let on_tool = self.events.clone().map(|tx| -> ToolObserver {
            Arc::new(move |report: &ToolReport| {
                // A closed receiver only means nobody is listening.
                let _ = tx.send(OrchestratorEvent::ToolCompleted {
                    role,
                    tool: report.tool_name.clone(),
                    is_error: report.is_error,
                    summary: report.summary.clone(),
                });
            })
        });

        let (session, sinks) = match role {
            AgentRole::Director => (&mut self.director, &self.director_sinks),
            AgentRole::Actor => (&mut self.actor, &self.actor_sinks),
        };
        let before = session.history().len();
        let ctx = TurnContext {
            provider: self.provider.as_ref(),
            dispatcher: &self.dispatcher,
            sinks,
            cancel: &cancel,
            retry: &self.retry,
            on_tool,
        };
        let outcome = session.submit_turn(input, model, ctx).await?;
        let appended = session
            .history()
            .get(before..)
            .map(<[Message]>::to_vec)
            .unwrap_or_default();
        self.tokens.record(role, session.history());

        match role {
            AgentRole::Director => self.director_usage.add(outcome.usage),
            AgentRole::Actor => self.actor_usage.add(outcome.usage),
        }

        for message in &appended {
            match TranscriptRecord::message(role, message) {
                Ok(record) => self.record(record).await,
                Err(e) => warn!(%role, error = %e, "could not encode transcript message"),
            }
        }
        for report in &outcome.tool_reports {
            self.record(TranscriptRecord::metadata(json!({
                "event": "toolCall",
                "role": role,
                "callId": report.call_id,
                "tool": report.tool_name,
                "isError": report.is_error,
                "errorKind": report.error_kind,
                "elapsedMs": report.elapsed.as_millis() as u64,
                "output": report.output,
            })))
            .await;
        }

        match outcome.status {
            TurnStatus::TimedOut { idle } => {
                warn!(%role, idle_secs = idle.as_secs(), "turn timed out, relaying partial output");
                self.emit(OrchestratorEvent::TurnTimedOut { role, idle });
            }
            TurnStatus::ToolLoopExceeded { max_tool_calls } => {
                self.emit(OrchestratorEvent::ToolLoopExceeded {
                    role,
                    max_tool_calls,
                });
            }
            TurnStatus::Complete | TurnStatus::Cancelled => {}
        }
        self.emit(OrchestratorEvent::TurnCompleted {
            role,
            usage: outcome.usage,
            tokens: self.tokens.get(role),
        });

        Ok(outcome)
    }

    /// Compact a role's session when it is over budget.  Failure is reported
    /// and the turn proceeds on the full history.
    async fn compact_if_needed(&mut self, role: AgentRole, cancel: &CancellationToken) {
        let session = self.session(role);
        if !self.budget.should_compact(session.history()) {
            return;
        }
        info!(
            %role,
            tokens = session.token_estimate(),
            ceiling = self.budget.ceiling(),
            "context budget exceeded, compacting"
        );
        // Failure has already been logged and emitted.
        let _ = self.compact_with(role, CompactionTrigger::Auto, cancel).await;
    }

    fn directive_parsed(&self, round: u32, directive: &Directive) {
        let model_hint = directive.actor_input().and_then(|(_, hint)| hint.map(str::to_owned));
        info!(round, directive = directive.label(), model_hint = ?model_hint, "directive parsed");
        self.emit(OrchestratorEvent::DirectiveParsed {
            round,
            directive: directive.label(),
            model_hint,
        });
    }

    fn paused(&mut self, role: AgentRole) -> Step {
        info!(%role, round = self.round, "run paused by operator");
        self.emit(OrchestratorEvent::Paused { role });
        Step::Done(RunOutcome::Paused { role })
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn record(&mut self, record: TranscriptRecord) {
        if let Some(writer) = self.transcript.as_mut()
            && let Err(e) = writer.append(&record).await
        {
            warn!(path = %writer.path().display(), error = %e, "transcript write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Relay formatting
// ---------------------------------------------------------------------------

fn worker_says(reply: &str) -> String {
    let reply = reply.trim();
    if reply.is_empty() {
        "Worker says: (the worker finished without a text reply)".to_owned()
    } else {
        format!("Worker says: {reply}")
    }
}

fn worker_timed_out(instruction: &str, idle: Duration, partial: &str) -> String {
    let partial = partial.trim();
    format!(
        "Worker attempted: {} but timed out after {}s without progress. Partial output:\n{}",
        headline(instruction),
        idle.as_secs(),
        if partial.is_empty() { "(none)" } else { partial }
    )
}

fn worker_hit_tool_cap(max_tool_calls: u32, reply: &str) -> String {
    let reply = reply.trim();
    format!(
        "Worker stopped after reaching the limit of {max_tool_calls} tool calls in one turn. Last output:\n{}",
        if reply.is_empty() { "(none)" } else { reply }
    )
}

fn director_timeout_notice(idle: Duration) -> String {
    format!(
        "Your previous reply timed out after {}s without progress and was cut off before \
         it reached a directive.\n\n{CORRECTION_NUDGE}",
        idle.as_secs()
    )
}

/// First line of an instruction, capped for inclusion in a status line.
fn headline(text: &str) -> String {
    const MAX_CHARS: usize = 200;
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() > MAX_CHARS {
        let cut: String = line.chars().take(MAX_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_owned()
    }
}
