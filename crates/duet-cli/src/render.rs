//! Console output.
//!
//! Streamed agent text goes to stdout under a role header; status lines go
//! to stderr so stdout stays a clean record of what the agents said.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use duet_agent::{AgentRole, OrchestratorEvent, StreamSinks};

/// Shared stdout writer that prints a header whenever the speaker changes.
#[derive(Debug, Clone, Default)]
pub struct Console {
    speaker: Arc<Mutex<Option<AgentRole>>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks that stream one role's text to stdout.
    pub fn sinks(&self, role: AgentRole) -> StreamSinks {
        let text = self.clone();
        let retry = self.clone();
        StreamSinks::none()
            .with_text(move |chunk| text.write_chunk(role, chunk))
            .with_retry(move |attempt| {
                // The replay starts under a fresh header.
                retry.end_turn();
                eprintln!("{}", retry_line(role, attempt));
            })
    }

    fn write_chunk(&self, role: AgentRole, chunk: &str) {
        let mut speaker = self.speaker();
        let mut out = std::io::stdout().lock();
        if *speaker != Some(role) {
            if speaker.is_some() {
                let _ = writeln!(out);
            }
            let _ = write!(out, "\n[{role}] ");
            *speaker = Some(role);
        }
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }

    /// Close the current speaker's line.
    pub fn end_turn(&self) {
        let mut speaker = self.speaker();
        if speaker.take().is_some() {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out);
            let _ = out.flush();
        }
    }

    fn speaker(&self) -> MutexGuard<'_, Option<AgentRole>> {
        self.speaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Status line shown before a failed provider call is replayed.
pub fn retry_line(role: AgentRole, attempt: u32) -> String {
    format!("  {role} provider call failed, retrying (attempt {})", attempt + 1)
}

/// One-line description of an event, or `None` for events not worth a line.
pub fn status_line(event: &OrchestratorEvent) -> Option<String> {
    use OrchestratorEvent as E;

    let line = match event {
        E::RoundStarted { round } => format!("-- round {round} --"),
        E::DirectiveParsed {
            directive,
            model_hint: Some(hint),
            ..
        } => format!("  director: {directive} (model {hint})"),
        E::DirectiveParsed { directive, .. } => format!("  director: {directive}"),
        E::ToolCompleted {
            role,
            tool,
            is_error: false,
            ..
        } => format!("  {role} ran {tool}"),
        E::ToolCompleted {
            role,
            tool,
            is_error: true,
            summary,
        } => format!("  {role} ran {tool} -- failed: {summary}"),
        E::TurnCompleted { .. } => return None,
        E::TurnTimedOut { role, idle } => format!(
            "  {role} timed out after {}s without progress",
            idle.as_secs()
        ),
        E::ToolLoopExceeded {
            role,
            max_tool_calls,
        } => format!("  {role} stopped after {max_tool_calls} tool calls in one turn"),
        E::CompactionApplied { role, marker } => format!(
            "  {role} history compacted: {} messages, ~{} -> ~{} tokens",
            marker.original_message_count,
            marker.original_token_estimate,
            marker.compacted_token_estimate
        ),
        E::CompactionFailed { role, reason } => {
            format!("  {role} compaction failed, continuing uncompacted: {reason}")
        }
        E::CorrectionIssued { attempt, max } => {
            format!("  director gave no directive, asking again ({attempt}/{max})")
        }
        E::PermissionsChanged {
            tool,
            granted: true,
        } => format!("  actor may now use `{tool}`"),
        E::PermissionsChanged {
            tool,
            granted: false,
        } => format!("  actor may no longer use `{tool}`"),
        E::Paused { role } => format!("  paused during {role} turn"),
        E::Resumed { role } => format!("  resuming {role}"),
        E::Finished { rounds } => format!("finished after {rounds} rounds"),
        E::RoundLimitReached { rounds } => {
            format!("stopped: round limit of {rounds} reached without DONE")
        }
        E::Failed {
            role: Some(role),
            reason,
        } => format!("failed in {role} turn: {reason}"),
        E::Failed { role: None, reason } => format!("failed: {reason}"),
    };
    Some(line)
}
