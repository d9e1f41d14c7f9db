//! Directive parsing.
//!
//! Classifies the director's final text into a [`Directive`].  The parser is
//! a pure function of its input: no session state other than the boolean
//! "does the actor already have context" flows in, so it can be tested in
//! isolation from the orchestrator.
//!
//! Rules, first match wins:
//!
//! 1. The last non-empty line is exactly `DONE`, optionally wrapped in
//!    markdown emphasis and followed by punctuation.  Uppercase only, so
//!    "almost done" never ends a run.
//! 2. A line starting with a delegation marker such as `Tell worker:`.  The
//!    rest of that line and every following line is the instruction.
//! 3. Anything else needs correction.

use regex::Regex;

use crate::error::{AgentError, Result};

/// The orchestrator's reading of one director turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Start new work on an actor with no prior context.
    Delegate {
        instruction: String,
        model_hint: Option<String>,
    },
    /// Send a follow-up to an actor that already holds context.
    ContinueActor {
        message: String,
        model_hint: Option<String>,
    },
    /// Neither a delegation nor a completion marker was found.
    NeedsCorrection,
    /// The director declared the task complete.
    Finished,
}

impl Directive {
    /// Short label for logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delegate { .. } => "delegate",
            Self::ContinueActor { .. } => "continueActor",
            Self::NeedsCorrection => "needsCorrection",
            Self::Finished => "finished",
        }
    }

    /// The payload for the actor, if this directive carries one.
    pub fn actor_input(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Self::Delegate {
                instruction,
                model_hint,
            } => Some((instruction, model_hint.as_deref())),
            Self::ContinueActor {
                message,
                model_hint,
            } => Some((message, model_hint.as_deref())),
            _ => None,
        }
    }
}

/// Compiled patterns for directive classification.
#[derive(Debug, Clone)]
pub struct DirectiveParser {
    delegation: Regex,
    model_hint: Regex,
}

const DELEGATION_PATTERN: &str = r"(?im)^[ \t>*_-]*(?:\*\*|__)?(?:tell|ask|to)\s+(?:the\s+)?(?:worker|actor)\s*(?:\[(?:model\s*[:=]\s*)?(?P<hint>[a-z0-9.\-]+)\])?(?:\*\*|__)?\s*:(?:\*\*|__)?[ \t]*";

const MODEL_HINT_PATTERN: &str =
    r"(?i)\[(?:model\s*[:=]\s*)?(?P<hint>opus|sonnet|haiku|capable|balanced|fast)\]|\((?:use\s+)?(?P<paren>opus|sonnet|haiku)\)";

impl DirectiveParser {
    /// Compile the patterns.
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AgentError::Internal(format!(
                "invalid directive pattern: {e}"
            )))
        };
        Ok(Self {
            delegation: compile(DELEGATION_PATTERN)?,
            model_hint: compile(MODEL_HINT_PATTERN)?,
        })
    }

    /// Classify director text.
    ///
    /// `actor_has_context` selects between `Delegate` (fresh actor) and
    /// `ContinueActor` (actor already has history) for the same marker.
    pub fn parse(&self, text: &str, actor_has_context: bool) -> Directive {
        if is_done(text) {
            return Directive::Finished;
        }

        let Some(caps) = self.delegation.captures(text) else {
            return Directive::NeedsCorrection;
        };
        let Some(whole) = caps.get(0) else {
            return Directive::NeedsCorrection;
        };

        let mut hint = caps.name("hint").map(|m| m.as_str().to_ascii_lowercase());
        let mut payload = text[whole.end()..].to_owned();

        if let Some(found) = self.model_hint.captures(&payload) {
            let name = found
                .name("hint")
                .or_else(|| found.name("paren"))
                .map(|m| m.as_str().to_ascii_lowercase());
            if hint.is_none() {
                hint = name;
            }
            if let Some(span) = found.get(0) {
                payload.replace_range(span.range(), "");
            }
        }

        let payload = payload.trim().to_owned();
        if payload.is_empty() {
            return Directive::NeedsCorrection;
        }

        if actor_has_context {
            Directive::ContinueActor {
                message: payload,
                model_hint: hint,
            }
        } else {
            Directive::Delegate {
                instruction: payload,
                model_hint: hint,
            }
        }
    }
}

/// Whether the last non-empty line is a completion marker.
fn is_done(text: &str) -> bool {
    let Some(last) = text.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return false;
    };
    let stripped = last
        .trim_matches(|c: char| matches!(c, '*' | '_' | '~' | '`' | '#' | ' ' | '\t'))
        .trim_end_matches(|c: char| matches!(c, '.' | '!'))
        .trim_matches(|c: char| matches!(c, '*' | '_' | '~' | '`'));
    stripped == "DONE"
}
