//! Run configuration.
//!
//! [`DuetConfig`] is loaded from a TOML or JSON file (chosen by extension),
//! then environment overrides are applied, then it is validated.  A missing
//! file means defaults.  Every section is optional in the file.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::budget::ContextBudget;
use crate::compaction::CompactorConfig;
use crate::error::{AgentError, Result};
use crate::llm::types::AgentRole;
use crate::session::{RetryPolicy, SessionConfig};
use crate::tools::DispatcherConfig;

/// Environment variable overriding the director model.
pub const ENV_DIRECTOR_MODEL: &str = "DUET_DIRECTOR_MODEL";
/// Environment variable overriding the actor model.
pub const ENV_ACTOR_MODEL: &str = "DUET_ACTOR_MODEL";
/// Environment variable overriding the round ceiling.
pub const ENV_MAX_ROUNDS: &str = "DUET_MAX_ROUNDS";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Settings for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Logical (`opus`, `fast`, ...) or concrete model name.
    pub model: String,
    /// Tool allow-list; `"*"` grants every registered tool.
    pub tools: Vec<String>,
    pub max_tokens: u32,
    pub reasoning_budget: Option<u32>,
    pub inactivity_timeout_secs: u64,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl RoleConfig {
    fn director() -> Self {
        Self {
            model: "opus".into(),
            tools: vec!["*".into()],
            max_tokens: 16_000,
            reasoning_budget: None,
            inactivity_timeout_secs: 120,
            system_prompt: None,
        }
    }

    fn actor() -> Self {
        Self {
            model: "sonnet".into(),
            tools: vec!["*".into()],
            max_tokens: 16_000,
            reasoning_budget: None,
            inactivity_timeout_secs: 120,
            system_prompt: None,
        }
    }

    fn allows_all(&self) -> bool {
        self.tools.iter().any(|t| t == "*")
    }
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self::actor()
    }
}

/// Round and loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_rounds: u32,
    pub max_tool_calls_per_turn: u32,
    pub max_consecutive_corrections: u32,
    pub watchdog_tick_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rounds: 30,
            max_tool_calls_per_turn: 50,
            max_consecutive_corrections: 3,
            watchdog_tick_ms: 500,
        }
    }
}

/// Provider retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Context budget and compaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Context window in estimated tokens.
    pub context_window: usize,
    /// Fraction of the window that triggers compaction.
    pub compact_ratio: f64,
    /// Rounds kept verbatim after a compaction summary.
    pub keep_recent_rounds: usize,
    pub summary_max_tokens: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            compact_ratio: 0.8,
            keep_recent_rounds: 0,
            summary_max_tokens: 4096,
        }
    }
}

/// Tool dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub default_timeout_secs: u64,
    /// Per-tool timeouts in seconds.
    pub timeouts: HashMap<String, u64>,
    /// Maximum characters of tool output shown to the agent.
    pub display_limit: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            timeouts: HashMap::from([("run_shell".to_owned(), 300)]),
            display_limit: 16_000,
        }
    }
}

// ---------------------------------------------------------------------------
// DuetConfig
// ---------------------------------------------------------------------------

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuetConfig {
    pub director: RoleConfig,
    pub actor: RoleConfig,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub budget: BudgetConfig,
    pub tools: ToolsConfig,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            director: RoleConfig::director(),
            actor: RoleConfig::actor(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            budget: BudgetConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl DuetConfig {
    /// Load from a file.  A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|e| AgentError::ConfigError {
                reason: format!("invalid JSON in {}: {e}", path.display()),
            })?
        } else {
            toml::from_str(&content)?
        };

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply `DUET_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(model) = lookup(ENV_DIRECTOR_MODEL).filter(|v| !v.is_empty()) {
            debug!(model = %model, "director model overridden from environment");
            self.director.model = model;
        }
        if let Some(model) = lookup(ENV_ACTOR_MODEL).filter(|v| !v.is_empty()) {
            debug!(model = %model, "actor model overridden from environment");
            self.actor.model = model;
        }
        if let Some(raw) = lookup(ENV_MAX_ROUNDS).filter(|v| !v.is_empty()) {
            self.limits.max_rounds = raw.trim().parse().map_err(|e| AgentError::ConfigError {
                reason: format!("{ENV_MAX_ROUNDS}={raw:?} is not a round count: {e}"),
            })?;
        }
        Ok(())
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(AgentError::ConfigError { reason });

        if self.limits.max_rounds == 0 {
            return fail("limits.max_rounds must be at least 1".into());
        }
        if self.limits.max_tool_calls_per_turn == 0 {
            return fail("limits.max_tool_calls_per_turn must be at least 1".into());
        }
        if self.limits.max_consecutive_corrections == 0 {
            return fail("limits.max_consecutive_corrections must be at least 1".into());
        }
        if self.limits.watchdog_tick_ms == 0 {
            return fail("limits.watchdog_tick_ms must be at least 1".into());
        }
        for (name, role) in [("director", &self.director), ("actor", &self.actor)] {
            if role.inactivity_timeout_secs == 0 {
                return fail(format!("{name}.inactivity_timeout_secs must be at least 1"));
            }
            if role.max_tokens == 0 {
                return fail(format!("{name}.max_tokens must be at least 1"));
            }
        }
        if self.budget.context_window == 0 {
            return fail("budget.context_window must be at least 1".into());
        }
        if !(self.budget.compact_ratio > 0.0 && self.budget.compact_ratio <= 1.0) {
            return fail(format!(
                "budget.compact_ratio must be in (0, 1], got {}",
                self.budget.compact_ratio
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return fail("retry.backoff_factor must be at least 1.0".into());
        }
        if self.tools.default_timeout_secs == 0 || self.tools.timeouts.values().any(|t| *t == 0) {
            return fail("tool timeouts must be at least 1 second".into());
        }
        if self.tools.display_limit == 0 {
            return fail("tools.display_limit must be at least 1".into());
        }

        // The director's tools must cover the actor's.
        if !self.director.allows_all() {
            if self.actor.allows_all() {
                return fail("actor.tools grants `*` but director.tools is restricted".into());
            }
            if let Some(extra) = self
                .actor
                .tools
                .iter()
                .find(|t| !self.director.tools.contains(t))
            {
                return fail(format!(
                    "actor.tools grants `{extra}` which director.tools does not"
                ));
            }
        }

        Ok(())
    }

    /// Settings for one role's section.
    pub fn role(&self, role: AgentRole) -> &RoleConfig {
        match role {
            AgentRole::Director => &self.director,
            AgentRole::Actor => &self.actor,
        }
    }

    /// Build the session settings for a role with an already-resolved model.
    pub fn session_config(&self, role: AgentRole, model: String) -> SessionConfig {
        let section = self.role(role);
        SessionConfig {
            role,
            model,
            system_prompt: section.system_prompt.clone(),
            max_tokens: Some(section.max_tokens),
            reasoning_budget: section.reasoning_budget.filter(|b| *b > 0),
            inactivity_timeout: Duration::from_secs(section.inactivity_timeout_secs),
            watchdog_tick: Duration::from_millis(self.limits.watchdog_tick_ms),
            max_tool_calls_per_turn: self.limits.max_tool_calls_per_turn,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_timeout: Duration::from_secs(self.tools.default_timeout_secs),
            timeouts: self
                .tools
                .timeouts
                .iter()
                .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
                .collect(),
            display_limit: self.tools.display_limit,
        }
    }

    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget {
            context_window: self.budget.context_window,
            compact_ratio: self.budget.compact_ratio,
        }
    }

    pub fn compactor_config(&self) -> CompactorConfig {
        CompactorConfig {
            summary_max_tokens: self.budget.summary_max_tokens,
            keep_recent_rounds: self.budget.keep_recent_rounds,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
