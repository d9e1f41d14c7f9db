//! CLI argument definitions for Duet.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! wiring the orchestrator together.

use std::path::PathBuf;

use clap::Parser;
use duet_agent::DuetConfig;

/// Duet -- a Director agent plans, an Actor agent executes.
#[derive(Debug, Parser)]
#[command(
    name = "duet",
    version,
    about = "Duet -- two agents, one task",
    long_about = "Runs a planning agent (the Director) and an executing agent (the Actor) \
                  on one task.  The Director delegates with `Tell worker:` and finishes \
                  with `DONE`.  Press Ctrl-C to pause and give an instruction."
)]
pub struct Cli {
    /// The task to hand to the Director.
    #[arg(required = true, num_args = 1..)]
    pub instruction: Vec<String>,

    /// Directory the built-in tools operate in.
    #[arg(long, short = 'C', default_value = ".")]
    pub workdir: PathBuf,

    /// Maximum Director rounds before giving up.
    #[arg(long)]
    pub max_rounds: Option<u32>,

    /// Seconds without stream progress before a turn is cut off.
    #[arg(long)]
    pub inactivity_timeout: Option<u64>,

    /// Model for the Director (`opus`, `sonnet`, `haiku` or a concrete id).
    #[arg(long)]
    pub director_model: Option<String>,

    /// Model for the Actor.
    #[arg(long)]
    pub actor_model: Option<String>,

    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, default_value = "duet.toml")]
    pub config: PathBuf,

    /// Append a JSON-lines transcript to this file.
    #[arg(long)]
    pub transcript: Option<PathBuf>,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// The instruction words joined back into one task.
    pub fn task(&self) -> String {
        self.instruction.join(" ")
    }

    /// Apply command-line overrides on top of file and environment settings.
    pub fn apply_to(&self, config: &mut DuetConfig) {
        if let Some(rounds) = self.max_rounds {
            config.limits.max_rounds = rounds;
        }
        if let Some(secs) = self.inactivity_timeout {
            config.director.inactivity_timeout_secs = secs;
            config.actor.inactivity_timeout_secs = secs;
        }
        if let Some(model) = &self.director_model {
            config.director.model = model.clone();
        }
        if let Some(model) = &self.actor_model {
            config.actor.model = model.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_words_are_joined() {
        let cli = Cli::parse_from(["duet", "create", "file", "foo.txt"]);
        assert_eq!(cli.task(), "create file foo.txt");
        assert_eq!(cli.workdir, PathBuf::from("."));
        assert!(!cli.verbose);
    }

    #[test]
    fn instruction_is_required() {
        assert!(Cli::try_parse_from(["duet"]).is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from([
            "duet",
            "--max-rounds",
            "4",
            "--inactivity-timeout",
            "9",
            "--actor-model",
            "haiku",
            "do it",
        ]);
        let mut config = DuetConfig::default();
        cli.apply_to(&mut config);

        assert_eq!(config.limits.max_rounds, 4);
        assert_eq!(config.director.inactivity_timeout_secs, 9);
        assert_eq!(config.actor.inactivity_timeout_secs, 9);
        assert_eq!(config.actor.model, "haiku");
        assert_eq!(config.director.model, "opus");
    }
}
