//! Commands the operator can type while a run is paused.

pub const HELP: &str = "  /grant <tool>   let the actor use a tool (from its next turn)
  /revoke <tool>  take a tool away from the actor
  /reset          clear the actor's history
  /status         show round, token estimates and actor tools
  /abort          stop the run
  anything else   resume with that text as an instruction (empty line just resumes)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Resume(String),
    Grant(String),
    Revoke(String),
    ResetActor,
    Status,
    Help,
    Abort,
    Unknown(String),
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            return Self::Resume(line.to_owned());
        };

        let mut words = command.split_whitespace();
        let name = words.next().unwrap_or_default();
        let arg = words.next().map(str::to_owned);
        match (name, arg) {
            ("grant", Some(tool)) => Self::Grant(tool),
            ("revoke", Some(tool)) => Self::Revoke(tool),
            ("reset", None) => Self::ResetActor,
            ("status", None) => Self::Status,
            ("help", _) => Self::Help,
            ("abort" | "quit", None) => Self::Abort,
            _ => Self::Unknown(line.to_owned()),
        }
    }
}
