//! Session transcripts.
//!
//! A transcript is a JSON-lines file of records shaped
//! `{"type": ..., "payload": ..., "timestamp": ...}` where `type` is one of
//! `directorMessage`, `actorMessage`, `systemBoundary`, or `metadata`.
//!
//! A boundary record carries the full compacted history, so a session can be
//! restored from its latest boundary plus the messages logged after it,
//! without replaying anything from before the compaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::compaction::BoundaryMarker;
use crate::error::Result;
use crate::llm::types::{AgentRole, Message};

/// The kind of a transcript record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    DirectorMessage,
    ActorMessage,
    SystemBoundary,
    Metadata,
}

impl RecordKind {
    fn message_kind(role: AgentRole) -> Self {
        match role {
            AgentRole::Director => Self::DirectorMessage,
            AgentRole::Actor => Self::ActorMessage,
        }
    }
}

/// One line of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `systemBoundary` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryRecord {
    pub role: AgentRole,
    pub marker: BoundaryMarker,
    /// The history installed by the compaction.
    pub history: Vec<Message>,
}

impl TranscriptRecord {
    /// A message appended to a role's history.
    pub fn message(role: AgentRole, message: &Message) -> Result<Self> {
        Ok(Self {
            kind: RecordKind::message_kind(role),
            payload: serde_json::to_value(message)?,
            timestamp: Utc::now(),
        })
    }

    /// A compaction of a role's history.
    pub fn boundary(role: AgentRole, marker: &BoundaryMarker, history: &[Message]) -> Result<Self> {
        let record = BoundaryRecord {
            role,
            marker: marker.clone(),
            history: history.to_vec(),
        };
        Ok(Self {
            kind: RecordKind::SystemBoundary,
            payload: serde_json::to_value(record)?,
            timestamp: marker.timestamp,
        })
    }

    /// Free-form run metadata.
    pub fn metadata(payload: Value) -> Self {
        Self {
            kind: RecordKind::Metadata,
            payload,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Appends records to a transcript file.
#[derive(Debug)]
pub struct TranscriptWriter {
    path: PathBuf,
    file: tokio::fs::File,
}

impl TranscriptWriter {
    /// Open (or create) a transcript for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "transcript opened");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it.
    pub async fn append(&mut self, record: &TranscriptRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read every record of a transcript.
///
/// Lines that do not parse (for example a final line cut short by a crash)
/// are skipped with a warning.
pub async fn read_transcript(path: impl AsRef<Path>) -> Result<Vec<TranscriptRecord>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();

    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "skipping malformed transcript line"
            ),
        }
    }
    Ok(records)
}

/// Rebuild one role's history from a transcript.
///
/// Starts from the history stored in the role's latest boundary (or empty
/// when there is none) and appends the role's messages logged after it.
pub fn restore_history(records: &[TranscriptRecord], role: AgentRole) -> Result<Vec<Message>> {
    let message_kind = RecordKind::message_kind(role);

    let mut start = 0;
    let mut history = Vec::new();
    for (index, record) in records.iter().enumerate().rev() {
        if record.kind != RecordKind::SystemBoundary {
            continue;
        }
        let boundary: BoundaryRecord = serde_json::from_value(record.payload.clone())?;
        if boundary.role == role {
            history = boundary.history;
            start = index + 1;
            break;
        }
    }

    for record in &records[start..] {
        if record.kind == message_kind {
            history.push(serde_json::from_value(record.payload.clone())?);
        }
    }
    Ok(history)
}
