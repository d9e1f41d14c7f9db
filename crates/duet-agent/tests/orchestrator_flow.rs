//! End-to-end orchestrator tests.
//!
//! A scripted provider answers both roles from one queue, in the order the
//! strictly alternating protocol asks: Director, Actor, Director, ...

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

use common::{MemoryFs, SHORT, ScriptedProvider, drain, fast_config, orchestrator};
use duet_agent::llm::ModelFamily;
use duet_agent::llm::assembler::StreamSinks;
use duet_agent::orchestrator::{OrchestratorEvent, OrchestratorState, RunOutcome};
use duet_agent::transcript::{RecordKind, TranscriptWriter, read_transcript, restore_history};
use duet_agent::{AgentError, AgentRole, ModelRegistry};

// ── delegation ───────────────────────────────────────────────────────────────

/// `Tell worker: create file foo.txt` delegates, the Actor writes the file
/// through a tool, and its reply reaches the Director as `Worker says: ...`.
#[tokio::test]
async fn delegation_runs_actor_and_relays_reply() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: create file foo.txt")
        .tool_call("tc_1", "write_file", json!({"path": "foo.txt", "content": "hi"}))
        .text("Created foo.txt")
        .text("Verified.\nDONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    let outcome = orch.run("Create foo.txt containing hi").await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Finished {
            rounds: 2,
            summary: "Verified.\nDONE".into(),
        }
    );
    assert_eq!(orch.state(), OrchestratorState::Finished);
    assert_eq!(fs.get("foo.txt").as_deref(), Some("hi"));

    let actor = orch.actor().history();
    assert_eq!(actor[0].text(), "create file foo.txt");
    assert_eq!(actor.len(), 4);

    let director = orch.director().history();
    assert_eq!(director.len(), 4);
    assert_eq!(director[2].text(), "Worker says: Created foo.txt");

    let requests = provider.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests[1].system.as_deref(),
        Some(duet_agent::orchestrator::ACTOR_PROMPT)
    );
    assert_eq!(requests[0].model, ModelRegistry::with_fallbacks().resolve("opus"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::DirectiveParsed { directive: "delegate", .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::ToolCompleted { role: AgentRole::Actor, is_error: false, .. }
    )));
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::Finished { rounds: 2 })
    ));
    assert!(orch.usage(AgentRole::Actor).output_tokens > 0);
}

/// A second delegation continues the Actor's existing conversation.
#[tokio::test]
async fn second_delegation_continues_actor_context() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: step a")
        .text("did a")
        .text("Tell worker: step b")
        .text("did b")
        .text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    orch.run("two steps").await.unwrap();

    assert_eq!(orch.actor().history().len(), 4);
    let labels: Vec<&str> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::DirectiveParsed { directive, .. } => Some(directive),
            _ => None,
        })
        .collect();
    assert_eq!(labels, vec!["delegate", "continueActor", "finished"]);

    // The Actor's second request carried its first exchange.
    assert_eq!(provider.requests()[3].messages.len(), 3);
}

/// A model hint selects the Actor's model for that turn only.
#[tokio::test]
async fn model_hint_selects_actor_model_for_one_turn() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: [haiku] list files")
        .text("a.txt")
        .text("Tell worker: thanks, now summarize")
        .text("one file")
        .text("DONE");

    let (mut orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    orch.run("list").await.unwrap();

    let registry = ModelRegistry::with_fallbacks();
    let requests = provider.requests();
    assert_eq!(requests[1].model, registry.family_id(ModelFamily::Haiku));
    assert_eq!(requests[1].messages[0].text(), "list files");
    assert_eq!(requests[3].model, registry.resolve("sonnet"));
}

// ── correction ───────────────────────────────────────────────────────────────

/// Prose without a marker is re-prompted before anything reaches the Actor.
#[tokio::test]
async fn prose_without_marker_is_corrected_before_any_relay() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("The codebase looks layered. Storage is the next thing to examine.")
        .text("Tell worker: open the storage module")
        .text("opened")
        .text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    let outcome = orch.run("review storage").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 3, .. }));

    let director = orch.director().history();
    assert!(director[2].text().contains("neither a delegation nor a completion marker"));

    // The second request still went to the Director.
    let requests = provider.requests();
    assert_eq!(requests[1].system, requests[0].system);
    assert_eq!(requests[1].messages.len(), 3);

    let events = drain(&mut rx);
    let correction = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::CorrectionIssued { attempt: 1, .. }))
        .unwrap();
    let first_actor_turn = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::TurnCompleted { role: AgentRole::Actor, .. }))
        .unwrap();
    assert!(correction < first_actor_turn);
}

/// A Director that stays ambiguous past the limit ends the run.
#[tokio::test]
async fn ambiguity_past_limit_is_fatal() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider.text("thinking").text("still thinking");

    let mut config = fast_config();
    config.limits.max_consecutive_corrections = 1;
    let (mut orch, mut rx) = orchestrator(&provider, &fs, &config);

    let err = orch.run("task").await.unwrap_err();
    assert!(matches!(err, AgentError::DirectiveAmbiguous { corrections: 1 }));
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Failed { .. }))
    );
}

// ── limits and failures ──────────────────────────────────────────────────────

/// The round ceiling stops the run without `DONE`.
#[tokio::test]
async fn round_limit_ends_run() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider.text("Tell worker: x").text("ok");

    let mut config = fast_config();
    config.limits.max_rounds = 1;
    let (mut orch, mut rx) = orchestrator(&provider, &fs, &config);

    assert_eq!(
        orch.run("task").await.unwrap(),
        RunOutcome::RoundLimit { rounds: 1 }
    );
    assert_eq!(provider.remaining(), 0);
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::RoundLimitReached { rounds: 1 }))
    );

    // A finished orchestrator does not start another task.
    assert!(matches!(
        orch.run("again").await,
        Err(AgentError::InvalidState { .. })
    ));
}

/// Provider retries exhausted on the Director is fatal.
#[tokio::test]
async fn exhausted_retries_stop_the_run() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    for _ in 0..4 {
        provider.fail(503);
    }

    let (mut orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    let err = orch.run("task").await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::ProviderRetriesExhausted {
            role: AgentRole::Director,
            attempts: 4,
            ..
        }
    ));
    assert_eq!(orch.state(), OrchestratorState::Finished);
}

/// A stalled Actor is relayed as a timeout with its partial output.
#[tokio::test]
async fn actor_timeout_is_relayed_with_partial_output() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: run the tests")
        .hang("Running 40 tests")
        .text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    let outcome = orch.run("test it").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 2, .. }));

    let relay = orch.director().history()[2].text();
    assert!(
        relay.starts_with("Worker attempted: run the tests but timed out after 1s"),
        "{relay}"
    );
    assert!(relay.ends_with("Partial output:\nRunning 40 tests"));
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        OrchestratorEvent::TurnTimedOut { role: AgentRole::Actor, .. }
    )));
}

/// A Director cut off after its marker still delegates, flagged as cut off.
#[tokio::test]
async fn director_timeout_with_marker_still_delegates() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .hang("Tell worker: check the logs")
        .text("logs are clean")
        .text("DONE");

    let (mut orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    orch.run("inspect").await.unwrap();

    let instruction = orch.actor().history()[0].text();
    assert!(instruction.starts_with("check the logs"));
    assert!(instruction.contains("cut off by a timeout"));
}

/// A Director cut off before any marker is re-prompted.
#[tokio::test]
async fn director_timeout_without_marker_reprompts() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider.hang("Let me think about").text("DONE");

    let (mut orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    let outcome = orch.run("think").await.unwrap();

    assert!(matches!(outcome, RunOutcome::Finished { rounds: 2, .. }));
    assert!(!orch.actor().has_context());
    assert!(orch.director().history()[2].text().contains("timed out after 1s"));
}

/// A cut-off `DONE` is not trusted, and no directive is reported for it.
#[tokio::test]
async fn director_timeout_with_partial_done_reports_no_directive() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider.hang("Checked everything.\nDONE").text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    let outcome = orch.run("check").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 2, .. }));

    let parsed: Vec<u32> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::DirectiveParsed { round, .. } => Some(*round),
            _ => None,
        })
        .collect();
    assert_eq!(parsed, vec![2]);
}

// ── compaction ───────────────────────────────────────────────────────────────

fn long_task() -> String {
    "Refactor the storage layer so every query goes through one connection pool. ".repeat(5)
}

/// An over-budget Director is compacted before its next turn.
#[tokio::test]
async fn director_is_compacted_before_next_turn() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: list the files")
        .text("ok")
        .summary("1. Primary Request and Intent: refactor storage")
        .text("DONE");

    let mut config = fast_config();
    config.budget.context_window = 125;
    let (mut orch, mut rx) = orchestrator(&provider, &fs, &config);
    orch.run(long_task()).await.unwrap();

    let director = orch.director().history();
    assert_eq!(director.len(), 3);
    assert!(director[0].text().contains("refactor storage"));
    assert_eq!(director[1].text(), "Worker says: ok");
    assert_eq!(orch.director().boundaries().len(), 1);
    assert!(orch.actor().boundaries().is_empty());

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        OrchestratorEvent::CompactionApplied { role: AgentRole::Director, .. }
    )));
}

/// A pause during the summary call abandons it at once; the history stays
/// uncompacted until the run resumes.
#[tokio::test]
async fn pause_during_compaction_is_prompt() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: list the files")
        .text("ok")
        .slow_summary(
            "1. Primary Request and Intent: refactor storage",
            Duration::from_secs(5),
        )
        .text("DONE");

    let mut config = fast_config();
    config.budget.context_window = 125;
    let (mut orch, mut rx) = orchestrator(&provider, &fs, &config);
    let handle = orch.pause_handle();
    tokio::spawn(async move {
        tokio::time::sleep(SHORT).await;
        handle.pause();
    });

    let started = Instant::now();
    let outcome = orch.run(long_task()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(outcome, RunOutcome::Paused { role: AgentRole::Director });
    assert!(orch.director().boundaries().is_empty());
    assert_eq!(orch.director().history().len(), 3);
    assert_eq!(orch.director().history()[2].text(), "Worker says: ok");
    assert_eq!(provider.remaining(), 1);

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::CompactionApplied { .. } | OrchestratorEvent::CompactionFailed { .. }
    )));

    // Resuming retries the compaction, which now completes.
    let outcome = orch.resume("").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 2, .. }));
    assert_eq!(orch.director().boundaries().len(), 1);
    assert!(orch.director().history()[0].text().contains("refactor storage"));
}

/// A failed compaction is reported and the run continues uncompacted.
#[tokio::test]
async fn failed_compaction_keeps_full_history() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: list the files")
        .text("ok")
        .summary_failure(500)
        .text("DONE");

    let mut config = fast_config();
    config.budget.context_window = 125;
    let (mut orch, mut rx) = orchestrator(&provider, &fs, &config);
    let outcome = orch.run(long_task()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Finished { .. }));
    let director = orch.director().history();
    assert_eq!(director.len(), 4);
    assert_eq!(director[0].text(), long_task());
    assert!(orch.director().boundaries().is_empty());
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        OrchestratorEvent::CompactionFailed { role: AgentRole::Director, .. }
    )));
}

// ── permissions ──────────────────────────────────────────────────────────────

/// A revoked tool fails inside the conversation and the run still finishes.
#[tokio::test]
async fn revoked_actor_tool_fails_without_ending_run() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: create file foo.txt")
        .tool_call("tc_1", "write_file", json!({"path": "foo.txt", "content": "hi"}))
        .text("I may not write files.")
        .text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    orch.revoke_actor_tool("write_file").unwrap();
    assert!(orch.actor().permissions().allows("write_file"));
    assert!(!orch.actor().effective_permissions().allows("write_file"));

    let outcome = orch.run("write it").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { .. }));
    assert!(fs.get("foo.txt").is_none());
    assert!(!orch.actor().permissions().allows("write_file"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::ToolCompleted { role: AgentRole::Actor, is_error: true, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::PermissionsChanged { granted: false, .. }
    )));
}

/// Grants are limited to tools the Director itself holds.
#[tokio::test]
async fn grant_requires_director_permission() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();

    let mut config = fast_config();
    config.director.tools = vec!["read_file".into()];
    config.actor.tools = vec!["read_file".into()];
    let (mut orch, _rx) = orchestrator(&provider, &fs, &config);

    assert!(matches!(
        orch.grant_actor_tool("write_file"),
        Err(AgentError::PermissionChangeRejected { .. })
    ));
    assert!(matches!(
        orch.grant_actor_tool("no_such_tool"),
        Err(AgentError::PermissionChangeRejected { .. })
    ));

    orch.revoke_actor_tool("read_file").unwrap();
    orch.grant_actor_tool("read_file").unwrap();
    assert!(orch.actor().effective_permissions().allows("read_file"));
}

// ── pause and resume ─────────────────────────────────────────────────────────

/// Pausing before the Director speaks, then resuming with an instruction,
/// threads the instruction into the Director's next turn.
#[tokio::test]
async fn paused_director_resumes_with_operator_instruction() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider.text("DONE");

    let (mut orch, mut rx) = orchestrator(&provider, &fs, &fast_config());
    orch.pause_handle().pause();

    let outcome = orch.run("task").await.unwrap();
    assert_eq!(outcome, RunOutcome::Paused { role: AgentRole::Director });
    assert_eq!(orch.state(), OrchestratorState::Paused);
    assert!(provider.requests().is_empty());

    let outcome = orch.resume("focus on the tests").await.unwrap();
    // The interrupted turn did not use up a round.
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 1, .. }));

    let request = provider.requests().pop().unwrap();
    let last = request.messages.last().unwrap().text();
    assert!(last.contains("focus on the tests"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Paused { role: AgentRole::Director })));
    assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Resumed { .. })));
}

/// Pausing mid-stream on the Actor keeps its partial reply and resumes the
/// Actor itself.
#[tokio::test]
async fn paused_actor_resumes_in_actor_session() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: build it")
        .text("Starting the build now")
        .text("Build finished")
        .text("DONE");

    let (orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    let handle = orch.pause_handle();
    let fired = Arc::new(AtomicBool::new(false));
    let sink_fired = fired.clone();
    let mut orch = orch.with_sinks(
        AgentRole::Actor,
        StreamSinks::none().with_text(move |_| {
            if !sink_fired.swap(true, Ordering::SeqCst) {
                handle.pause();
            }
        }),
    );

    let outcome = orch.run("build").await.unwrap();
    assert_eq!(outcome, RunOutcome::Paused { role: AgentRole::Actor });
    assert_eq!(orch.actor().history().last().unwrap().text(), "Starting ");

    // A new task cannot start while paused.
    assert!(matches!(
        orch.run("again").await,
        Err(AgentError::InvalidState { .. })
    ));

    let outcome = orch.resume("").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { rounds: 2, .. }));
    assert_eq!(
        orch.director().history()[2].text(),
        "Worker says: Build finished"
    );
}

/// `resume` is only valid while paused.
#[tokio::test]
async fn resume_requires_pause() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    let (mut orch, _rx) = orchestrator(&provider, &fs, &fast_config());

    assert!(matches!(
        orch.resume("x").await,
        Err(AgentError::InvalidState { .. })
    ));
}

// ── transcript ───────────────────────────────────────────────────────────────

/// Every message and tool call lands in the transcript, and the Director's
/// history can be rebuilt from it.
#[tokio::test]
async fn transcript_records_run_and_restores_history() {
    let provider = ScriptedProvider::new();
    let fs = MemoryFs::new();
    provider
        .text("Tell worker: create file foo.txt")
        .tool_call("tc_1", "write_file", json!({"path": "foo.txt", "content": "hi"}))
        .text("Created foo.txt")
        .text("DONE");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");
    let writer = TranscriptWriter::open(&path).await.unwrap();

    let (orch, _rx) = orchestrator(&provider, &fs, &fast_config());
    let mut orch = orch.with_transcript(writer);
    orch.run("make foo").await.unwrap();

    let records = read_transcript(&path).await.unwrap();
    assert_eq!(records[0].kind, RecordKind::Metadata);
    assert_eq!(records[0].payload["task"], "make foo");

    let tool_record = records
        .iter()
        .find(|r| r.kind == RecordKind::Metadata && r.payload["event"] == "toolCall")
        .unwrap();
    assert_eq!(tool_record.payload["tool"], "write_file");
    assert_eq!(tool_record.payload["output"], "wrote 2 bytes to foo.txt");
    assert_eq!(tool_record.payload["role"], "actor");

    assert_eq!(
        restore_history(&records, AgentRole::Director).unwrap(),
        orch.director().history()
    );
    assert_eq!(
        restore_history(&records, AgentRole::Actor).unwrap(),
        orch.actor().history()
    );
}
