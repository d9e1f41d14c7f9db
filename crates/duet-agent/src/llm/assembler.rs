//! Stream assembler.
//!
//! Reconstructs one complete [`Message`] from the ordered event stream of a
//! completion call.  Blocks are keyed by their stream index.  Tool-call
//! argument fragments are buffered as plain text and parsed exactly once, at
//! `BlockStop`; a malformed argument payload yields an empty object instead
//! of failing the assembly, so the bad call fails later at dispatch where the
//! agent can see the error.
//!
//! Consumption is strictly sequential and suspends only while awaiting the
//! next event.  Cancellation and the inactivity watchdog both abandon the
//! stream immediately and hand back whatever has been assembled so far.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::provider::EventStream;
use crate::llm::types::{
    BlockKind, ContentBlock, Message, StreamDelta, StreamEvent, ToolCall, Usage,
};

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// A callback receiving streamed chunks as they arrive.
pub type TextSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A callback told that a failed call is about to be retried (1-based).
pub type RetrySink = Arc<dyn Fn(u32) + Send + Sync>;

/// Optional callbacks invoked synchronously for every delta.
#[derive(Clone, Default)]
pub struct StreamSinks {
    /// Receives text deltas.
    pub on_text: Option<TextSink>,
    /// Receives reasoning deltas.
    pub on_reasoning: Option<TextSink>,
    /// Told before a failed call is replayed, so chunks already shown can
    /// be set apart from the replay.
    pub on_retry: Option<RetrySink>,
}

impl StreamSinks {
    /// Sinks that discard everything.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builder: set the text sink.
    pub fn with_text(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_text = Some(Arc::new(sink));
        self
    }

    /// Builder: set the reasoning sink.
    pub fn with_reasoning(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_reasoning = Some(Arc::new(sink));
        self
    }

    /// Builder: set the retry sink.
    pub fn with_retry(mut self, sink: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(sink));
        self
    }

    pub(crate) fn retry(&self, attempt: u32) {
        if let Some(sink) = &self.on_retry {
            sink(attempt);
        }
    }

    fn text(&self, chunk: &str) {
        if let Some(sink) = &self.on_text {
            sink(chunk);
        }
    }

    fn reasoning(&self, chunk: &str) {
        if let Some(sink) = &self.on_reasoning {
            sink(chunk);
        }
    }
}

impl fmt::Debug for StreamSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSinks")
            .field("on_text", &self.on_text.is_some())
            .field("on_reasoning", &self.on_reasoning.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Assembly results
// ---------------------------------------------------------------------------

/// A message reconstructed from a stream, plus its call metadata.
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    /// The assembled agent message.
    pub message: Message,
    /// Usage counters reported by the stream.
    pub usage: Usage,
    /// Why the model stopped, if the stream said so.
    pub stop_reason: Option<String>,
}

/// Why a stream was abandoned before it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The operator (or a caller) cancelled the call.
    Cancelled,
    /// No event arrived within the inactivity timeout.
    InactivityTimeout { idle: Duration },
}

/// The outcome of consuming one event stream.
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Everything assembled so far.  Complete unless `interruption` is set.
    pub assembled: AssembledMessage,
    /// Set when the stream was abandoned early.
    pub interruption: Option<Interruption>,
}

/// Inactivity watchdog settings for one stream.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Abort when no event has been received for this long.
    pub inactivity_timeout: Duration,
    /// How often the watchdog compares the clock against the last activity.
    pub tick: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(120),
            tick: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// In-progress block keyed by stream index.
#[derive(Debug)]
enum BlockBuilder {
    Text(String),
    Reasoning(String),
    ToolCall {
        id: String,
        name: String,
        /// Raw argument fragments, concatenated.
        raw_arguments: String,
        /// Set once `BlockStop` has been seen.
        arguments: Option<Value>,
    },
}

/// Accumulates stream events into a message.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    blocks: BTreeMap<u32, BlockBuilder>,
    usage: Usage,
    stop_reason: Option<String>,
    finished: bool,
}

impl StreamAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `MessageStop` has been applied.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply a single stream event, invoking the sinks for deltas.
    pub fn apply(&mut self, event: StreamEvent, sinks: &StreamSinks) {
        match event {
            StreamEvent::MessageStart { input_tokens, .. } => {
                self.usage.input_tokens = input_tokens;
            }

            StreamEvent::BlockStart { index, kind } => {
                let builder = match kind {
                    BlockKind::Text => BlockBuilder::Text(String::new()),
                    BlockKind::Reasoning => BlockBuilder::Reasoning(String::new()),
                    BlockKind::ToolCall { id, name } => BlockBuilder::ToolCall {
                        id,
                        name,
                        raw_arguments: String::new(),
                        arguments: None,
                    },
                };
                if self.blocks.insert(index, builder).is_some() {
                    warn!(index, "block index restarted, previous content dropped");
                }
            }

            StreamEvent::BlockDelta { index, delta } => self.apply_delta(index, delta, sinks),

            StreamEvent::BlockStop { index } => {
                if let Some(BlockBuilder::ToolCall {
                    name,
                    raw_arguments,
                    arguments,
                    ..
                }) = self.blocks.get_mut(&index)
                {
                    *arguments = Some(parse_arguments(name, raw_arguments));
                }
            }

            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if usage.input_tokens > 0 {
                    self.usage.input_tokens = usage.input_tokens;
                }
                // Output tokens are cumulative in message_delta events.
                self.usage.output_tokens = usage.output_tokens;
            }

            StreamEvent::MessageStop => self.finished = true,

            StreamEvent::Ping => {}
        }
    }

    fn apply_delta(&mut self, index: u32, delta: StreamDelta, sinks: &StreamSinks) {
        // Text-like deltas for an unannounced index open the block
        // implicitly; argument fragments need the tool-call header.
        let block = match (&delta, self.blocks.contains_key(&index)) {
            (_, true) => self.blocks.get_mut(&index),
            (StreamDelta::Text(_), false) => Some(
                self.blocks
                    .entry(index)
                    .or_insert_with(|| BlockBuilder::Text(String::new())),
            ),
            (StreamDelta::Reasoning(_), false) => Some(
                self.blocks
                    .entry(index)
                    .or_insert_with(|| BlockBuilder::Reasoning(String::new())),
            ),
            (StreamDelta::ToolArguments(_), false) => None,
        };

        match (block, delta) {
            (Some(BlockBuilder::Text(buf)), StreamDelta::Text(chunk)) => {
                buf.push_str(&chunk);
                sinks.text(&chunk);
            }
            (Some(BlockBuilder::Reasoning(buf)), StreamDelta::Reasoning(chunk)) => {
                buf.push_str(&chunk);
                sinks.reasoning(&chunk);
            }
            (
                Some(BlockBuilder::ToolCall {
                    raw_arguments,
                    arguments: None,
                    ..
                }),
                StreamDelta::ToolArguments(fragment),
            ) => raw_arguments.push_str(&fragment),
            (_, delta) => {
                warn!(index, ?delta, "delta does not match its block, ignored");
            }
        }
    }

    /// Finish a stream that ran to completion.
    ///
    /// Tool calls whose `BlockStop` never arrived are parsed here so a
    /// provider that omits the stop event still yields usable calls.
    pub fn finish(self) -> AssembledMessage {
        self.build(true)
    }

    /// Finish a stream that was abandoned early.
    ///
    /// Tool calls that never closed are dropped: their argument text is a
    /// fragment and they could never be executed.
    pub fn finish_partial(self) -> AssembledMessage {
        self.build(false)
    }

    fn build(self, complete: bool) -> AssembledMessage {
        let mut content = Vec::with_capacity(self.blocks.len());

        for (index, builder) in self.blocks {
            match builder {
                BlockBuilder::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                }
                BlockBuilder::Reasoning(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Reasoning { text });
                    }
                }
                BlockBuilder::ToolCall {
                    id,
                    name,
                    raw_arguments,
                    arguments,
                } => {
                    let arguments = match arguments {
                        Some(parsed) => parsed,
                        None if complete => parse_arguments(&name, &raw_arguments),
                        None => {
                            debug!(index, tool = %name, "dropping unterminated tool call");
                            continue;
                        }
                    };
                    content.push(ContentBlock::ToolCall(ToolCall {
                        id,
                        name,
                        arguments,
                    }));
                }
            }
        }

        AssembledMessage {
            message: Message::agent(content),
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}

/// Parse concatenated argument fragments; unparsable input becomes `{}`.
fn parse_arguments(tool_name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(tool = tool_name, error = %e, "malformed tool arguments, using empty object");
            Value::Object(Default::default())
        }
    }
}

// ---------------------------------------------------------------------------
// Stream consumption
// ---------------------------------------------------------------------------

/// Consume an event stream into a message.
///
/// Returns `Ok` with a partial assembly when the stream is cancelled or goes
/// quiet for longer than the watchdog allows; the watchdog fires at most once
/// per stream.  Transport errors inside the stream are returned as `Err` and
/// discard the partial content, since the caller retries those calls.
pub async fn assemble(
    mut events: EventStream,
    sinks: &StreamSinks,
    cancel: &CancellationToken,
    watchdog: WatchdogConfig,
) -> Result<Assembly> {
    let mut assembler = StreamAssembler::new();
    let mut last_activity = Instant::now();
    let mut ticker = tokio::time::interval(watchdog.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let interruption = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("stream cancelled, returning partial content");
                break Some(Interruption::Cancelled);
            }

            _ = ticker.tick() => {
                let idle = last_activity.elapsed();
                if idle >= watchdog.inactivity_timeout {
                    warn!(idle_ms = idle.as_millis() as u64, "stream inactivity timeout");
                    break Some(Interruption::InactivityTimeout { idle });
                }
            }

            next = events.next() => match next {
                None => break None,
                Some(Ok(event)) => {
                    last_activity = Instant::now();
                    assembler.apply(event, sinks);
                    if assembler.is_finished() {
                        break None;
                    }
                }
                Some(Err(e)) => return Err(e),
            },
        }
    };

    let assembled = match interruption {
        None => assembler.finish(),
        Some(_) => assembler.finish_partial(),
    };

    Ok(Assembly {
        assembled,
        interruption,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::error::AgentError;

    fn text_delta(index: u32, text: &str) -> StreamEvent {
        StreamEvent::BlockDelta {
            index,
            delta: StreamDelta::Text(text.into()),
        }
    }

    fn args_delta(index: u32, fragment: &str) -> StreamEvent {
        StreamEvent::BlockDelta {
            index,
            delta: StreamDelta::ToolArguments(fragment.into()),
        }
    }

    fn tool_start(index: u32, id: &str, name: &str) -> StreamEvent {
        StreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolCall {
                id: id.into(),
                name: name.into(),
            },
        }
    }

    fn feed(events: Vec<StreamEvent>, sinks: &StreamSinks) -> AssembledMessage {
        let mut assembler = StreamAssembler::new();
        for event in events {
            assembler.apply(event, sinks);
        }
        assembler.finish()
    }

    #[test]
    fn text_is_concatenated_in_order_and_sunk() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink_seen = Arc::clone(&seen);
        let sinks = StreamSinks::none().with_text(move |chunk| {
            sink_seen.lock().unwrap().push_str(chunk);
        });

        let assembled = feed(
            vec![
                StreamEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::Text,
                },
                text_delta(0, "Tell "),
                text_delta(0, "worker: "),
                text_delta(0, "go"),
                StreamEvent::BlockStop { index: 0 },
                StreamEvent::MessageStop,
            ],
            &sinks,
        );

        assert_eq!(assembled.message.text(), "Tell worker: go");
        assert_eq!(*seen.lock().unwrap(), "Tell worker: go");
    }

    #[test]
    fn reasoning_goes_to_its_own_block_and_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sinks = StreamSinks::none().with_reasoning(move |chunk| {
            sink_seen.lock().unwrap().push(chunk.to_owned());
        });

        let assembled = feed(
            vec![
                StreamEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::Reasoning,
                },
                StreamEvent::BlockDelta {
                    index: 0,
                    delta: StreamDelta::Reasoning("step one. ".into()),
                },
                StreamEvent::BlockDelta {
                    index: 0,
                    delta: StreamDelta::Reasoning("step two.".into()),
                },
                StreamEvent::BlockStop { index: 0 },
                StreamEvent::BlockStart {
                    index: 1,
                    kind: BlockKind::Text,
                },
                text_delta(1, "answer"),
                StreamEvent::BlockStop { index: 1 },
            ],
            &sinks,
        );

        assert_eq!(assembled.message.reasoning(), "step one. step two.");
        assert_eq!(assembled.message.text(), "answer");
        assert!(matches!(
            assembled.message.content[0],
            ContentBlock::Reasoning { .. }
        ));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn tool_arguments_parse_once_at_block_stop() {
        let assembled = feed(
            vec![
                tool_start(0, "toolu_1", "write_file"),
                args_delta(0, "{\"pa"),
                args_delta(0, "th\": \"foo.txt\", "),
                args_delta(0, "\"content\": \"hi\"}"),
                StreamEvent::BlockStop { index: 0 },
                StreamEvent::MessageDelta {
                    stop_reason: Some("tool_use".into()),
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: 12,
                    },
                },
            ],
            &StreamSinks::none(),
        );

        let calls = assembled.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(
            calls[0].arguments,
            json!({"path": "foo.txt", "content": "hi"})
        );
        assert_eq!(assembled.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(assembled.usage.output_tokens, 12);
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        let assembled = feed(
            vec![
                tool_start(0, "toolu_1", "run_shell"),
                args_delta(0, "{\"command\": \"ls"),
                StreamEvent::BlockStop { index: 0 },
            ],
            &StreamSinks::none(),
        );

        let calls = assembled.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn empty_argument_text_becomes_empty_object() {
        let assembled = feed(
            vec![
                tool_start(0, "toolu_1", "list_directory"),
                StreamEvent::BlockStop { index: 0 },
            ],
            &StreamSinks::none(),
        );
        assert_eq!(assembled.message.tool_calls()[0].arguments, json!({}));
    }

    #[test]
    fn blocks_are_ordered_by_index_not_arrival() {
        let assembled = feed(
            vec![
                StreamEvent::BlockStart {
                    index: 1,
                    kind: BlockKind::Text,
                },
                StreamEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::Text,
                },
                text_delta(1, "second"),
                text_delta(0, "first "),
            ],
            &StreamSinks::none(),
        );
        assert_eq!(assembled.message.text(), "first second");
    }

    #[test]
    fn partial_finish_drops_unterminated_tool_calls() {
        let mut assembler = StreamAssembler::new();
        let sinks = StreamSinks::none();
        assembler.apply(text_delta(0, "I will write the file"), &sinks);
        assembler.apply(tool_start(1, "toolu_1", "write_file"), &sinks);
        assembler.apply(args_delta(1, "{\"path\""), &sinks);

        let partial = assembler.finish_partial();
        assert_eq!(partial.message.text(), "I will write the file");
        assert!(!partial.message.has_tool_calls());
    }

    #[tokio::test]
    async fn assemble_runs_stream_to_completion() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::MessageStart {
                message_id: "msg_1".into(),
                model: "m".into(),
                input_tokens: 7,
            }),
            Ok(text_delta(0, "hello")),
            Ok(StreamEvent::MessageStop),
            // Anything after MessageStop is not consumed.
            Ok(text_delta(0, " ignored")),
        ];

        let assembly = assemble(
            stream::iter(events).boxed(),
            &StreamSinks::none(),
            &CancellationToken::new(),
            WatchdogConfig::default(),
        )
        .await
        .unwrap();

        assert!(assembly.interruption.is_none());
        assert_eq!(assembly.assembled.message.text(), "hello");
        assert_eq!(assembly.assembled.usage.input_tokens, 7);
    }

    #[tokio::test]
    async fn inactivity_timeout_returns_partial_content() {
        let head = stream::iter(vec![Ok(text_delta(0, "partial answer"))]);
        let events = head.chain(stream::pending()).boxed();

        let assembly = assemble(
            events,
            &StreamSinks::none(),
            &CancellationToken::new(),
            WatchdogConfig {
                inactivity_timeout: Duration::from_millis(50),
                tick: Duration::from_millis(10),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            assembly.interruption,
            Some(Interruption::InactivityTimeout { .. })
        ));
        assert_eq!(assembly.assembled.message.text(), "partial answer");
    }

    #[tokio::test]
    async fn cancellation_returns_partial_content() {
        let head = stream::iter(vec![Ok(text_delta(0, "so far"))]);
        let events = head.chain(stream::pending()).boxed();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let assembly = assemble(
            events,
            &StreamSinks::none(),
            &cancel,
            WatchdogConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(assembly.interruption, Some(Interruption::Cancelled));
        assert_eq!(assembly.assembled.message.text(), "so far");
    }

    #[tokio::test]
    async fn transport_error_is_propagated() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(text_delta(0, "abc")),
            Err(AgentError::ProviderStreamError {
                reason: "connection reset".into(),
            }),
        ];

        let err = assemble(
            stream::iter(events).boxed(),
            &StreamSinks::none(),
            &CancellationToken::new(),
            WatchdogConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(err.is_retryable());
    }
}
