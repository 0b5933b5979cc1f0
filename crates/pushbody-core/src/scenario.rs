//! Declarative producer scenarios.
//!
//! A scenario is a TOML document naming a payload, a producer
//! configuration, a consumer behavior, and an ordered list of steps. Running
//! it drives a [`ChunkedProducer`] against a [`RecordingConsumer`] and yields
//! a [`Transcript`].
//!
//! ```toml
//! name = "ten bytes by four"
//!
//! [payload]
//! text = "0123456789"
//!
//! [producer]
//! chunk_size = 4
//! delivery = "synchronous"
//!
//! [consumer]
//! kind = "immediate"
//!
//! [[steps]]
//! op = "register"
//!
//! [[steps]]
//! op = "send_all"
//! ```

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, DeliveryMode, ProducerConfig};
use crate::error::ProtocolError;
use crate::producer::{CancelHandle, ChunkedProducer, Phase};
use crate::recorder::{BodyEvent, ConsumerBehavior, RecordingConsumer};

const DEFAULT_WAIT_MS: u64 = 5_000;

/// How long `run` waits for a scheduled auto-drain before snapshotting.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize scenario: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid producer config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Payload description. `text` and `size` are mutually exclusive; with
/// neither, the payload is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadSpec {
    pub text: Option<String>,
    /// Number of generated bytes.
    pub size: Option<usize>,
    /// Byte to repeat `size` times. Without it the bytes count 0..=255 and
    /// wrap.
    pub fill: Option<u8>,
}

impl PayloadSpec {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn sized(size: usize) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, ScenarioError> {
        match (&self.text, self.size, self.fill) {
            (Some(_), Some(_), _) => Err(ScenarioError::InvalidPayload(
                "`text` and `size` are mutually exclusive".to_string(),
            )),
            (Some(_), None, Some(_)) | (None, None, Some(_)) => Err(
                ScenarioError::InvalidPayload("`fill` requires `size`".to_string()),
            ),
            (Some(text), None, None) => Ok(Bytes::from(text.clone())),
            (None, Some(size), Some(fill)) => Ok(Bytes::from(vec![fill; size])),
            (None, Some(size), None) => Ok((0..size).map(|i| i as u8).collect()),
            (None, None, None) => Ok(Bytes::new()),
        }
    }
}

/// One scripted interaction with the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Register,
    SendChunk,
    SendAll,
    SignalComplete,
    RaiseError {
        message: String,
    },
    Cancel,
    /// Wait for the consumer to record a completion or error, e.g. after an
    /// auto-drain was scheduled.
    WaitForTerminal {
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
}

fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_MS
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Register => "register",
            Step::SendChunk => "send_chunk",
            Step::SendAll => "send_all",
            Step::SignalComplete => "signal_complete",
            Step::RaiseError { .. } => "raise_error",
            Step::Cancel => "cancel",
            Step::WaitForTerminal { .. } => "wait_for_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub payload: PayloadSpec,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerBehavior,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub op: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Chunk { offset: usize, len: usize },
    Error { message: String },
    Complete,
}

/// Everything observed while running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub scenario: String,
    pub steps: Vec<StepOutcome>,
    pub events: Vec<TranscriptEvent>,
    pub payload_len: usize,
    pub cursor: usize,
    pub chunks_sent: usize,
    pub exhausted: bool,
    pub cancelled: bool,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_drain_error: Option<String>,
    /// False when a scheduled auto-drain was still running at snapshot time.
    pub drain_settled: bool,
    /// Delivered bytes, concatenated, equal the payload.
    pub body_matches_payload: bool,
}

impl Transcript {
    /// No step failed and the background drain, if any, finished cleanly.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.ok) && self.auto_drain_error.is_none() && self.drain_settled
    }

    pub fn chunk_lens(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TranscriptEvent::Chunk { len, .. } => Some(*len),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, TranscriptEvent::Complete))
            .count()
    }
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.producer.validate()?;
        scenario.payload.to_bytes()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ScenarioError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A minimal scenario: register, send one chunk, drain the rest.
    pub fn scaffold(name: &str) -> Self {
        Scenario {
            name: name.to_string(),
            payload: PayloadSpec::text("hello, pushbody"),
            producer: ProducerConfig::new(4, DeliveryMode::Synchronous, false),
            consumer: ConsumerBehavior::Immediate,
            steps: vec![Step::Register, Step::SendChunk, Step::SendAll],
        }
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// A scheduled auto-drain is allowed to finish before the transcript is
    /// taken, so its chunks and completion are always included.
    pub fn run(&self) -> Result<Transcript, ScenarioError> {
        self.producer.validate()?;
        let payload = self.payload.to_bytes()?;
        let producer = ChunkedProducer::new(payload.clone(), self.producer.clone());
        let consumer = RecordingConsumer::new(self.consumer.clone());
        let mut cancel: Option<CancelHandle> = None;
        let mut steps = Vec::with_capacity(self.steps.len());

        info!(scenario = %self.name, steps = self.steps.len(), "running scenario");

        for step in &self.steps {
            let result = self.apply(step, &producer, &consumer, &mut cancel);
            let ok = result.is_ok();
            if let Err(e) = &result {
                warn!(scenario = %self.name, op = step.op(), error = %e, "step failed, stopping");
            }
            steps.push(StepOutcome {
                op: step.op().to_string(),
                ok,
                error: result.err(),
            });
            if !ok {
                break;
            }
        }

        let drain_settled = producer.wait_auto_drain(SETTLE_TIMEOUT);
        if !drain_settled {
            warn!(scenario = %self.name, "auto-drain still running after {SETTLE_TIMEOUT:?}");
        }

        Ok(Transcript {
            scenario: self.name.clone(),
            steps,
            events: transcript_events(&consumer.events()),
            payload_len: payload.len(),
            cursor: producer.cursor(),
            chunks_sent: producer.chunks_sent(),
            exhausted: producer.is_exhausted(),
            cancelled: producer.is_cancelled(),
            phase: producer.phase(),
            auto_drain_error: producer.auto_drain_error().map(|e| e.to_string()),
            drain_settled,
            body_matches_payload: consumer.body() == payload,
        })
    }

    fn apply(
        &self,
        step: &Step,
        producer: &ChunkedProducer,
        consumer: &RecordingConsumer,
        cancel: &mut Option<CancelHandle>,
    ) -> Result<(), String> {
        let result = match step {
            Step::Register => consumer.register_with(producer).map(|handle| {
                *cancel = Some(handle);
            }),
            Step::SendChunk => producer.send_chunk(),
            Step::SendAll => producer.send_all(),
            Step::SignalComplete => producer.signal_complete(),
            Step::RaiseError { message } => producer.raise_error(anyhow::Error::msg(message.clone())),
            Step::Cancel => match cancel {
                Some(handle) => {
                    handle.cancel();
                    Ok(())
                }
                None => Err(ProtocolError::NotRegistered),
            },
            Step::WaitForTerminal { timeout_ms } => {
                if consumer.wait_for_terminal(Duration::from_millis(*timeout_ms)) {
                    Ok(())
                } else {
                    return Err(format!("no completion or error within {timeout_ms} ms"));
                }
            }
        };
        result.map_err(|e| e.to_string())
    }
}

fn transcript_events(events: &[BodyEvent]) -> Vec<TranscriptEvent> {
    let mut offset = 0;
    events
        .iter()
        .map(|event| match event {
            BodyEvent::Chunk(chunk) => {
                let entry = TranscriptEvent::Chunk {
                    offset,
                    len: chunk.len(),
                };
                offset += chunk.len();
                entry
            }
            BodyEvent::Error(message) => TranscriptEvent::Error {
                message: message.clone(),
            },
            BodyEvent::Complete => TranscriptEvent::Complete,
        })
        .collect()
}

/// Render a transcript for terminal output.
pub fn format_transcript(transcript: &Transcript) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "scenario: {}", transcript.scenario);
    let _ = writeln!(out, "steps:");
    for step in &transcript.steps {
        match &step.error {
            None => {
                let _ = writeln!(out, "  ✓ {}", step.op);
            }
            Some(e) => {
                let _ = writeln!(out, "  ✗ {}: {e}", step.op);
            }
        }
    }
    let _ = writeln!(out, "events:");
    for event in &transcript.events {
        let _ = match event {
            TranscriptEvent::Chunk { offset, len } => {
                writeln!(out, "  chunk  [{offset}..{})", offset + len)
            }
            TranscriptEvent::Error { message } => writeln!(out, "  error  {message}"),
            TranscriptEvent::Complete => writeln!(out, "  complete"),
        };
    }
    let _ = writeln!(
        out,
        "cursor {}/{} · {} chunk(s) · phase {}{}",
        transcript.cursor,
        transcript.payload_len,
        transcript.chunks_sent,
        transcript.phase,
        if transcript.cancelled { " · cancelled" } else { "" },
    );
    if let Some(e) = &transcript.auto_drain_error {
        let _ = writeln!(out, "auto-drain failed: {e}");
    }
    if !transcript.drain_settled {
        let _ = writeln!(out, "auto-drain still running");
    }
    let _ = writeln!(
        out,
        "body {}",
        if transcript.body_matches_payload {
            "matches payload"
        } else {
            "differs from payload"
        }
    );
    out
}
