//! pushbody-core: a deterministic push-style body producer.
//!
//! Provides [`ChunkedProducer`], a fixture that pushes a fixed payload to a
//! registered consumer in bounded chunks. It exists to drive body-consuming
//! code through every legal and illegal interaction of the producer/consumer
//! contract under repeatable conditions.
//!
//! # Contract
//!
//! ```text
//! register(on_chunk, on_error, on_complete) -> cancel handle
//!   on_chunk(bytes, continuation?) -> "will resume the continuation later"
//!   on_error(error)
//!   on_complete()
//! ```
//!
//! - Synchronous delivery offers no continuation and the consumer must
//!   return `false`.
//! - Continuation delivery offers a single-use [`Continuation`]; returning
//!   `true` suspends the drain until it is resumed.
//! - A full drain delivers the payload in order, without gaps or overlap,
//!   then signals completion exactly once.
//!
//! # Layout
//!
//! ```text
//! producer   ChunkedProducer, CancelHandle, BodyDelegate
//! signal     Continuation / readiness rendezvous
//! spawn      Spawn seam for auto-drain (thread, tokio blocking pool)
//! config     ProducerConfig (TOML)
//! recorder   RecordingConsumer for tests
//! scenario   TOML scenarios -> Transcript
//! ```

pub mod config;
pub mod error;
pub mod producer;
pub mod recorder;
pub mod scenario;
pub mod signal;
pub mod spawn;

pub use config::{ConfigError, DeliveryMode, ProducerConfig, DEFAULT_CHUNK_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use producer::{
    BodyDelegate, CancelHandle, ChunkFn, ChunkedProducer, CompleteFn, ErrorFn, Phase,
};
pub use recorder::{BodyEvent, ConsumerBehavior, RecordingConsumer};
pub use scenario::{
    format_transcript, PayloadSpec, Scenario, ScenarioError, Step, StepOutcome, Transcript,
    TranscriptEvent,
};
pub use signal::Continuation;
pub use spawn::{Spawn, Task, ThreadSpawner, TokioSpawner};
