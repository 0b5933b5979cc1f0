//! A recording consumer for driving producers in tests.
//!
//! [`RecordingConsumer`] plays the consumer side of the body contract with a
//! configurable acknowledgement [`ConsumerBehavior`] and keeps an ordered log
//! of everything it received.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProtocolResult;
use crate::producer::{CancelHandle, ChunkFn, ChunkedProducer, CompleteFn, ErrorFn};
use crate::signal::Continuation;

/// How the consumer acknowledges each chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsumerBehavior {
    /// Return `false`: fully synchronous, no continuation will be used.
    #[default]
    Immediate,
    /// Resume the continuation inside the callback, then return `true`.
    ResumeInline,
    /// Return `true` and resume the continuation from another thread after
    /// `delay_ms`.
    ResumeAfter { delay_ms: u64 },
    /// Return `true` and drop the continuation without resuming it.
    BrokenPromise,
}

impl ConsumerBehavior {
    fn acknowledge(&self, continuation: Option<Continuation>) -> bool {
        match (self, continuation) {
            (ConsumerBehavior::BrokenPromise, _) => true,
            (ConsumerBehavior::ResumeInline, Some(continuation)) => {
                continuation.resume();
                true
            }
            (ConsumerBehavior::ResumeAfter { delay_ms }, Some(continuation)) => {
                let delay = Duration::from_millis(*delay_ms);
                thread::spawn(move || {
                    thread::sleep(delay);
                    continuation.resume();
                });
                true
            }
            _ => false,
        }
    }
}

/// One callback invocation observed by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Chunk(Bytes),
    Error(String),
    Complete,
}

impl BodyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BodyEvent::Error(_) | BodyEvent::Complete)
    }
}

#[derive(Default)]
struct Log {
    events: Vec<(Instant, BodyEvent)>,
}

struct Inner {
    behavior: ConsumerBehavior,
    log: Mutex<Log>,
    changed: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: BodyEvent) {
        self.lock().events.push((Instant::now(), event));
        self.changed.notify_all();
    }
}

/// Consumer that records every chunk, error, and completion it receives.
#[derive(Clone)]
pub struct RecordingConsumer {
    inner: Arc<Inner>,
}

impl RecordingConsumer {
    pub fn new(behavior: ConsumerBehavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                behavior,
                log: Mutex::new(Log::default()),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn behavior(&self) -> &ConsumerBehavior {
        &self.inner.behavior
    }

    /// Type-erased callbacks bound to this recorder.
    pub fn callbacks(&self) -> (ChunkFn, ErrorFn, CompleteFn) {
        let on_chunk: ChunkFn = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move |chunk: Bytes, continuation: Option<Continuation>| {
                debug!(len = chunk.len(), "consumer received chunk");
                inner.record(BodyEvent::Chunk(chunk));
                inner.behavior.acknowledge(continuation)
            })
        };
        let on_error: ErrorFn = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move |err: anyhow::Error| inner.record(BodyEvent::Error(err.to_string())))
        };
        let on_complete: CompleteFn = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move || inner.record(BodyEvent::Complete))
        };
        (on_chunk, on_error, on_complete)
    }

    pub fn register_with(&self, producer: &ChunkedProducer) -> ProtocolResult<CancelHandle> {
        let (on_chunk, on_error, on_complete) = self.callbacks();
        producer.register_callbacks(on_chunk, on_error, on_complete)
    }

    pub fn events(&self) -> Vec<BodyEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|(_, event)| match event {
                BodyEvent::Chunk(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    /// All received chunk bytes, concatenated in arrival order.
    pub fn body(&self) -> Vec<u8> {
        self.chunks().concat()
    }

    pub fn completions(&self) -> usize {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|(_, event)| matches!(event, BodyEvent::Complete))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|(_, event)| match event {
                BodyEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Arrival time of each chunk.
    pub fn chunk_instants(&self) -> Vec<Instant> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|(_, event)| matches!(event, BodyEvent::Chunk(_)))
            .map(|(at, _)| *at)
            .collect()
    }

    /// Block until a completion or error has been recorded, or `timeout`
    /// elapses. Returns whether a terminal event was seen.
    pub fn wait_for_terminal(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock();
        let (guard, _) = self
            .inner
            .changed
            .wait_timeout_while(guard, timeout, |log| {
                !log.events.iter().any(|(_, event)| event.is_terminal())
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.events.iter().any(|(_, event)| event.is_terminal())
    }
}

impl std::fmt::Debug for RecordingConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingConsumer")
            .field("behavior", &self.inner.behavior)
            .field("events", &self.inner.lock().events.len())
            .finish()
    }
}
