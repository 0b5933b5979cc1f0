//! The chunked body producer.
//!
//! [`ChunkedProducer`] holds a fixed payload and a cursor. A consumer
//! registers three callbacks once; the producer then pushes the payload to
//! it in chunks of at most `chunk_size` bytes, honoring the delivery mode's
//! acknowledgement handshake, and finishes with exactly one completion or
//! error signal per well-formed scenario.
//!
//! # Lifecycle
//!
//! ```text
//! Unregistered --register--> Registered --send_chunk--> Streaming
//! Registered/Streaming --send_all exhausts / signal_complete--> Completed
//! Registered/Streaming --raise_error--> Errored
//! cancel: orthogonal flag, any time after registration
//! ```
//!
//! The two terminal phases do not block each other. Calling both is a
//! caller error that the producer reports faithfully rather than prevents.
//!
//! # Threading
//!
//! The producer is a cheap `Clone` handle over shared state. Delivery is
//! strictly sequential: a single drain path touches the cursor at a time,
//! and the cursor is claimed atomically before the consumer runs, so a
//! re-entrant `send_chunk` from inside `on_chunk` sees the advanced cursor.
//! In continuation mode the driving thread blocks until the consumer
//! resumes, unless it already did. Inside a current-thread Tokio runtime a
//! pending continuation fails with [`ProtocolError::RuntimeBlocked`].

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryMode, ProducerConfig};
use crate::error::{ProtocolError, ProtocolResult};
use crate::signal::{self, Continuation};
use crate::spawn::{Spawn, ThreadSpawner};

/// Chunk callback. Returns `true` when the consumer promises to resume the
/// continuation later.
pub type ChunkFn = Arc<dyn Fn(Bytes, Option<Continuation>) -> bool + Send + Sync>;

/// Error callback. Receives the error passed to [`ChunkedProducer::raise_error`].
pub type ErrorFn = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Completion callback.
pub type CompleteFn = Arc<dyn Fn() + Send + Sync>;

/// A bare body delegate: register callbacks, get a cancellation handle.
pub type BodyDelegate =
    Arc<dyn Fn(ChunkFn, ErrorFn, CompleteFn) -> ProtocolResult<CancelHandle> + Send + Sync>;

/// Observed lifecycle phase of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Unregistered = 0,
    Registered = 1,
    Streaming = 2,
    Completed = 3,
    Errored = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Registered,
            2 => Phase::Streaming,
            3 => Phase::Completed,
            4 => Phase::Errored,
            _ => Phase::Unregistered,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Errored)
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Unregistered => "unregistered",
            Phase::Registered => "registered",
            Phase::Streaming => "streaming",
            Phase::Completed => "completed",
            Phase::Errored => "errored",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Callbacks bound at registration. Written once, read by every send.
struct Callbacks {
    on_chunk: ChunkFn,
    on_error: ErrorFn,
    on_complete: CompleteFn,
}

struct Shared {
    payload: Bytes,
    chunk_size: usize,
    delivery: DeliveryMode,
    auto_drain: bool,
    spawner: Arc<dyn Spawn>,
    callbacks: OnceLock<Callbacks>,
    /// Next undelivered offset. Only ever advances.
    cursor: AtomicUsize,
    chunks_sent: AtomicUsize,
    phase: AtomicU8,
    cancelled: AtomicBool,
    active: AtomicBool,
    auto_drain_error: OnceLock<ProtocolError>,
    drain: DrainGate,
}

/// Progress of the background drain, if one was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Scheduled,
    Finished,
}

struct DrainGate {
    state: Mutex<DrainState>,
    changed: Condvar,
}

impl DrainGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(DrainState::Idle),
            changed: Condvar::new(),
        }
    }

    fn set(&self, state: DrainState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.changed.notify_all();
    }

    fn wait_settled(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| *state == DrainState::Scheduled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard != DrainState::Scheduled
    }
}

impl Shared {
    fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(cursor = self.cursor.load(Ordering::Acquire), "cancellation requested");
        }
    }
}

/// Push-style body producer over a fixed payload.
#[derive(Clone)]
pub struct ChunkedProducer {
    shared: Arc<Shared>,
}

impl ChunkedProducer {
    /// Create a producer whose auto-drain runs on a dedicated thread.
    ///
    /// # Panics
    ///
    /// Panics if `config.chunk_size` is zero.
    pub fn new(payload: impl Into<Bytes>, config: ProducerConfig) -> Self {
        Self::with_spawner(payload, config, Arc::new(ThreadSpawner::named("pushbody-drain")))
    }

    /// Create a producer that schedules auto-drain through `spawner`.
    ///
    /// # Panics
    ///
    /// Panics if `config.chunk_size` is zero.
    pub fn with_spawner(
        payload: impl Into<Bytes>,
        config: ProducerConfig,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        assert!(config.chunk_size > 0, "chunk_size must be > 0");
        Self {
            shared: Arc::new(Shared {
                payload: payload.into(),
                chunk_size: config.chunk_size,
                delivery: config.delivery,
                auto_drain: config.auto_drain,
                spawner,
                callbacks: OnceLock::new(),
                cursor: AtomicUsize::new(0),
                chunks_sent: AtomicUsize::new(0),
                phase: AtomicU8::new(Phase::Unregistered as u8),
                cancelled: AtomicBool::new(false),
                active: AtomicBool::new(false),
                auto_drain_error: OnceLock::new(),
                drain: DrainGate::new(),
            }),
        }
    }

    /// Register the consumer's callbacks.
    ///
    /// Schedules a full drain when auto-drain is configured; never blocks.
    pub fn register<C, E, F>(
        &self,
        on_chunk: C,
        on_error: E,
        on_complete: F,
    ) -> ProtocolResult<CancelHandle>
    where
        C: Fn(Bytes, Option<Continuation>) -> bool + Send + Sync + 'static,
        E: Fn(anyhow::Error) + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.register_callbacks(Arc::new(on_chunk), Arc::new(on_error), Arc::new(on_complete))
    }

    /// Register already type-erased callbacks.
    pub fn register_callbacks(
        &self,
        on_chunk: ChunkFn,
        on_error: ErrorFn,
        on_complete: CompleteFn,
    ) -> ProtocolResult<CancelHandle> {
        let callbacks = Callbacks {
            on_chunk,
            on_error,
            on_complete,
        };
        if self.shared.callbacks.set(callbacks).is_err() {
            warn!("consumer registered more than once");
            return Err(ProtocolError::AlreadyRegistered);
        }

        self.shared.active.store(true, Ordering::Release);
        self.shared.phase.store(Phase::Registered as u8, Ordering::Release);

        info!(
            payload_len = self.shared.payload.len(),
            chunk_size = self.shared.chunk_size,
            delivery = ?self.shared.delivery,
            auto_drain = self.shared.auto_drain,
            "consumer registered"
        );

        if self.shared.auto_drain {
            self.shared.drain.set(DrainState::Scheduled);
            let producer = self.clone();
            if let Err(e) = self
                .shared
                .spawner
                .spawn(Box::new(move || producer.run_auto_drain()))
            {
                error!(error = %e, "failed to schedule auto-drain");
                let _ = self
                    .shared
                    .auto_drain_error
                    .set(ProtocolError::SpawnFailed(e.to_string()));
                self.shared.drain.set(DrainState::Finished);
            }
        }

        Ok(CancelHandle {
            shared: Arc::clone(&self.shared),
        })
    }

    /// The producer as a plain delegate value for hosting code that takes
    /// a bare registration function.
    pub fn body_delegate(&self) -> BodyDelegate {
        let producer = self.clone();
        Arc::new(
            move |on_chunk: ChunkFn, on_error: ErrorFn, on_complete: CompleteFn| {
                producer.register_callbacks(on_chunk, on_error, on_complete)
            },
        )
    }

    /// Send at most one chunk. A no-op once the payload is exhausted.
    pub fn send_chunk(&self) -> ProtocolResult<()> {
        let callbacks = self.callbacks()?;
        let Some(range) = self.claim_next() else {
            return Ok(());
        };

        let offset = range.start;
        let chunk = self.shared.payload.slice(range);
        self.shared.chunks_sent.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.phase.compare_exchange(
            Phase::Registered as u8,
            Phase::Streaming as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        debug!(offset, len = chunk.len(), "sending chunk");

        match self.shared.delivery {
            DeliveryMode::Continuation => {
                let (continuation, readiness) = signal::readiness();
                if (callbacks.on_chunk)(chunk, Some(continuation)) {
                    readiness.wait().inspect_err(|e| {
                        warn!(offset, error = %e, "consumer broke its continuation promise");
                    })?;
                }
            }
            DeliveryMode::Synchronous => {
                if (callbacks.on_chunk)(chunk, None) {
                    warn!(offset, "consumer promised a continuation in synchronous mode");
                    return Err(ProtocolError::ContinuationUnavailable);
                }
            }
        }

        Ok(())
    }

    /// Send every remaining chunk, then signal completion once.
    ///
    /// Runs to the end even if cancellation is requested meanwhile.
    pub fn send_all(&self) -> ProtocolResult<()> {
        let callbacks = self.callbacks()?;
        while !self.is_exhausted() {
            self.send_chunk()?;
        }
        self.complete(callbacks);
        Ok(())
    }

    /// Forward `err` to the consumer's error callback. The cursor is left
    /// untouched.
    pub fn raise_error(&self, err: impl Into<anyhow::Error>) -> ProtocolResult<()> {
        let callbacks = self.callbacks()?;
        let err = err.into();
        self.shared.phase.store(Phase::Errored as u8, Ordering::Release);
        info!(cursor = self.cursor(), error = %err, "raising body error");
        (callbacks.on_error)(err);
        Ok(())
    }

    /// Signal completion now, whether or not every chunk was sent.
    pub fn signal_complete(&self) -> ProtocolResult<()> {
        let callbacks = self.callbacks()?;
        self.complete(callbacks);
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.shared.callbacks.get().is_some()
    }

    /// True once the cursor has reached the end of the payload.
    pub fn is_exhausted(&self) -> bool {
        self.cursor() >= self.shared.payload.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// True from registration until cancellation.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> usize {
        self.shared.cursor.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.shared.payload.len() - self.cursor()
    }

    pub fn payload(&self) -> &Bytes {
        &self.shared.payload
    }

    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.shared.delivery
    }

    pub fn chunks_sent(&self) -> usize {
        self.shared.chunks_sent.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// The failure that aborted a background drain, if any.
    pub fn auto_drain_error(&self) -> Option<ProtocolError> {
        self.shared.auto_drain_error.get().cloned()
    }

    /// Block until a scheduled auto-drain has finished, or `timeout`
    /// elapses. True when no drain is outstanding.
    pub fn wait_auto_drain(&self, timeout: Duration) -> bool {
        self.shared.drain.wait_settled(timeout)
    }

    fn callbacks(&self) -> ProtocolResult<&Callbacks> {
        self.shared
            .callbacks
            .get()
            .ok_or(ProtocolError::NotRegistered)
    }

    /// Atomically carve the next chunk range and advance the cursor past it.
    fn claim_next(&self) -> Option<Range<usize>> {
        let len = self.shared.payload.len();
        let chunk_size = self.shared.chunk_size;
        self.shared
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                (cursor < len).then(|| cursor + chunk_size.min(len - cursor))
            })
            .ok()
            .map(|start| start..start + chunk_size.min(len - start))
    }

    fn complete(&self, callbacks: &Callbacks) {
        self.shared.phase.store(Phase::Completed as u8, Ordering::Release);
        info!(
            cursor = self.cursor(),
            chunks = self.chunks_sent(),
            "body complete"
        );
        (callbacks.on_complete)();
    }

    fn run_auto_drain(&self) {
        if let Err(e) = self.send_all() {
            error!(cursor = self.cursor(), error = %e, "auto-drain failed");
            let _ = self.shared.auto_drain_error.set(e);
        }
        self.shared.drain.set(DrainState::Finished);
    }
}

impl fmt::Debug for ChunkedProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedProducer")
            .field("payload_len", &self.shared.payload.len())
            .field("chunk_size", &self.shared.chunk_size)
            .field("delivery", &self.shared.delivery)
            .field("auto_drain", &self.shared.auto_drain)
            .field("cursor", &self.cursor())
            .field("phase", &self.phase())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle returned by registration. Requesting cancellation is idempotent
/// and observational: it never interrupts or suppresses a drain, whether
/// already running or only scheduled.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc;

    use crate::spawn::Task;

    /// Holds spawned tasks until the test decides to run them.
    #[derive(Default)]
    struct ManualSpawner {
        tasks: Mutex<Vec<Task>>,
    }

    impl ManualSpawner {
        fn pending(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }

        fn run_all(&self) {
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
            for task in tasks {
                task();
            }
        }
    }

    impl Spawn for ManualSpawner {
        fn spawn(&self, task: Task) -> io::Result<()> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    /// Refuses every task, like a process out of threads.
    struct ExhaustedSpawner;

    impl Spawn for ExhaustedSpawner {
        fn spawn(&self, _task: Task) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
        }
    }

    #[derive(Default)]
    struct Log {
        chunks: Mutex<Vec<Bytes>>,
        errors: Mutex<Vec<String>>,
        completions: AtomicUsize,
    }

    fn sync_producer(payload: &'static [u8], chunk_size: usize) -> ChunkedProducer {
        ChunkedProducer::new(
            payload,
            ProducerConfig::new(chunk_size, DeliveryMode::Synchronous, false),
        )
    }

    fn register_logging(
        producer: &ChunkedProducer,
        will_continue: bool,
    ) -> (Arc<Log>, CancelHandle) {
        let log = Arc::new(Log::default());
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let handle = producer
            .register(
                move |chunk, continuation| {
                    l1.chunks.lock().unwrap().push(chunk);
                    drop(continuation);
                    will_continue
                },
                move |err| l2.errors.lock().unwrap().push(err.to_string()),
                move || {
                    l3.completions.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        (log, handle)
    }

    fn sizes(log: &Log) -> Vec<usize> {
        log.chunks.lock().unwrap().iter().map(Bytes::len).collect()
    }

    #[test]
    fn operations_before_registration_fail() {
        let producer = sync_producer(b"abc", 1);
        assert_eq!(producer.send_chunk(), Err(ProtocolError::NotRegistered));
        assert_eq!(producer.send_all(), Err(ProtocolError::NotRegistered));
        assert_eq!(
            producer.raise_error(anyhow::anyhow!("boom")),
            Err(ProtocolError::NotRegistered)
        );
        assert_eq!(producer.signal_complete(), Err(ProtocolError::NotRegistered));
        assert_eq!(producer.cursor(), 0);
        assert!(!producer.is_registered());
        assert_eq!(producer.phase(), Phase::Unregistered);
    }

    #[test]
    fn sync_drain_ten_bytes_by_four() {
        let producer = sync_producer(b"0123456789", 4);
        let (log, _cancel) = register_logging(&producer, false);
        assert!(producer.is_registered());

        producer.send_all().unwrap();

        assert_eq!(sizes(&log), vec![4, 4, 2]);
        let body: Vec<u8> = log.chunks.lock().unwrap().concat();
        assert_eq!(body, b"0123456789");
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
        assert_eq!(producer.cursor(), 10);
        assert_eq!(producer.chunks_sent(), 3);
        assert!(producer.is_exhausted());
        assert_eq!(producer.phase(), Phase::Completed);
    }

    #[test]
    fn empty_payload_completes_without_chunks() {
        let producer = sync_producer(b"", 8);
        let (log, _cancel) = register_logging(&producer, false);

        producer.send_all().unwrap();

        assert!(log.chunks.lock().unwrap().is_empty());
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_chunk_when_exhausted_is_noop() {
        let producer = sync_producer(b"ab", 2);
        let (log, _cancel) = register_logging(&producer, false);

        producer.send_chunk().unwrap();
        producer.send_chunk().unwrap();
        producer.send_chunk().unwrap();

        assert_eq!(sizes(&log), vec![2]);
        assert_eq!(producer.cursor(), 2);
        assert_eq!(log.completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sync_mode_rejects_continuation_promise() {
        let producer = sync_producer(b"abcdef", 2);
        let (log, _cancel) = register_logging(&producer, true);

        assert_eq!(producer.send_all(), Err(ProtocolError::ContinuationUnavailable));
        // The failing chunk was already carved and delivered.
        assert_eq!(sizes(&log), vec![2]);
        assert_eq!(producer.cursor(), 2);
        assert_eq!(log.completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn continuation_mode_false_return_proceeds_immediately() {
        let producer = ChunkedProducer::new(
            &b"abcdef"[..],
            ProducerConfig::new(4, DeliveryMode::Continuation, false),
        );
        let (log, _cancel) = register_logging(&producer, false);

        producer.send_all().unwrap();

        assert_eq!(sizes(&log), vec![4, 2]);
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn continuation_mode_resumed_inline() {
        let producer = ChunkedProducer::new(
            &b"abcdef"[..],
            ProducerConfig::new(1, DeliveryMode::Continuation, false),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        producer
            .register(
                move |_chunk, continuation| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    continuation.expect("continuation offered").resume();
                    true
                },
                |_| {},
                || {},
            )
            .unwrap();

        producer.send_all().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn continuation_mode_dropped_promise_fails() {
        let producer = ChunkedProducer::new(
            &b"abcdef"[..],
            ProducerConfig::new(3, DeliveryMode::Continuation, false),
        );
        let (log, _cancel) = register_logging(&producer, true);

        assert_eq!(producer.send_chunk(), Err(ProtocolError::ContinuationDropped));
        assert_eq!(sizes(&log), vec![3]);
        assert_eq!(producer.cursor(), 3);
    }

    #[test]
    fn continuation_mode_waits_for_deferred_resume() {
        let producer = ChunkedProducer::new(
            &b"abcd"[..],
            ProducerConfig::new(2, DeliveryMode::Continuation, false),
        );
        let (tx, rx) = mpsc::channel::<Continuation>();
        let tx = Mutex::new(tx);
        producer
            .register(
                move |_chunk, continuation| {
                    tx.lock()
                        .unwrap()
                        .send(continuation.expect("continuation offered"))
                        .unwrap();
                    true
                },
                |_| {},
                || {},
            )
            .unwrap();

        let driver = producer.clone();
        let drain = std::thread::spawn(move || driver.send_all());

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The second chunk must not arrive while the first is unacknowledged.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(producer.chunks_sent(), 1);
        first.resume();

        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        second.resume();

        assert_eq!(drain.join().unwrap(), Ok(()));
        assert_eq!(producer.phase(), Phase::Completed);
    }

    #[test]
    fn reentrant_send_observes_advanced_cursor() {
        let producer = sync_producer(b"0123456789", 4);
        let log = Arc::new(Log::default());
        let reentered = Arc::new(AtomicBool::new(false));

        let (inner, l1, l2) = (producer.clone(), log.clone(), log.clone());
        let flag = reentered.clone();
        producer
            .register(
                move |chunk, _| {
                    l1.chunks.lock().unwrap().push(chunk);
                    if !flag.swap(true, Ordering::SeqCst) {
                        inner.send_chunk().unwrap();
                    }
                    false
                },
                |_| {},
                move || {
                    l2.completions.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        producer.send_all().unwrap();

        let chunks = log.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"0123456789");
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raise_error_forwards_once_and_keeps_cursor() {
        let producer = sync_producer(b"abcdef", 2);
        let (log, _cancel) = register_logging(&producer, false);
        producer.send_chunk().unwrap();

        producer.raise_error(anyhow::anyhow!("disk on fire")).unwrap();

        assert_eq!(*log.errors.lock().unwrap(), vec!["disk on fire".to_string()]);
        assert_eq!(producer.cursor(), 2);
        assert_eq!(log.completions.load(Ordering::SeqCst), 0);
        assert_eq!(producer.phase(), Phase::Errored);
    }

    #[test]
    fn raise_error_passes_error_verbatim() {
        let producer = sync_producer(b"x", 1);
        let received = Arc::new(Mutex::new(None));
        let slot = received.clone();
        producer
            .register(
                |_, _| false,
                move |err| *slot.lock().unwrap() = Some(err),
                || {},
            )
            .unwrap();

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer went away");
        producer.raise_error(io).unwrap();

        let err = received.lock().unwrap().take().unwrap();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn signal_complete_short_stream() {
        let producer = sync_producer(b"abcdef", 2);
        let (log, _cancel) = register_logging(&producer, false);
        producer.send_chunk().unwrap();

        producer.signal_complete().unwrap();

        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
        assert_eq!(producer.cursor(), 2);
        assert!(!producer.is_exhausted());
        assert_eq!(producer.phase(), Phase::Completed);
    }

    #[test]
    fn second_registration_rejected_first_binding_kept() {
        let producer = sync_producer(b"ab", 2);
        let (log, _cancel) = register_logging(&producer, false);

        let second = producer.register(|_, _| panic!("second binding used"), |_| {}, || {});
        assert!(matches!(second, Err(ProtocolError::AlreadyRegistered)));

        producer.send_all().unwrap();
        assert_eq!(sizes(&log), vec![2]);
    }

    #[test]
    fn cancel_is_idempotent_and_does_not_stop_manual_drain() {
        let producer = sync_producer(b"abcdef", 2);
        let (log, cancel) = register_logging(&producer, false);
        assert!(producer.is_active());

        cancel.cancel();
        cancel.cancel();
        cancel.clone().cancel();

        assert!(cancel.is_cancelled());
        assert!(producer.is_cancelled());
        assert!(!producer.is_active());

        producer.send_all().unwrap();
        assert_eq!(sizes(&log), vec![2, 2, 2]);
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auto_drain_runs_on_spawner() {
        let spawner = Arc::new(ManualSpawner::default());
        let producer = ChunkedProducer::with_spawner(
            &b"abcde"[..],
            ProducerConfig::new(2, DeliveryMode::Synchronous, true),
            spawner.clone(),
        );
        let (log, _cancel) = register_logging(&producer, false);

        // Registration only schedules.
        assert_eq!(spawner.pending(), 1);
        assert!(log.chunks.lock().unwrap().is_empty());

        spawner.run_all();

        assert_eq!(sizes(&log), vec![2, 2, 1]);
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
        assert!(producer.auto_drain_error().is_none());
    }

    #[test]
    fn scheduled_auto_drain_survives_cancellation() {
        let spawner = Arc::new(ManualSpawner::default());
        let producer = ChunkedProducer::with_spawner(
            &b"abcde"[..],
            ProducerConfig::new(2, DeliveryMode::Synchronous, true),
            spawner.clone(),
        );
        let (log, cancel) = register_logging(&producer, false);

        // Cancelled while the drain is scheduled but has not started.
        cancel.cancel();
        assert!(!producer.wait_auto_drain(Duration::from_millis(10)));
        spawner.run_all();

        assert_eq!(sizes(&log), vec![2, 2, 1]);
        assert_eq!(log.completions.load(Ordering::SeqCst), 1);
        assert!(producer.is_cancelled());
        assert_eq!(producer.phase(), Phase::Completed);
        assert!(producer.wait_auto_drain(Duration::ZERO));
    }

    #[test]
    fn spawn_failure_is_recorded_as_auto_drain_error() {
        let producer = ChunkedProducer::with_spawner(
            &b"abcde"[..],
            ProducerConfig::new(2, DeliveryMode::Synchronous, true),
            Arc::new(ExhaustedSpawner),
        );
        let (log, _cancel) = register_logging(&producer, false);

        assert!(producer.is_registered());
        assert_eq!(
            producer.auto_drain_error(),
            Some(ProtocolError::SpawnFailed("no threads left".to_string()))
        );
        assert!(producer.wait_auto_drain(Duration::ZERO));
        assert!(log.chunks.lock().unwrap().is_empty());
    }

    #[test]
    fn wait_auto_drain_without_schedule_returns_immediately() {
        let producer = sync_producer(b"abc", 1);
        assert!(producer.wait_auto_drain(Duration::ZERO));
        let (_log, _cancel) = register_logging(&producer, false);
        assert!(producer.wait_auto_drain(Duration::ZERO));
    }

    #[test]
    fn auto_drain_failure_is_retained() {
        let spawner = Arc::new(ManualSpawner::default());
        let producer = ChunkedProducer::with_spawner(
            &b"abcde"[..],
            ProducerConfig::new(2, DeliveryMode::Synchronous, true),
            spawner.clone(),
        );
        let (_log, _cancel) = register_logging(&producer, true);

        spawner.run_all();

        assert_eq!(
            producer.auto_drain_error(),
            Some(ProtocolError::ContinuationUnavailable)
        );
    }

    #[test]
    fn auto_drain_on_thread_does_not_block_registration() {
        let producer = ChunkedProducer::new(
            &b"hello world"[..],
            ProducerConfig::new(3, DeliveryMode::Synchronous, true),
        );
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        producer
            .register(
                |_, _| false,
                |_| {},
                move || tx.lock().unwrap().send(()).unwrap(),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(producer.cursor(), 11);
        assert_eq!(producer.chunks_sent(), 4);
    }

    #[test]
    fn body_delegate_registers_producer() {
        let producer = sync_producer(b"abc", 2);
        let delegate = producer.body_delegate();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let on_chunk: ChunkFn = Arc::new(move |_: Bytes, _: Option<Continuation>| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        let on_error: ErrorFn = Arc::new(|_: anyhow::Error| {});
        let on_complete: CompleteFn = Arc::new(|| {});
        let cancel = delegate(on_chunk, on_error, on_complete).unwrap();

        assert!(producer.is_registered());
        producer.send_all().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        assert!(producer.is_cancelled());
    }

    #[test]
    fn phase_follows_lifecycle() {
        let producer = sync_producer(b"abcd", 2);
        assert_eq!(producer.phase(), Phase::Unregistered);
        let (_log, _cancel) = register_logging(&producer, false);
        assert_eq!(producer.phase(), Phase::Registered);
        producer.send_chunk().unwrap();
        assert_eq!(producer.phase(), Phase::Streaming);
        producer.send_all().unwrap();
        assert_eq!(producer.phase(), Phase::Completed);
        assert!(producer.phase().is_terminal());
        producer.raise_error(anyhow::anyhow!("late")).unwrap();
        assert_eq!(producer.phase(), Phase::Errored);
    }

    #[test]
    fn chunks_are_zero_copy_slices() {
        let payload = Bytes::from(vec![7u8; 64]);
        let base = payload.as_ptr() as usize;
        let producer =
            ChunkedProducer::new(payload, ProducerConfig::new(16, DeliveryMode::Synchronous, false));
        let (log, _cancel) = register_logging(&producer, false);

        producer.send_all().unwrap();

        let chunks = log.chunks.lock().unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.as_ptr() as usize, base + i * 16);
        }
    }

    #[test]
    #[should_panic(expected = "chunk_size must be > 0")]
    fn zero_chunk_size_panics() {
        let _ = sync_producer(b"abc", 0);
    }
}
