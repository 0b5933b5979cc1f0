//! Per-chunk readiness rendezvous.
//!
//! Each chunk delivered in continuation mode gets a fresh oneshot pair. The
//! consumer receives the [`Continuation`] half and the drain loop keeps the
//! [`Readiness`] half, so "deliver chunk" and "wait for readiness" are two
//! explicit steps instead of a nested callback.

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{ProtocolError, ProtocolResult};

/// Single-use "ready for the next chunk" signal handed to the consumer.
///
/// Consuming `self` in [`resume`](Continuation::resume) makes a second
/// invocation impossible. The handle is `Send`, so it can be resumed from
/// any thread.
#[derive(Debug)]
pub struct Continuation {
    tx: oneshot::Sender<()>,
}

impl Continuation {
    pub fn resume(self) {
        // The producer may have stopped waiting (the consumer also returned
        // `false`); a closed receiver is not an error.
        let _ = self.tx.send(());
    }
}

/// Producer-side half of the rendezvous.
#[derive(Debug)]
pub(crate) struct Readiness {
    rx: oneshot::Receiver<()>,
}

impl Readiness {
    /// Wait until the continuation is resumed.
    ///
    /// Returns at once if it already was. Otherwise blocks the current
    /// thread; on a multi-thread Tokio worker the wait moves off the
    /// scheduler via `block_in_place`, and on a current-thread runtime it
    /// fails with [`ProtocolError::RuntimeBlocked`] since nothing else could
    /// ever resume it there.
    pub(crate) fn wait(mut self) -> ProtocolResult<()> {
        match self.rx.try_recv() {
            Ok(()) => return Ok(()),
            Err(TryRecvError::Closed) => return Err(ProtocolError::ContinuationDropped),
            Err(TryRecvError::Empty) => {}
        }

        match Handle::try_current() {
            Err(_) => self.block(),
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(ProtocolError::RuntimeBlocked),
                _ => tokio::task::block_in_place(|| self.block()),
            },
        }
    }

    fn block(self) -> ProtocolResult<()> {
        self.rx
            .blocking_recv()
            .map_err(|_| ProtocolError::ContinuationDropped)
    }
}

pub(crate) fn readiness() -> (Continuation, Readiness) {
    let (tx, rx) = oneshot::channel();
    (Continuation { tx }, Readiness { rx })
}
