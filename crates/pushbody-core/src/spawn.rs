//! The "run independently" capability used by auto-drain.

use std::fmt;
use std::io;
use std::thread;

use tokio::runtime::Handle;

/// A unit of work handed to a [`Spawn`] implementation.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Launches a task without blocking the caller.
///
/// Tasks may block (a continuation-mode drain waits on its consumer), so
/// implementations must not run them on an async worker thread.
pub trait Spawn: Send + Sync {
    /// Launch `task`. An error means the task will never run.
    fn spawn(&self, task: Task) -> io::Result<()>;
}

/// Runs each task on a fresh OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpawner {
    name: Option<String>,
}

impl ThreadSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the spawned threads (shows up in panics and debuggers).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, task: Task) -> io::Result<()> {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        builder.spawn(task).map(drop)
    }
}

/// Runs each task on a Tokio runtime's blocking pool.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is currently inside, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl fmt::Debug for TokioSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioSpawner").finish_non_exhaustive()
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, task: Task) -> io::Result<()> {
        // Detached; completion is observed through the consumer callbacks.
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}
