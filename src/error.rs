//! Error kinds for every layer of the runtime.
//!
//! Each layer gets its own enum so callers can match on exactly the outcomes
//! that layer can produce. OS failures are carried as `io::Error` values that
//! were captured at the call site; nothing here reads `errno` after the fact.

use std::io;

use thiserror::Error;

use crate::socket::Handle;

/// Failure of a single socket operation.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),

    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),

    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    /// No connection pending / no data available. Retry later.
    #[error("operation would block")]
    WouldBlock,

    /// Interrupted by a signal before anything happened. Retry.
    #[error("operation interrupted")]
    Interrupted,

    /// The socket holds the invalid sentinel (closed or moved out).
    #[error("socket handle is invalid")]
    InvalidHandle,

    #[error("close failed: {0}")]
    Close(#[source] io::Error),

    #[error("socket i/o failed: {0}")]
    Io(#[source] io::Error),
}

impl SocketError {
    /// Classify an error returned by `accept`/`send`/`recv`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::WouldBlock,
            io::ErrorKind::Interrupted => SocketError::Interrupted,
            _ => SocketError::Io(err),
        }
    }

    /// True for transient outcomes (`WouldBlock`, `Interrupted`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SocketError::WouldBlock | SocketError::Interrupted)
    }
}

/// Failure to hand work to a [`WorkerPool`](crate::worker_pool::WorkerPool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool needs at least one thread")]
    NoWorkers,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Submission after shutdown was requested.
    #[error("worker pool stopped")]
    Stopped,
}

/// Outcome of waiting on a submitted task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked; the worker survived.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The pool went away without running the task.
    #[error("task was dropped before it ran")]
    Dropped,

    /// `try_join` only: the task has not finished yet.
    #[error("task still running")]
    Pending,
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create readiness facility: {0}")]
    Create(#[source] io::Error),

    #[error("handle {0} is already registered")]
    AlreadyRegistered(Handle),

    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),

    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    /// The facility rejected a register/modify/unregister call.
    #[error("readiness facility rejected handle {handle}: {source}")]
    Control {
        handle: Handle,
        #[source]
        source: io::Error,
    },

    /// Non-retryable failure while waiting for readiness.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("server is already started")]
    AlreadyStarted,

    #[error("server is shut down")]
    ShutDown,

    #[error("connection {0} is not tracked")]
    UnknownConnection(Handle),

    #[error("connection {0} is already tracked")]
    DuplicateConnection(Handle),

    /// An application callback panicked; partial state was rolled back.
    #[error("{callback} callback panicked: {message}")]
    CallbackPanicked {
        callback: &'static str,
        message: String,
    },
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
