//! Readiness reactor.
//!
//! Wraps one OS readiness facility (epoll on Linux, via `mio`) plus a map of
//! handle → (interest, callback). A `poll` waits for readiness once and hands
//! every ready handle's callback to the reactor's own worker pool; it does
//! not wait for the callbacks to run.
//!
//! Registrations are edge-triggered: a callback is expected to drain its
//! handle until the OS reports would-block, otherwise it may not be called
//! again for data that is already buffered.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

pub use mio::Interest;

use crate::config::ReactorConfig;
use crate::error::ReactorError;
use crate::metrics;
use crate::socket::Handle;
use crate::worker_pool::WorkerPool;

/// Token reserved for the cross-thread waker; never a valid descriptor.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// What the facility reported for one handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub type Callback = Arc<dyn Fn(Handle, Readiness) + Send + Sync + 'static>;

struct Registration {
    interest: Interest,
    callback: Callback,
}

struct PollState {
    poll: Poll,
    events: Events,
}

pub struct Reactor {
    /// Only one thread waits at a time.
    poll: Mutex<PollState>,
    registry: Registry,
    waker: Waker,
    registrations: Mutex<HashMap<Handle, Registration>>,
    pool: WorkerPool,
}

impl Reactor {
    pub fn new(config: &ReactorConfig) -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Create)?;
        let registry = poll.registry().try_clone().map_err(ReactorError::Create)?;
        let waker = Waker::new(&registry, WAKE_TOKEN).map_err(ReactorError::Create)?;
        let pool = WorkerPool::with_name("reactor", config.workers)?;

        Ok(Self {
            poll: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(config.max_events.max(1)),
            }),
            registry,
            waker,
            registrations: Mutex::new(HashMap::new()),
            pool,
        })
    }

    /// Start watching `handle`. Fails if it is already registered.
    pub fn register<F>(&self, handle: Handle, interest: Interest, callback: F) -> Result<(), ReactorError>
    where
        F: Fn(Handle, Readiness) + Send + Sync + 'static,
    {
        let token = token_for(handle)?;
        let mut regs = lock(&self.registrations);
        if regs.contains_key(&handle) {
            return Err(ReactorError::AlreadyRegistered(handle));
        }
        self.registry
            .register(&mut SourceFd(&handle), token, interest)
            .map_err(|source| ReactorError::Control { handle, source })?;
        regs.insert(
            handle,
            Registration {
                interest,
                callback: Arc::new(callback),
            },
        );
        trace!(handle, ?interest, "registered");
        Ok(())
    }

    /// Replace the interest set of a registered handle.
    pub fn modify(&self, handle: Handle, interest: Interest) -> Result<(), ReactorError> {
        let token = token_for(handle)?;
        let mut regs = lock(&self.registrations);
        let reg = regs
            .get_mut(&handle)
            .ok_or(ReactorError::UnknownHandle(handle))?;
        self.registry
            .reregister(&mut SourceFd(&handle), token, interest)
            .map_err(|source| ReactorError::Control { handle, source })?;
        reg.interest = interest;
        Ok(())
    }

    /// Stop watching `handle`. The map entry is removed even if the facility
    /// already forgot the descriptor (e.g. it was closed first), so a second
    /// call always reports `UnknownHandle`.
    pub fn unregister(&self, handle: Handle) -> Result<(), ReactorError> {
        let mut regs = lock(&self.registrations);
        if regs.remove(&handle).is_none() {
            return Err(ReactorError::UnknownHandle(handle));
        }
        if let Err(source) = self.registry.deregister(&mut SourceFd(&handle)) {
            warn!(handle, error = %source, "deregister failed; registration dropped");
            return Err(ReactorError::Control { handle, source });
        }
        trace!(handle, "unregistered");
        Ok(())
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        lock(&self.registrations).contains_key(&handle)
    }

    pub fn interest(&self, handle: Handle) -> Option<Interest> {
        lock(&self.registrations).get(&handle).map(|r| r.interest)
    }

    pub fn len(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout` (forever if `None`) for readiness, then submit
    /// the callback of every ready handle to the worker pool. Returns the
    /// number of callbacks submitted. Interrupted waits are retried with the
    /// remaining time.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.poll);
        let PollState { poll, events } = &mut *state;

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match poll.poll(events, remaining) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReactorError::Poll(e)),
            }
        }

        let ready: Vec<(Handle, Readiness, Callback)> = {
            let regs = lock(&self.registrations);
            events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .filter_map(|event| {
                    let handle = event.token().0 as Handle;
                    // Unregistered between the wait and now: nothing to run.
                    let reg = regs.get(&handle)?;
                    Some((handle, Readiness::from_event(event), reg.callback.clone()))
                })
                .collect()
        };
        drop(state);

        let dispatched = ready.len();
        for (handle, readiness, callback) in ready {
            self.pool.execute(move || callback(handle, readiness))?;
        }
        if dispatched > 0 {
            metrics::add_events_dispatched(dispatched);
            trace!(dispatched, "dispatched ready callbacks");
        }
        Ok(dispatched)
    }

    /// Make a blocked (or the next) `poll` return early.
    pub fn wake(&self) -> Result<(), ReactorError> {
        self.waker.wake().map_err(ReactorError::Poll)
    }

    /// Drain and join the callback pool. Later polls fail with
    /// `PoolError::Stopped` if anything becomes ready.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        debug!("reactor stopped");
    }
}

fn token_for(handle: Handle) -> Result<Token, ReactorError> {
    if handle < 0 {
        return Err(ReactorError::InvalidHandle(handle));
    }
    Ok(Token(handle as usize))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
