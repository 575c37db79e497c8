//! One accepted client: its socket plus a per-connection message FIFO.
//!
//! Socket access goes through a mutex, so the read loop, `send` calls from
//! message callbacks and the final close never touch the descriptor at the
//! same time.
//!
//! Message dispatch is single-flight: received chunks queue up in arrival
//! order and at most one dispatch task per connection is queued or running.
//! Dispatch starts held (`busy`) and is only released after `on_connect`
//! returns, so `on_connect` happens before any `on_message`.
//!
//! The queue is bounded. Once `max_pending` chunks are waiting, reading is
//! paused and the peer is left to the kernel's flow control; the dispatch
//! task resumes reading when the queue is back down to half.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use crate::error::SocketError;
use crate::socket::{Handle, NonBlockingSocket};

#[derive(Debug, Default)]
struct DispatchState {
    pending: VecDeque<Vec<u8>>,
    /// A dispatch task is queued or running, or dispatch is still held.
    busy: bool,
    /// Removal has started; nothing more is delivered.
    closed: bool,
    /// Peer went away; remove once `pending` is delivered.
    remove_when_drained: bool,
    /// Queue hit its bound; the read loop stops until dispatch catches up.
    read_paused: bool,
}

/// What the dispatch task should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Message(Vec<u8>),
    /// Queue empty; dispatch released.
    Idle,
    /// Queue empty and the peer is gone; caller removes the connection.
    Remove,
    /// Queue drained below the low-water mark; caller reads the socket again.
    ResumeReading,
}

/// What the caller should do after releasing or requesting something.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Followup {
    Nothing,
    ScheduleDispatch,
    Remove,
}

#[derive(Debug)]
pub struct Connection {
    handle: Handle,
    peer: Option<SocketAddr>,
    socket: Mutex<NonBlockingSocket>,
    dispatch: Mutex<DispatchState>,
    max_pending: usize,
}

impl Connection {
    pub(crate) fn new(socket: NonBlockingSocket, max_pending: usize) -> Self {
        Self {
            handle: socket.handle(),
            peer: socket.peer_addr().ok(),
            socket: Mutex::new(socket),
            dispatch: Mutex::new(DispatchState {
                busy: true,
                ..DispatchState::default()
            }),
            max_pending: max_pending.max(1),
        }
    }

    /// Descriptor this connection was accepted on. Stays the same after
    /// close, for logging and table lookups.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        !lock(&self.socket).is_valid()
    }

    /// Single `send`. Fails with `InvalidHandle` once the connection is closed.
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        lock(&self.socket).send(buf)
    }

    /// Write all of `buf` while holding the socket.
    pub fn send_all(&self, buf: &[u8]) -> Result<(), SocketError> {
        lock(&self.socket).send_all(buf)
    }

    pub(crate) fn lock_socket(&self) -> MutexGuard<'_, NonBlockingSocket> {
        lock(&self.socket)
    }

    pub(crate) fn close_socket(&self) -> Result<(), SocketError> {
        lock(&self.socket).close()
    }

    /// Queue a received chunk. `true` means the caller must schedule a
    /// dispatch task.
    pub(crate) fn enqueue(&self, chunk: Vec<u8>) -> bool {
        let mut state = lock(&self.dispatch);
        if state.closed {
            return false;
        }
        state.pending.push_back(chunk);
        if state.pending.len() >= self.max_pending {
            state.read_paused = true;
        }
        if state.busy {
            return false;
        }
        state.busy = true;
        true
    }

    /// The read loop checks this before every `recv`.
    pub(crate) fn is_read_paused(&self) -> bool {
        lock(&self.dispatch).read_paused
    }

    pub(crate) fn next_dispatch(&self) -> Dispatch {
        let mut state = lock(&self.dispatch);
        if state.closed {
            state.busy = false;
            return Dispatch::Idle;
        }
        if state.read_paused
            && !state.remove_when_drained
            && state.pending.len() <= self.max_pending / 2
        {
            state.read_paused = false;
            return Dispatch::ResumeReading;
        }
        if let Some(chunk) = state.pending.pop_front() {
            return Dispatch::Message(chunk);
        }
        state.busy = false;
        if state.remove_when_drained {
            Dispatch::Remove
        } else {
            Dispatch::Idle
        }
    }

    /// Lift the initial hold once `on_connect` has returned.
    pub(crate) fn release_hold(&self) -> Followup {
        let mut state = lock(&self.dispatch);
        if state.closed {
            state.busy = false;
            return Followup::Nothing;
        }
        if !state.pending.is_empty() {
            return Followup::ScheduleDispatch;
        }
        state.busy = false;
        if state.remove_when_drained {
            Followup::Remove
        } else {
            Followup::Nothing
        }
    }

    /// Peer EOF or fatal read error: remove now if nothing is in flight,
    /// otherwise let the dispatch task remove after delivering what is queued.
    pub(crate) fn request_removal(&self) -> Followup {
        let mut state = lock(&self.dispatch);
        if state.closed {
            return Followup::Nothing;
        }
        if state.busy {
            state.remove_when_drained = true;
            Followup::Nothing
        } else {
            Followup::Remove
        }
    }

    /// Stop delivering; drops whatever is still queued.
    pub(crate) fn mark_closed(&self) {
        let mut state = lock(&self.dispatch);
        state.closed = true;
        state.pending.clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
