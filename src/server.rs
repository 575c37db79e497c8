//! Connection lifecycle orchestration.
//!
//! `ConnectionServer` ties one listening socket, one [`Reactor`], one
//! dispatch [`WorkerPool`] and the table of live connections together.
//!
//! Per connection:
//! `Accepted → Registered → (Reading ⇄ Dispatching) → Closing → Removed`.
//!
//! Invariant: a handle is in the connection table iff it has a live reactor
//! registration. Both are changed under the table lock, and every partial
//! add or remove is rolled back before the lock is released.
//!
//! The server never runs a loop of its own; the host drives it by calling
//! [`ConnectionServer::poll`] repeatedly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, Dispatch, Followup};
use crate::error::{ServerError, SocketError, panic_message};
use crate::metrics;
use crate::reactor::{Interest, Reactor};
use crate::socket::{Handle, NonBlockingSocket};
use crate::worker_pool::WorkerPool;

type ConnectionHandler = Arc<dyn Fn(&Arc<Connection>) + Send + Sync + 'static>;
type MessageHandler = Arc<dyn Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static>;

#[derive(Default, Clone)]
struct Handlers {
    on_connect: Option<ConnectionHandler>,
    on_message: Option<MessageHandler>,
    on_close: Option<ConnectionHandler>,
}

enum ReadOutcome {
    Drained,
    Paused,
    PeerClosed,
    Failed(SocketError),
}

struct Shared {
    config: ServerConfig,
    listener: Mutex<NonBlockingSocket>,
    reactor: Reactor,
    pool: WorkerPool,
    connections: Mutex<HashMap<Handle, Arc<Connection>>>,
    handlers: RwLock<Handlers>,
    shut_down: AtomicBool,
}

pub struct ConnectionServer {
    shared: Arc<Shared>,
}

impl ConnectionServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let reactor = Reactor::new(&config.reactor)?;
        let pool = WorkerPool::with_name("dispatch", config.dispatch_workers)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                listener: Mutex::new(NonBlockingSocket::invalid()),
                reactor,
                pool,
                connections: Mutex::new(HashMap::new()),
                handlers: RwLock::new(Handlers::default()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Called once per accepted connection, before any `on_message` for it.
    /// A panic here rolls the connection back out of the server.
    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.shared.handlers_mut().on_connect = Some(Arc::new(f));
    }

    /// Called with each received chunk, in arrival order per connection.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static,
    {
        self.shared.handlers_mut().on_message = Some(Arc::new(f));
    }

    /// Called once when a connection is removed, before its socket closes.
    pub fn on_close<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.shared.handlers_mut().on_close = Some(Arc::new(f));
    }

    /// Create, bind and listen on `ip:port`, then watch the listener for
    /// incoming connections. Any failure leaves the server unstarted.
    pub fn start(&self, ip: &str, port: u16) -> Result<(), ServerError> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(ServerError::ShutDown);
        }
        let mut listener = lock(&shared.listener);
        if listener.is_valid() {
            return Err(ServerError::AlreadyStarted);
        }

        let socket = NonBlockingSocket::create()?;
        socket.bind(ip, port)?;
        socket.listen(shared.config.backlog)?;

        let weak = Arc::downgrade(shared);
        shared
            .reactor
            .register(socket.handle(), Interest::READABLE, move |_, _| {
                if let Some(shared) = weak.upgrade() {
                    shared.accept_ready();
                }
            })?;

        let addr = socket.local_addr().ok();
        *listener = socket;
        info!(%ip, port, ?addr, "listening");
        Ok(())
    }

    /// Wait up to `timeout` for readiness and dispatch what is ready.
    /// Returns the number of reactor callbacks submitted.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize, ServerError> {
        Ok(self.shared.reactor.poll(timeout)?)
    }

    /// Non-blocking `poll`.
    pub fn loop_once(&self) -> Result<usize, ServerError> {
        self.poll(Some(Duration::ZERO))
    }

    /// Track an already-connected socket as if it had just been accepted.
    pub fn add(&self, socket: NonBlockingSocket) -> Result<Arc<Connection>, ServerError> {
        self.shared.add(socket)
    }

    /// Remove the connection on `handle`: unregister, run `on_close`, close.
    pub fn remove(&self, handle: Handle) -> Result<(), ServerError> {
        self.shared.remove(handle)
    }

    /// Remove exactly this connection (not a later one reusing its handle).
    pub fn disconnect(&self, conn: &Arc<Connection>) -> Result<(), ServerError> {
        self.shared.remove_connection(conn)
    }

    pub fn connection(&self, handle: Handle) -> Option<Arc<Connection>> {
        lock(&self.shared.connections).get(&handle).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listener).local_addr().ok()
    }

    /// Weak handle for use inside callbacks; does not keep the server alive.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Stop listening, drain reactor callbacks, remove every connection
    /// (running `on_close`), then drain message dispatch. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Non-owning reference to a server, safe to capture in its own callbacks.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Weak<Shared>,
}

impl ServerHandle {
    fn upgrade(&self) -> Result<Arc<Shared>, ServerError> {
        self.shared.upgrade().ok_or(ServerError::ShutDown)
    }

    pub fn remove(&self, handle: Handle) -> Result<(), ServerError> {
        self.upgrade()?.remove(handle)
    }

    pub fn disconnect(&self, conn: &Arc<Connection>) -> Result<(), ServerError> {
        self.upgrade()?.remove_connection(conn)
    }

    pub fn connection_count(&self) -> usize {
        match self.shared.upgrade() {
            Some(shared) => shared.connection_count(),
            None => 0,
        }
    }
}

impl Shared {
    fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn handlers(&self) -> Handlers {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Listener readiness: accept until the OS says would-block.
    fn accept_ready(self: &Arc<Self>) {
        loop {
            let accepted = lock(&self.listener).accept();
            match accepted {
                Ok(socket) => {
                    if let Err(e) = self.add(socket) {
                        warn!(error = %e, "dropping accepted connection");
                    }
                }
                Err(SocketError::WouldBlock) => return,
                Err(SocketError::Interrupted) => continue,
                // Listener closed by shutdown.
                Err(SocketError::InvalidHandle) => return,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Register, insert, then run `on_connect`; undo both if it panics.
    fn add(self: &Arc<Self>, socket: NonBlockingSocket) -> Result<Arc<Connection>, ServerError> {
        if self.is_shut_down() {
            return Err(ServerError::ShutDown);
        }
        let handle = socket.handle();
        if handle < 0 {
            return Err(SocketError::InvalidHandle.into());
        }
        let conn = Arc::new(Connection::new(socket, self.config.max_pending_messages));

        {
            let mut table = lock(&self.connections);
            if table.contains_key(&handle) {
                return Err(ServerError::DuplicateConnection(handle));
            }
            let server = Arc::downgrade(self);
            let target = Arc::downgrade(&conn);
            // On failure `conn` drops here and its socket closes with it.
            self.reactor
                .register(handle, Interest::READABLE, move |_, _| {
                    if let (Some(server), Some(conn)) = (server.upgrade(), target.upgrade()) {
                        server.read_ready(&conn);
                    }
                })?;
            table.insert(handle, conn.clone());
        }
        metrics::inc_connections_accepted();
        debug!(handle, peer = ?conn.peer_addr(), "connection added");

        if let Some(on_connect) = self.handlers().on_connect {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_connect(&conn))) {
                let message = panic_message(payload.as_ref());
                error!(handle, panic = %message, "on_connect panicked; rolling back");
                self.rollback(&conn);
                metrics::inc_callback_panics();
                metrics::inc_connect_rollbacks();
                return Err(ServerError::CallbackPanicked {
                    callback: "on_connect",
                    message,
                });
            }
        }

        match conn.release_hold() {
            Followup::ScheduleDispatch => self.schedule_dispatch(&conn),
            Followup::Remove => {
                let _ = self.remove_connection(&conn);
            }
            Followup::Nothing => {}
        }
        Ok(conn)
    }

    /// Undo a half-finished add without running `on_close`.
    fn rollback(&self, conn: &Arc<Connection>) {
        let handle = conn.handle();
        {
            let mut table = lock(&self.connections);
            if table
                .get(&handle)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, conn))
            {
                table.remove(&handle);
                if let Err(e) = self.reactor.unregister(handle) {
                    warn!(handle, error = %e, "unregister during rollback failed");
                }
            }
        }
        conn.mark_closed();
        if let Err(e) = conn.close_socket() {
            warn!(handle, error = %e, "close during rollback failed");
        }
    }

    fn remove(&self, handle: Handle) -> Result<(), ServerError> {
        let conn = lock(&self.connections)
            .get(&handle)
            .cloned()
            .ok_or(ServerError::UnknownConnection(handle))?;
        self.remove_connection(&conn)
    }

    /// Erase, unregister, `on_close`, close. Leaves everything untouched if
    /// `conn` is not the connection currently tracked under its handle.
    fn remove_connection(&self, conn: &Arc<Connection>) -> Result<(), ServerError> {
        let handle = conn.handle();
        {
            let mut table = lock(&self.connections);
            match table.get(&handle) {
                Some(tracked) if Arc::ptr_eq(tracked, conn) => {}
                _ => return Err(ServerError::UnknownConnection(handle)),
            }
            table.remove(&handle);
            if let Err(e) = self.reactor.unregister(handle) {
                warn!(handle, error = %e, "unregister during removal failed");
            }
        }
        conn.mark_closed();

        if let Some(on_close) = self.handlers().on_close {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_close(conn))) {
                metrics::inc_callback_panics();
                error!(handle, panic = %panic_message(payload.as_ref()), "on_close panicked");
            }
        }

        if let Err(e) = conn.close_socket() {
            warn!(handle, error = %e, "close failed");
        }
        metrics::inc_connections_closed();
        debug!(handle, "connection removed");
        Ok(())
    }

    /// Connection readiness: read until would-block, queueing each chunk.
    fn read_ready(self: &Arc<Self>, conn: &Arc<Connection>) {
        let handle = conn.handle();
        let mut buf = vec![0u8; self.config.read_buf_size.max(1)];

        let outcome = {
            let socket = conn.lock_socket();
            if !socket.is_valid() {
                return;
            }
            loop {
                if conn.is_read_paused() {
                    break ReadOutcome::Paused;
                }
                match socket.recv(&mut buf) {
                    Ok(0) => break ReadOutcome::PeerClosed,
                    Ok(n) => {
                        metrics::add_bytes_received(n);
                        trace!(handle, bytes = n, "read");
                        if conn.enqueue(buf[..n].to_vec()) {
                            self.schedule_dispatch(conn);
                        }
                    }
                    Err(SocketError::Interrupted) => continue,
                    Err(SocketError::WouldBlock) => break ReadOutcome::Drained,
                    Err(e) => break ReadOutcome::Failed(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::Paused => trace!(handle, "queue full; reading paused"),
            ReadOutcome::PeerClosed => {
                debug!(handle, "peer closed");
                self.finish(conn);
            }
            ReadOutcome::Failed(e) => {
                warn!(handle, error = %e, "read failed");
                self.finish(conn);
            }
        }
    }

    fn finish(&self, conn: &Arc<Connection>) {
        if conn.request_removal() == Followup::Remove {
            let _ = self.remove_connection(conn);
        }
    }

    fn schedule_dispatch(self: &Arc<Self>, conn: &Arc<Connection>) {
        let server = Arc::downgrade(self);
        let target = conn.clone();
        let submitted = self.pool.execute(move || {
            if let Some(server) = server.upgrade() {
                server.dispatch_messages(&target);
            }
        });
        if let Err(e) = submitted {
            debug!(handle = conn.handle(), error = %e, "message dispatch not scheduled");
        }
    }

    /// Deliver queued chunks in order until the queue is empty.
    fn dispatch_messages(self: &Arc<Self>, conn: &Arc<Connection>) {
        let on_message = self.handlers().on_message;
        loop {
            match conn.next_dispatch() {
                Dispatch::Message(chunk) => {
                    metrics::inc_messages_dispatched();
                    let Some(on_message) = &on_message else {
                        continue;
                    };
                    if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(|| on_message(conn, &chunk)))
                    {
                        metrics::inc_callback_panics();
                        error!(
                            handle = conn.handle(),
                            panic = %panic_message(payload.as_ref()),
                            "on_message panicked"
                        );
                    }
                }
                // Bytes left in the kernel buffer raise no new edge.
                Dispatch::ResumeReading => self.read_ready(conn),
                Dispatch::Idle => return,
                Dispatch::Remove => {
                    let _ = self.remove_connection(conn);
                    return;
                }
            }
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut listener = lock(&self.listener);
            if listener.is_valid() {
                let _ = self.reactor.unregister(listener.handle());
                if let Err(e) = listener.close() {
                    warn!(error = %e, "closing listener failed");
                }
            }
        }

        self.reactor.shutdown();

        let remaining: Vec<Arc<Connection>> =
            lock(&self.connections).values().cloned().collect();
        for conn in &remaining {
            let _ = self.remove_connection(conn);
        }

        self.pool.shutdown();
        info!(closed = remaining.len(), "server shut down");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
