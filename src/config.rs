//! Server sizing and operational configuration.
//!
//! Defaults are named constants; `ServerConfig`/`ReactorConfig` carry them
//! into the runtime and can be overridden field by field.

/// Listen backlog handed to `listen(2)`.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Readiness events fetched per `poll` call.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Threads running reactor callbacks (accept and read loops).
pub const DEFAULT_REACTOR_WORKERS: usize = 4;

/// Threads running application message callbacks.
pub const DEFAULT_DISPATCH_WORKERS: usize = 8;

/// Per-`recv` buffer size (bytes). Each chunk handed to `on_message` is at
/// most this long.
pub const READ_BUF_SIZE: usize = 4096;

/// Received chunks a connection may hold before reading pauses.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

// Compile-time sanity checks
const _: () = assert!(DEFAULT_MAX_EVENTS > 0, "poll must fetch at least one event");
const _: () = assert!(READ_BUF_SIZE > 0, "read buffer cannot be empty");
const _: () = assert!(
    DEFAULT_MAX_PENDING_MESSAGES > 0,
    "a connection must be able to queue at least one chunk"
);
const _: () = assert!(
    DEFAULT_REACTOR_WORKERS > 0 && DEFAULT_DISPATCH_WORKERS > 0,
    "pools need at least one thread"
);

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on events handled per `poll`.
    pub max_events: usize,
    /// Size of the pool that runs registration callbacks.
    pub workers: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            workers: DEFAULT_REACTOR_WORKERS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backlog: i32,
    pub reactor: ReactorConfig,
    /// Size of the pool that runs `on_message`.
    pub dispatch_workers: usize,
    pub read_buf_size: usize,
    /// Per-connection bound on queued chunks awaiting `on_message`.
    pub max_pending_messages: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            reactor: ReactorConfig::default(),
            dispatch_workers: DEFAULT_DISPATCH_WORKERS,
            read_buf_size: READ_BUF_SIZE,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }
}

impl ServerConfig {
    pub fn with_workers(reactor_workers: usize, dispatch_workers: usize) -> Self {
        Self {
            reactor: ReactorConfig {
                workers: reactor_workers,
                ..ReactorConfig::default()
            },
            dispatch_workers,
            ..Self::default()
        }
    }
}
