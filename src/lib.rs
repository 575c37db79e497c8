//! Library crate for evloop: non-blocking sockets, an MPMC ring queue, a
//! worker pool, a readiness reactor and the connection server built on them.
//!
//! The **binary** (`main.rs`) is a small echo server driving
//! [`ConnectionServer`]; `bin/client.rs` exercises it over real TCP.
//! Nothing in the library installs a tracing subscriber; see [`logging`].

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod reactor;
pub mod ring_queue;
pub mod server;
pub mod socket;
pub mod worker_pool;

pub use config::{ReactorConfig, ServerConfig};
pub use connection::Connection;
pub use error::{PoolError, ReactorError, ServerError, SocketError, TaskError};
pub use reactor::{Interest, Reactor, Readiness};
pub use ring_queue::RingQueue;
pub use server::{ConnectionServer, ServerHandle};
pub use socket::{Handle, INVALID_HANDLE, NonBlockingSocket};
pub use worker_pool::{TaskHandle, WorkerPool};
