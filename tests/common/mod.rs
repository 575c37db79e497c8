#![allow(dead_code)]

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use evloop::config::ReactorConfig;
use evloop::{ConnectionServer, ServerConfig};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn small_config() -> ServerConfig {
    ServerConfig {
        reactor: ReactorConfig {
            max_events: 32,
            workers: 2,
        },
        dispatch_workers: 4,
        ..ServerConfig::default()
    }
}

pub fn init_logging() {
    evloop::logging::init_with_default("evloop=debug");
}

/// Drives `poll` on a background thread until dropped.
pub struct Driver {
    pub server: Arc<ConnectionServer>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr().expect("server not started")
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr()).expect("connect");
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        stream
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        self.server.shutdown();
    }
}

/// Start `server` on an ephemeral loopback port and poll it every 10ms.
pub fn drive(server: ConnectionServer) -> Driver {
    server.start("127.0.0.1", 0).expect("start");
    let server = Arc::new(server);
    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let server = server.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("test-poll".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    server
                        .poll(Some(Duration::from_millis(10)))
                        .expect("poll");
                }
            })
            .expect("spawn poll thread")
    };
    Driver {
        server,
        stop,
        thread: Some(thread),
    }
}

/// Read exactly `len` bytes or panic after `IO_TIMEOUT`.
pub fn read_exact_bytes(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read reply");
    buf
}

/// True once the peer closed (EOF or reset) within `IO_TIMEOUT`.
pub fn wait_for_close(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

/// Spin until `cond` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
