use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use evloop::config::{DEFAULT_DISPATCH_WORKERS, DEFAULT_REACTOR_WORKERS};
use evloop::{ConnectionServer, ServerConfig, logging, metrics};

#[derive(Parser)]
#[command(about = "Echo server on the evloop reactor")]
struct Args {
    /// Address to listen on (IPv4 dotted quad)
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Reactor callback threads (accept and read loops)
    #[arg(long, default_value_t = DEFAULT_REACTOR_WORKERS)]
    reactor_workers: usize,

    /// Message dispatch threads
    #[arg(short, long, default_value_t = DEFAULT_DISPATCH_WORKERS)]
    workers: usize,

    /// Readiness wait per loop iteration, in milliseconds
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,
}

fn main() {
    logging::init();
    metrics::spawn_reporter();
    let args = Args::parse();

    let server = match ConnectionServer::new(ServerConfig::with_workers(
        args.reactor_workers,
        args.workers,
    )) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to build server");
            std::process::exit(1);
        }
    };

    let handle = server.handle();
    server.on_connect(|conn| {
        info!(handle = conn.handle(), peer = ?conn.peer_addr(), "client connected");
    });
    server.on_message(move |conn, msg| {
        debug!(handle = conn.handle(), bytes = msg.len(), "message");
        if msg.starts_with(b"exit") {
            if let Err(e) = handle.disconnect(conn) {
                warn!(handle = conn.handle(), error = %e, "disconnect failed");
            }
            return;
        }
        let mut reply = Vec::with_capacity(6 + msg.len());
        reply.extend_from_slice(b"Echo: ");
        reply.extend_from_slice(msg);
        if let Err(e) = conn.send_all(&reply) {
            warn!(handle = conn.handle(), error = %e, "echo failed");
        }
    });
    server.on_close(|conn| {
        info!(handle = conn.handle(), "client disconnected");
    });

    if let Err(e) = server.start(&args.ip, args.port) {
        error!(ip = %args.ip, port = args.port, error = %e, "failed to start");
        std::process::exit(1);
    }
    info!(
        addr = ?server.local_addr(),
        reactor_workers = args.reactor_workers,
        workers = args.workers,
        "evloop: ready"
    );

    let timeout = Duration::from_millis(args.poll_ms);
    loop {
        if let Err(e) = server.poll(Some(timeout)) {
            error!(error = %e, "poll failed");
            break;
        }
    }
    server.shutdown();
}
