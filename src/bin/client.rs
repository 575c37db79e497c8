use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(about = "Test client for the evloop echo server")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send "ping", check the echo, then "exit" and wait for the close (default)
    Smoke,
    /// Round-trip throughput with concurrent connections
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Round trips per connection
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
    },
}

fn connect(addr: &str) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream
}

/// Read until exactly `expected.len()` bytes arrived and compare.
fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    stream
        .read_exact(&mut got)
        .expect("failed to read echo reply");
    assert_eq!(
        got,
        expected,
        "reply {:?} does not match expected {:?}",
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected)
    );
}

fn main() {
    let args = Args::parse();
    let addr = format!("{}:{}", args.ip, args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Bench {
            connections,
            requests,
        } => bench_test(&addr, connections, requests),
    }
}

fn smoke_test(addr: &str) {
    eprintln!("smoke test: connecting to {}", addr);
    let mut stream = connect(addr);

    stream.write_all(b"ping").expect("failed to write");
    expect_reply(&mut stream, b"Echo: ping");
    eprintln!("  ping: OK");

    stream.write_all(b"exit").expect("failed to write");
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!(
            "expected close after exit, got {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        // A reset also means the server dropped us.
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected close after exit, got error: {}", e),
    }
    eprintln!("  exit: OK (server closed the connection)");

    eprintln!("smoke test: PASSED");
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize) {
    eprintln!(
        "bench: {} connections x {} round trips to {}",
        num_connections, requests_per_conn, addr
    );

    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|id| {
            let addr = addr.to_string();
            std::thread::spawn(move || {
                let mut stream = connect(&addr);
                // Fixed width so one request never shares a read with the next.
                let msg = format!("conn-{:04}", id % 10_000);
                let expected = format!("Echo: {}", msg);
                for _ in 0..requests_per_conn {
                    stream.write_all(msg.as_bytes()).expect("write failed");
                    expect_reply(&mut stream, expected.as_bytes());
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_connections * requests_per_conn;
    let rps = total as f64 / elapsed.as_secs_f64();
    eprintln!(
        "bench: {} round trips in {:.2}s = {:.0} req/s",
        total,
        elapsed.as_secs_f64(),
        rps
    );
}
