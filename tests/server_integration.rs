//! Integration test: ConnectionServer over real loopback TCP, driven by a
//! background poll thread.

mod common;

use std::io::Write;
use std::net::{Shutdown, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evloop::{Connection, ConnectionServer, ServerError, SocketError};

use common::{IO_TIMEOUT, drive, read_exact_bytes, small_config, wait_for_close, wait_until};

fn echo_server() -> ConnectionServer {
    let server = ConnectionServer::new(small_config()).unwrap();
    let handle = server.handle();
    server.on_message(move |conn, msg| {
        if msg.starts_with(b"exit") {
            let _ = handle.disconnect(conn);
            return;
        }
        let mut reply = b"Echo: ".to_vec();
        reply.extend_from_slice(msg);
        conn.send_all(&reply).unwrap();
    });
    server
}

#[test]
fn ping_echo_then_exit_closes_once() {
    common::init_logging();
    let server = ConnectionServer::new(small_config()).unwrap();

    let messages = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    let tracked: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));

    let handle = server.handle();
    let seen = messages.clone();
    server.on_message(move |conn, msg| {
        seen.lock().unwrap().push(msg.to_vec());
        if msg.starts_with(b"exit") {
            let _ = handle.disconnect(conn);
            return;
        }
        let mut reply = b"Echo: ".to_vec();
        reply.extend_from_slice(msg);
        conn.send_all(&reply).unwrap();
    });
    let slot = tracked.clone();
    server.on_connect(move |conn| {
        *slot.lock().unwrap() = Some(conn.clone());
    });
    let c = closes.clone();
    server.on_close(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let driver = drive(server);
    let mut client = driver.connect();

    client.write_all(b"ping").unwrap();
    assert_eq!(read_exact_bytes(&mut client, 10), b"Echo: ping");
    assert_eq!(*messages.lock().unwrap(), vec![b"ping".to_vec()]);
    assert_eq!(driver.server.connection_count(), 1);

    client.write_all(b"exit").unwrap();
    assert!(wait_for_close(&mut client));
    assert!(wait_until(IO_TIMEOUT, || closes.load(Ordering::SeqCst) == 1));
    assert_eq!(driver.server.connection_count(), 0);

    let conn = tracked.lock().unwrap().take().expect("on_connect ran");
    assert!(conn.is_closed());
    assert!(matches!(conn.send(b"late"), Err(SocketError::InvalidHandle)));

    // No second on_close, even after a while.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn many_clients_echo_concurrently() {
    let driver = drive(echo_server());
    let addr = driver.addr();

    let clients: Vec<_> = (0..8)
        .map(|id| {
            std::thread::spawn(move || {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
                let msg = format!("client-{id}");
                for _ in 0..20 {
                    stream.write_all(msg.as_bytes()).unwrap();
                    let reply = read_exact_bytes(&mut stream, 6 + msg.len());
                    assert_eq!(reply, format!("Echo: {msg}").as_bytes());
                }
            })
        })
        .collect();

    for c in clients {
        c.join().expect("client panicked");
    }
}

#[test]
fn per_connection_messages_arrive_in_order() {
    let server = ConnectionServer::new(small_config()).unwrap();
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let r = received.clone();
    server.on_message(move |_, msg| {
        // Slow handler so chunks pile up behind it.
        std::thread::sleep(Duration::from_micros(200));
        r.lock().unwrap().extend_from_slice(msg);
    });

    let driver = drive(server);
    let mut client = driver.connect();

    let mut sent = Vec::new();
    for i in 0..500u32 {
        let line = format!("{i}\n");
        client.write_all(line.as_bytes()).unwrap();
        sent.extend_from_slice(line.as_bytes());
    }

    assert!(wait_until(IO_TIMEOUT, || received.lock().unwrap().len() == sent.len()));
    assert_eq!(*received.lock().unwrap(), sent);
}

#[test]
fn bounded_queue_pauses_and_resumes_reading() {
    let config = evloop::ServerConfig {
        max_pending_messages: 2,
        read_buf_size: 8,
        ..small_config()
    };
    let server = ConnectionServer::new(config).unwrap();
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let r = received.clone();
    server.on_message(move |_, msg| {
        std::thread::sleep(Duration::from_millis(1));
        r.lock().unwrap().extend_from_slice(msg);
    });

    let driver = drive(server);
    let mut client = driver.connect();

    // Far more 8-byte chunks than the queue holds; everything already in
    // the kernel buffer must still be read once dispatch catches up.
    let payload: Vec<u8> = (0..4096u32).flat_map(|i| (i as u8).to_le_bytes()).collect();
    client.write_all(&payload).unwrap();

    assert!(wait_until(IO_TIMEOUT, || received.lock().unwrap().len() == payload.len()));
    assert_eq!(*received.lock().unwrap(), payload);
    assert_eq!(driver.server.connection_count(), 1);
}

#[test]
fn peer_close_delivers_pending_data_before_on_close() {
    let server = ConnectionServer::new(small_config()).unwrap();
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let e = events.clone();
    server.on_connect(move |_| e.lock().unwrap().push("connect".into()));
    let e = events.clone();
    server.on_message(move |_, msg| {
        e.lock()
            .unwrap()
            .push(format!("message:{}", String::from_utf8_lossy(msg)));
    });
    let e = events.clone();
    server.on_close(move |_| e.lock().unwrap().push("close".into()));

    let driver = drive(server);
    let mut client = driver.connect();
    client.write_all(b"bye").unwrap();
    client.shutdown(Shutdown::Both).unwrap();
    drop(client);

    assert!(wait_until(IO_TIMEOUT, || {
        events.lock().unwrap().last().map(String::as_str) == Some("close")
    }));
    let events = events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("connect"));
    let joined: String = events[1..events.len() - 1]
        .iter()
        .map(|m| m.trim_start_matches("message:"))
        .collect();
    assert_eq!(joined, "bye");
    assert_eq!(driver.server.connection_count(), 0);
}

#[test]
fn panicking_on_connect_rejects_client() {
    let server = ConnectionServer::new(small_config()).unwrap();
    let messages = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    server.on_connect(|_| panic!("connection refused by application"));
    let m = messages.clone();
    server.on_message(move |_, _| {
        m.fetch_add(1, Ordering::SeqCst);
    });
    let c = closes.clone();
    server.on_close(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let driver = drive(server);
    let mut client = driver.connect();
    let _ = client.write_all(b"hello");
    assert!(wait_for_close(&mut client));

    assert_eq!(driver.server.connection_count(), 0);
    assert_eq!(messages.load(Ordering::SeqCst), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    // The server keeps accepting after a rollback.
    let mut second = driver.connect();
    assert!(wait_for_close(&mut second));
}

#[test]
fn panicking_on_message_keeps_connection_alive() {
    let server = ConnectionServer::new(small_config()).unwrap();
    server.on_message(|conn, msg| {
        if msg.starts_with(b"boom") {
            panic!("bad message");
        }
        conn.send_all(msg).unwrap();
    });

    let driver = drive(server);
    let mut client = driver.connect();
    client.write_all(b"boom").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    client.write_all(b"still here").unwrap();
    assert_eq!(read_exact_bytes(&mut client, 10), b"still here");
    assert_eq!(driver.server.connection_count(), 1);
}

#[test]
fn remove_by_handle_closes_client() {
    let server = ConnectionServer::new(small_config()).unwrap();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let h = handles.clone();
    server.on_connect(move |conn| h.lock().unwrap().push(conn.handle()));

    let driver = drive(server);
    let mut client = driver.connect();
    assert!(wait_until(IO_TIMEOUT, || !handles.lock().unwrap().is_empty()));

    let fd = handles.lock().unwrap()[0];
    driver.server.remove(fd).unwrap();
    assert!(wait_for_close(&mut client));
    assert!(matches!(
        driver.server.remove(fd),
        Err(ServerError::UnknownConnection(_))
    ));
}

#[test]
fn start_fails_when_port_in_use() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = ConnectionServer::new(small_config()).unwrap();
    assert!(matches!(
        server.start("127.0.0.1", port),
        Err(ServerError::Socket(SocketError::Bind(_)))
    ));
    assert!(server.local_addr().is_none());
}

#[test]
fn shutdown_closes_clients_and_listener() {
    let server = echo_server();
    let closes = Arc::new(AtomicUsize::new(0));
    let c = closes.clone();
    server.on_close(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let driver = drive(server);
    let addr = driver.addr();
    let mut a = driver.connect();
    let mut b = driver.connect();
    assert!(wait_until(IO_TIMEOUT, || driver.server.connection_count() == 2));

    drop(driver);
    assert!(wait_for_close(&mut a));
    assert!(wait_for_close(&mut b));
    assert_eq!(closes.load(Ordering::SeqCst), 2);
    assert!(std::net::TcpStream::connect(addr).is_err());
}
