#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Connection lifecycle (cumulative)
    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
    static CONNECT_ROLLBACKS: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static EVENTS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
    static MESSAGES_DISPATCHED: AtomicU64 = AtomicU64::new(0);
    static BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
    // Failures caught at a dispatch boundary
    static TASK_PANICS: AtomicU64 = AtomicU64::new(0);
    static CALLBACK_PANICS: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
    static MAX_ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy, Debug)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub connect_rollbacks: u64,
        pub events_dispatched: u64,
        pub messages_dispatched: u64,
        pub bytes_received: u64,
        pub task_panics: u64,
        pub callback_panics: u64,
        pub active_connections: usize,
        pub max_active_connections: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
        let v = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&MAX_ACTIVE_CONNECTIONS, v);
    }

    pub fn inc_connections_closed() {
        CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_connect_rollbacks() {
        CONNECT_ROLLBACKS.fetch_add(1, Ordering::Relaxed);
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_events_dispatched(n: usize) {
        EVENTS_DISPATCHED.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_messages_dispatched() {
        MESSAGES_DISPATCHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(n: usize) {
        BYTES_RECEIVED.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_task_panics() {
        TASK_PANICS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_callback_panics() {
        CALLBACK_PANICS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
            connect_rollbacks: CONNECT_ROLLBACKS.load(Ordering::Relaxed),
            events_dispatched: EVENTS_DISPATCHED.load(Ordering::Relaxed),
            messages_dispatched: MESSAGES_DISPATCHED.load(Ordering::Relaxed),
            bytes_received: BYTES_RECEIVED.load(Ordering::Relaxed),
            task_panics: TASK_PANICS.load(Ordering::Relaxed),
            callback_panics: CALLBACK_PANICS.load(Ordering::Relaxed),
            active_connections: ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
            max_active_connections: MAX_ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last_snap = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                let accepted_d = snap
                    .connections_accepted
                    .saturating_sub(last_snap.connections_accepted);
                let closed_d = snap
                    .connections_closed
                    .saturating_sub(last_snap.connections_closed);
                let events_d = snap
                    .events_dispatched
                    .saturating_sub(last_snap.events_dispatched);
                let msgs_d = snap
                    .messages_dispatched
                    .saturating_sub(last_snap.messages_dispatched);
                let bytes_d = snap.bytes_received.saturating_sub(last_snap.bytes_received);
                let panics_d = (snap.task_panics + snap.callback_panics)
                    .saturating_sub(last_snap.task_panics + last_snap.callback_panics);
                tracing::info!(
                    target: "evloop::metrics",
                    "metrics delta {}s: accepted={} closed={} rollbacks={} | events={} messages={} bytes={} | panics={} | gauges: active={} max_active={}",
                    INTERVAL_SECS,
                    accepted_d,
                    closed_d,
                    snap.connect_rollbacks,
                    events_d,
                    msgs_d,
                    bytes_d,
                    panics_d,
                    snap.active_connections,
                    snap.max_active_connections,
                );
                last_snap = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy, Debug)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub connect_rollbacks: u64,
        pub events_dispatched: u64,
        pub messages_dispatched: u64,
        pub bytes_received: u64,
        pub task_panics: u64,
        pub callback_panics: u64,
        pub active_connections: usize,
        pub max_active_connections: usize,
    }

    pub fn inc_connections_accepted() {}
    pub fn inc_connections_closed() {}
    pub fn inc_connect_rollbacks() {}
    pub fn add_events_dispatched(_: usize) {}
    pub fn inc_messages_dispatched() {}
    pub fn add_bytes_received(_: usize) {}
    pub fn inc_task_panics() {}
    pub fn inc_callback_panics() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: 0,
            connections_closed: 0,
            connect_rollbacks: 0,
            events_dispatched: 0,
            messages_dispatched: 0,
            bytes_received: 0,
            task_panics: 0,
            callback_panics: 0,
            active_connections: 0,
            max_active_connections: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
