//! Fixed-size thread pool draining a shared FIFO of tasks.
//!
//! Shutdown drains: every task accepted before `shutdown` is still run, then
//! the workers exit and are joined. A panicking task is caught at the pool
//! boundary and logged; the worker keeps going.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error};

use crate::error::{PoolError, TaskError, panic_message};
use crate::metrics;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    /// `None` once shutdown was requested. Dropping the sender is the stop
    /// signal: workers see a disconnect only after the queue is empty.
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, PoolError> {
        Self::with_name("worker", size)
    }

    /// Threads are named `{name}-{index}`.
    pub fn with_name(name: &str, size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let pool = Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(size)),
            size,
        };

        for id in 0..size {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || run_worker(receiver));
            match spawned {
                Ok(handle) => lock(&pool.workers).push(handle),
                Err(e) => {
                    // Threads already started exit once the sender is gone.
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        debug!(pool = %pool.name, size, "worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Queue `f` and get a handle to its result.
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            // Receiver may be gone if the caller dropped the handle.
            let _ = tx.send(outcome);
        })?;
        Ok(TaskHandle { rx })
    }

    /// Queue `f` without tracking its result.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = lock(&self.sender);
        let sender = guard.as_ref().ok_or(PoolError::Stopped)?;
        sender.send(Box::new(f)).map_err(|_| PoolError::Stopped)
    }

    /// Stop accepting work, let the workers drain the queue, then join them.
    /// Idempotent. When called from one of this pool's own threads, that
    /// thread is detached rather than joined.
    pub fn shutdown(&self) {
        drop(lock(&self.sender).take());

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread terminated abnormally");
            }
        }
        debug!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Task>) {
    // `recv` keeps returning queued tasks after the sender is dropped and
    // only errors once the queue is empty.
    while let Ok(task) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            metrics::inc_task_panics();
            error!(
                panic = %panic_message(payload.as_ref()),
                "task panicked; worker continues"
            );
        }
    }
}

/// Lock that shrugs off poisoning; every guarded value here stays
/// consistent across a panic.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Future-like handle for a submitted task's result.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Block until the task has run.
    pub fn join(self) -> Result<R, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Dropped))
    }

    /// Non-blocking check; `Err(TaskError::Pending)` while still queued or running.
    pub fn try_join(&self) -> Result<R, TaskError> {
        match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => Err(TaskError::Pending),
            Err(TryRecvError::Disconnected) => Err(TaskError::Dropped),
        }
    }
}
