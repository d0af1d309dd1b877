//! Dedicated worker thread and delegation primitive.
//!
//! `begin_io_commit(delegate=true)` must not perform its transaction write
//! on the calling thread when that thread might itself be on the block I/O
//! submission path, since a nested submission could deadlock the
//! submission queue. The fix is a single-slot work queue plus a condition
//! variable: the caller enqueues a closure and blocks on a completion
//! instead of running the closure itself.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

thread_local! {
    static IS_WORKER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a device's dedicated worker thread.
pub fn is_worker_thread() -> bool {
    IS_WORKER_THREAD.with(|c| c.get())
}

struct Completion {
    result: Mutex<Option<Result<()>>>,
    wait: Condvar,
}

/// A single dedicated worker thread owning a one-slot work queue.
pub struct Worker {
    slot: Arc<Mutex<Option<(Job, Arc<Completion>)>>>,
    cond: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread.
    pub fn spawn() -> Self {
        let slot: Arc<Mutex<Option<(Job, Arc<Completion>)>>> = Arc::new(Mutex::new(None));
        let cond = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let slot2 = slot.clone();
        let cond2 = cond.clone();
        let shutdown2 = shutdown.clone();
        let handle = std::thread::spawn(move || {
            IS_WORKER_THREAD.with(|c| c.set(true));
            loop {
                let mut guard = slot2.lock().unwrap();
                while guard.is_none() && !shutdown2.load(Ordering::Acquire) {
                    guard = cond2.wait(guard).unwrap();
                }
                let Some((job, completion)) = guard.take() else {
                    break;
                };
                drop(guard);

                let result = job();
                *completion.result.lock().unwrap() = Some(result);
                completion.wait.notify_all();
            }
        });

        Worker {
            slot,
            cond,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Enqueue `job` on the worker and block until it completes.
    ///
    /// Returns [`Error::Invariant`] without running `job` if called from
    /// the worker thread itself — delegating to yourself cannot complete.
    pub fn delegate<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if is_worker_thread() {
            return Err(Error::invariant(
                "begin_io_commit(delegate=true) called from the worker thread itself",
            ));
        }

        let completion = Arc::new(Completion {
            result: Mutex::new(None),
            wait: Condvar::new(),
        });

        {
            let mut guard = self.slot.lock().unwrap();
            debug_assert!(guard.is_none(), "worker slot must be empty before enqueue");
            *guard = Some((Box::new(job), completion.clone()));
        }
        self.cond.notify_one();

        let mut guard = completion.result.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = completion.wait.wait(guard).unwrap();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
