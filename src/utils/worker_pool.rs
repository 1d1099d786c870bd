//! # Worker Pool
//!
//! Fixed-size pool of OS threads that runs inbound RPC dispatch, so the decoder
//! task is never blocked by application code.
//!
//! Jobs are taken from one shared queue in submission order. A panicking job is
//! caught and logged; the worker keeps running.
//!
//! ## Usage
//! ```rust
//! use nodewire::utils::worker_pool::WorkerPool;
//!
//! let pool = WorkerPool::new("example", 2).unwrap();
//! pool.execute(|| println!("on a pool thread")).unwrap();
//! pool.shutdown();
//! ```

use crate::error::{constants, ProtocolError, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `{name}-{index}`.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ProtocolError::ConfigError(
                "Worker pool needs at least one thread".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        debug!(pool = name, size, "Worker pool started");

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| ProtocolError::Custom(constants::ERR_POOL_SHUT_DOWN.into())),
            None => Err(ProtocolError::Custom(constants::ERR_POOL_SHUT_DOWN.into())),
        }
    }

    /// Number of worker threads still attached to the pool
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting jobs, let queued jobs finish, and join the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            // A job may drop the last handle to the pool from a worker thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "Worker thread panicked outside a job");
            }
        }
        debug!(pool = %self.name, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let guard = receiver.lock();
            guard.recv()
        };

        match job {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Job panicked on worker thread");
                }
            }
            Err(_) => break,
        }
    }
}
