//! Read workers for the KV driver
//!
//! sled reads block the calling thread and have no deadline of their own,
//! so reads are shipped to a small pool of worker threads and the caller
//! waits on the reply channel with an optional timeout.
//!
//! ```text
//! caller                 channel               worker threads
//!   │                       │                        │
//!   ├─ run(job) ───────────►│ Job ──────────────────►│ job(&keyspace)
//!   │◄── recv_timeout ──────│ reply ◄────────────────│
//! ```
//!
//! A timed out job keeps running on its worker; its reply is dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use super::keyspace::Keyspace;
use crate::error::{OvalError, Result};

type Job = Box<dyn FnOnce(&Keyspace) + Send>;

/// Pool of threads serving read jobs against one keyspace
pub struct ReadPool {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    timeout: Option<Duration>,
}

impl ReadPool {
    pub fn spawn(keyspace: Arc<Keyspace>, threads: usize, timeout: Option<Duration>) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = job_rx.clone();
            let ks = Arc::clone(&keyspace);
            let handle = thread::Builder::new()
                .name(format!("ovaldb-kv-reader-{}", i))
                .spawn(move || worker_loop(ks, rx))?;
            workers.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            workers,
            timeout,
        })
    }

    /// Run `f` on a worker and wait for its result.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Keyspace) -> Result<T> + Send + 'static,
    {
        let job_tx = self.job_tx.as_ref().ok_or(OvalError::Closed)?;
        let (reply_tx, reply_rx) = bounded::<Result<T>>(1);
        let job: Job = Box::new(move |ks| {
            let _ = reply_tx.send(f(ks));
        });
        job_tx.send(job).map_err(|_| OvalError::Closed)?;

        match self.timeout {
            Some(limit) => match reply_rx.recv_timeout(limit) {
                Ok(res) => res,
                Err(RecvTimeoutError::Timeout) => Err(OvalError::ReadTimeout(limit)),
                Err(RecvTimeoutError::Disconnected) => Err(OvalError::Closed),
            },
            None => reply_rx.recv().map_err(|_| OvalError::Closed)?,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ReadPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(keyspace: Arc<Keyspace>, job_rx: Receiver<Job>) {
    tracing::trace!("kv read worker started");
    while let Ok(job) = job_rx.recv() {
        job(&keyspace);
    }
    tracing::trace!("kv read worker stopped");
}
