//! Fixed-size worker pool that runs deferred CoW copies and async I/O
//! completions off the write-filter's hot path (Design Note, "Filter
//! callbacks in restricted context": "deferred CoW work runs on a
//! worker pool initialized at module load and drained at teardown").
//!
//! Grounded on `original_source/module/diff_io.c`'s
//! `queue_work(system_wq, &diff_io->notify.async.work)`: a fixed-size
//! work queue the I/O completion handler hands off to, rather than
//! running the notify callback on the interrupt/softirq path.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..threads)
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock().unwrap();
                        receiver.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break, // sender dropped, pool is shutting down
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    /// Schedules `job` to run on the pool. Panics if called after
    /// `shutdown` — callers never submit past teardown.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .expect("worker pool used after shutdown")
            .send(Box::new(job))
            .expect("worker pool threads died");
    }

    /// Drains in-flight jobs and joins every worker thread. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take(); // drop the sender, unblocks workers
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
