//! Worker pools for the I/O and crypto stages.
//!
//! Two separate pools exist so that new submissions cannot starve behind
//! crypto work blocked on allocations; the io pool only ever submits, the
//! crypt pool runs conversions.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct WorkPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let thread_name = format!("{name}/{i}");
            workers.push(
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                        trace!("worker exiting");
                    })
                    .expect("spawn pool worker"),
            );
        }
        Self { tx: Mutex::new(Some(tx)), workers: Mutex::new(workers) }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Close the queue and wait for queued work to drain. Must not be
    /// called from one of the pool's own workers.
    pub fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
