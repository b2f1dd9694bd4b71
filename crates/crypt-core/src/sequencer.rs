//! Sector-ordered write drain.
//!
//! Asynchronous crypto completions hand encrypted clones over in arbitrary
//! order; a dedicated thread re-sequences them by logical sector before
//! submission so the lower device sees ascending offsets within each drain
//! cycle. The tree is swapped out whole under its lock and walked
//! privately, which keeps inserts from racing the walk; the walk only ever
//! takes the minimum because submitting an entry may free the I/O that
//! owns it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use common::{BlockDevice, Sector};

type SubmitFn = Box<dyn FnOnce() + Send>;

struct Shared {
    /// Keyed by (sector, insertion serial): duplicates of a sector drain
    /// in arrival order.
    tree: Mutex<BTreeMap<(Sector, u64), SubmitFn>>,
    wake: Condvar,
    stop: AtomicBool,
    serial: AtomicU64,
}

pub(crate) struct WriteSequencer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteSequencer {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let shared = Arc::new(Shared {
            tree: Mutex::new(BTreeMap::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            serial: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("crypt-write".into())
            .spawn(move || loop {
                let stolen = {
                    let mut tree = worker.tree.lock().unwrap();
                    while tree.is_empty() {
                        if worker.stop.load(Ordering::Acquire) {
                            return;
                        }
                        tree = worker.wake.wait(tree).unwrap();
                    }
                    std::mem::take(&mut *tree)
                };

                dev.begin_batch();
                let mut stolen = stolen;
                while let Some((_, submit)) = stolen.pop_first() {
                    submit();
                }
                dev.end_batch();
            })
            .expect("spawn write sequencer");

        Self { shared, thread: Mutex::new(Some(thread)) }
    }

    pub fn insert(&self, sector: Sector, submit: SubmitFn) {
        let serial = self.shared.serial.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.shared.tree.lock().unwrap();
        tree.insert((sector, serial), submit);
        self.shared.wake.notify_one();
    }

    /// Drain outstanding entries and stop the thread. Safe to call twice.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WriteSequencer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
