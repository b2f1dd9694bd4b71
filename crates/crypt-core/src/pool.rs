//! Per-mapping memory pools.
//!
//! The page pool backs encrypted write clones. Its budget is a fair share
//! of system memory split across all live mappings, and allocation is
//! two-phase to dodge the classic N-mapping deadlock where each holds half
//! its pages and waits for the rest: a lock-free attempt that respects the
//! budget, then a serialised fallback that does not. Only the fallback
//! takes the mutex, so the fast path stays contention-free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::debug;

use common::{PageRun, TagBuf, PAGE_SIZE};

use cipher_engine::CipherRequest;

/// Minimum number of concurrent clone descriptors and pooled entries.
pub(crate) const MIN_IOS: usize = 64;
/// Largest run a single clone may cover, in pages.
pub(crate) const MAX_RUN_PAGES: usize = 256;
/// Sizing unit for pooled integrity-tag buffers.
pub(crate) const POOL_ENTRY_SIZE: usize = 512;
/// Heap allocations above this fall back to the tag pool.
pub(crate) const TAG_HEAP_LIMIT: usize = 128 * 1024;

const MEMORY_PERCENT: usize = 2;
const MIN_PAGES_PER_CLIENT: usize = MAX_RUN_PAGES * 16;

static CLIENTS: Mutex<usize> = Mutex::new(0);
static PAGES_PER_CLIENT: AtomicUsize = AtomicUsize::new(usize::MAX);

fn total_memory_pages() -> usize {
    // MemTotal is in kB.
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<usize>().ok())
                {
                    return (kb * 1024) / PAGE_SIZE;
                }
            }
        }
    }
    // Fallback: assume 2 GiB.
    (2 << 30) / PAGE_SIZE
}

fn recalculate_pages_per_client(clients: usize) {
    if clients == 0 {
        return;
    }
    let pages = (total_memory_pages() * MEMORY_PERCENT / 100 / clients)
        .max(MIN_PAGES_PER_CLIENT);
    PAGES_PER_CLIENT.store(pages, Ordering::Relaxed);
}

/// Joins the process-wide accounting of mappings; the fair page share is
/// recomputed whenever a mapping comes or goes.
pub(crate) struct PageClient;

impl PageClient {
    pub fn register() -> Self {
        let mut clients = CLIENTS.lock().unwrap();
        *clients += 1;
        recalculate_pages_per_client(*clients);
        PageClient
    }
}

impl Drop for PageClient {
    fn drop(&mut self) {
        let mut clients = CLIENTS.lock().unwrap();
        *clients -= 1;
        recalculate_pages_per_client(*clients);
    }
}

pub(crate) struct PagePool {
    allocated: AtomicUsize,
    free: Mutex<Vec<Box<[u8; PAGE_SIZE]>>>,
    slow_lock: Mutex<()>,
    slow_hits: AtomicU64,
    /// Overrides the fair share when set; used for tuning and pressure
    /// testing.
    limit_override: AtomicUsize,
}

impl PagePool {
    pub fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
            slow_lock: Mutex::new(()),
            slow_hits: AtomicU64::new(0),
            limit_override: AtomicUsize::new(0),
        }
    }

    fn limit(&self) -> usize {
        match self.limit_override.load(Ordering::Relaxed) {
            0 => PAGES_PER_CLIENT.load(Ordering::Relaxed),
            n => n,
        }
    }

    pub fn set_limit(&self, pages: usize) {
        self.limit_override.store(pages, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn slow_hits(&self) -> u64 {
        self.slow_hits.load(Ordering::Relaxed)
    }

    fn take_page(&self, enforce_limit: bool) -> Option<Box<[u8; PAGE_SIZE]>> {
        if enforce_limit && self.allocated.load(Ordering::Relaxed) >= self.limit() {
            return None;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().unwrap().pop();
        Some(recycled.unwrap_or_else(|| Box::new([0u8; PAGE_SIZE])))
    }

    fn give_back(&self, pages: Vec<Box<[u8; PAGE_SIZE]>>) {
        let count = pages.len();
        let mut free = self.free.lock().unwrap();
        for page in pages {
            if free.len() < MIN_IOS * MAX_RUN_PAGES {
                free.push(page);
            }
        }
        drop(free);
        self.allocated.fetch_sub(count, Ordering::Relaxed);
    }

    /// Allocate pages for a `len`-byte clone.
    ///
    /// The first attempt is non-blocking and budget-checked; on failure the
    /// partial allocation is returned and the whole run is retried under
    /// the slow-path mutex with the budget ignored.
    pub fn alloc_run(&self, len: usize) -> PageRun {
        let n = len.div_ceil(PAGE_SIZE);

        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            match self.take_page(true) {
                Some(page) => pages.push(page),
                None => {
                    self.give_back(std::mem::take(&mut pages));
                    break;
                }
            }
        }
        if pages.len() == n {
            return PageRun { pages, len };
        }

        let _guard = self.slow_lock.lock().unwrap();
        self.slow_hits.fetch_add(1, Ordering::Relaxed);
        debug!(pages = n, "page pool fast path exhausted, serialised retry");
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            // The serialised path never fails; the budget is advisory here.
            pages.push(self.take_page(false).expect("unbounded page"));
        }
        PageRun { pages, len }
    }

    pub fn free_run(&self, run: PageRun) {
        self.give_back(run.pages);
    }
}

/// Pooled integrity-metadata buffers for I/Os whose tag area is too large
/// for an ordinary heap allocation.
pub(crate) struct TagPool {
    entry_size: usize,
    entries: Mutex<Vec<Vec<u8>>>,
}

impl TagPool {
    pub fn new(entry_size: usize) -> Self {
        Self { entry_size, entries: Mutex::new(Vec::new()) }
    }

    pub fn alloc(&self) -> Vec<u8> {
        self.entries
            .lock()
            .unwrap()
            .pop()
            .map(|mut buf| {
                buf.fill(0);
                buf
            })
            .unwrap_or_else(|| vec![0u8; self.entry_size])
    }

    pub fn free(&self, buf: Vec<u8>) {
        if buf.len() != self.entry_size {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.len() < MIN_IOS {
            entries.push(buf);
        }
    }

    pub fn free_tagbuf(&self, buf: &TagBuf) {
        let data = std::mem::take(&mut *buf.lock().unwrap());
        self.free(data);
    }
}

/// Bounds the number of clone descriptors in flight, with a non-blocking
/// acquire for the NOWAIT submission path.
pub(crate) struct ClonePool {
    permits: Mutex<usize>,
    returned: Condvar,
}

impl ClonePool {
    pub fn new(permits: usize) -> Self {
        Self { permits: Mutex::new(permits), returned: Condvar::new() }
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Blocking acquire with a deadline; repeated exhaustion surfaces as a
    /// resource failure rather than an indefinite stall.
    pub fn acquire_timeout(&self) -> bool {
        let deadline = std::time::Duration::from_secs(30);
        let start = std::time::Instant::now();
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(remaining) => remaining,
                None => return false,
            };
            let (guard, timeout) = self.returned.wait_timeout(permits, remaining).unwrap();
            permits = guard;
            if timeout.timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.permits.lock().unwrap() += 1;
        self.returned.notify_one();
    }
}

/// Recycled request shells so the converter does not allocate three
/// buffers per sector.
pub(crate) struct RequestPool {
    shells: Mutex<VecDeque<CipherRequest>>,
}

impl RequestPool {
    pub fn new() -> Self {
        let mut shells = VecDeque::with_capacity(MIN_IOS);
        for _ in 0..MIN_IOS {
            shells.push_back(CipherRequest::empty());
        }
        Self { shells: Mutex::new(shells) }
    }

    pub fn get(&self) -> CipherRequest {
        self.shells
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(CipherRequest::empty)
    }

    pub fn put(&self, mut req: CipherRequest) {
        req.data.clear();
        req.iv.clear();
        req.tag.clear();
        let mut shells = self.shells.lock().unwrap();
        if shells.len() < MIN_IOS {
            shells.push_back(req);
        }
    }
}
