//! Per-I/O stage machine.
//!
//! Every upper I/O becomes one or more [`CryptIo`] contexts routed
//! read → crypt → write across the mapping's pools: reads clone down to
//! the device first and decrypt on completion, writes encrypt into pooled
//! pages and hand the clone to the write sequencer. A pending counter
//! governs the context's lifetime; the final decrement reports the sticky
//! error upstream and releases resources.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use common::{
    BlockStatus, DeviceRequest, Direction, IoPayload, PageRun, Sector, SharedBuf, TagBuf,
    PAGE_SIZE, SECTOR_SHIFT,
};

use crate::config::CipherKind;
use crate::convert::convert;
use crate::mapping::MappingCore;
use crate::pool::{MAX_RUN_PAGES, TAG_HEAP_LIMIT};

pub type IoCompletion = Box<dyn FnOnce(BlockStatus) + Send>;

/// An I/O submitted by the upper block client.
pub struct UpperRequest {
    pub dir: Direction,
    pub sector: Sector,
    pub data: SharedBuf,
    pub completion: IoCompletion,
}

fn status_code(status: BlockStatus) -> u8 {
    match status {
        BlockStatus::Ok => 0,
        BlockStatus::IoErr => 1,
        BlockStatus::Protection => 2,
        BlockStatus::Resource => 3,
    }
}

fn status_from_code(code: u8) -> BlockStatus {
    match code {
        0 => BlockStatus::Ok,
        1 => BlockStatus::IoErr,
        2 => BlockStatus::Protection,
        _ => BlockStatus::Resource,
    }
}

/// Signal raised by the engine when a backlogged request starts
/// processing; the converter parks here.
pub(crate) struct RestartGate {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl RestartGate {
    fn new() -> Self {
        Self { fired: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cv.wait(fired).unwrap();
        }
        *fired = false;
    }

    pub fn signal(&self) {
        *self.fired.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

pub(crate) struct Conversion {
    pub cc_pending: AtomicU32,
    pub restart: RestartGate,
    /// Output pages for writes; reads transform in place.
    pub out_run: Mutex<Option<Arc<Mutex<PageRun>>>>,
}

pub(crate) struct TagAlloc {
    pub buf: TagBuf,
    pub from_pool: bool,
}

pub(crate) struct CryptIo {
    pub core: Arc<MappingCore>,
    pub dir: Direction,
    /// Logical start sector within the mapping, 512-byte units.
    pub sector: Sector,
    pub data: SharedBuf,
    pub data_offset: usize,
    pub len: usize,
    pending: AtomicU32,
    error: AtomicU8,
    upstream: Mutex<Option<IoCompletion>>,
    integrity: Mutex<Option<TagAlloc>>,
    pub ctx: Conversion,
}

impl CryptIo {
    fn new(
        core: Arc<MappingCore>,
        dir: Direction,
        sector: Sector,
        data: SharedBuf,
        data_offset: usize,
        len: usize,
        upstream: IoCompletion,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            dir,
            sector,
            data,
            data_offset,
            len,
            pending: AtomicU32::new(0),
            error: AtomicU8::new(0),
            upstream: Mutex::new(Some(upstream)),
            integrity: Mutex::new(None),
            ctx: Conversion {
                cc_pending: AtomicU32::new(0),
                restart: RestartGate::new(),
                out_run: Mutex::new(None),
            },
        })
    }

    pub(crate) fn latch_error(&self, status: BlockStatus) {
        if !status.is_ok() {
            let _ = self.error.compare_exchange(
                0,
                status_code(status),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    pub(crate) fn status(&self) -> BlockStatus {
        status_from_code(self.error.load(Ordering::Acquire))
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// The final decrement frees resources and completes upstream.
    pub(crate) fn dec_pending(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if let Some(tags) = self.integrity.lock().unwrap().take() {
            if tags.from_pool {
                if let Some(pool) = &self.core.tag_pool {
                    pool.free_tagbuf(&tags.buf);
                }
            }
        }

        let status = self.status();
        if let Some(done) = self.upstream.lock().unwrap().take() {
            done(status);
        }
        self.core.io_finished();
    }

    pub(crate) fn integrity_buf(&self) -> Option<TagBuf> {
        self.integrity.lock().unwrap().as_ref().map(|t| Arc::clone(&t.buf))
    }
}

/// Entry point from the mapping: validate, split, and route one upper I/O.
pub(crate) fn submit_io(core: &Arc<MappingCore>, req: UpperRequest) {
    core.io_started();
    let UpperRequest { dir, sector, data, completion } = req;
    let finish_direct = |status: BlockStatus, completion: IoCompletion| {
        completion(status);
        core.io_finished();
    };

    // Pre-flush and discard bypass the crypto pipeline entirely.
    if matches!(dir, Direction::Flush | Direction::Discard) {
        if dir == Direction::Discard && !core.flags.allow_discards {
            return finish_direct(BlockStatus::IoErr, completion);
        }
        let len = data.lock().unwrap().len();
        let core2 = Arc::clone(core);
        core.dev.submit(DeviceRequest {
            dir,
            sector: core.start + sector,
            payload: IoPayload::Shared(data),
            data_offset: 0,
            len,
            integrity: None,
            offload: None,
            completion: Box::new(move |status| {
                completion(status);
                core2.io_finished();
            }),
        });
        return;
    }

    let len = data.lock().unwrap().len();
    if len == 0 {
        return finish_direct(BlockStatus::Ok, completion);
    }

    // Both the start sector and the byte length must align to the
    // encryption sector size.
    let sector_mask = (core.sector_size >> SECTOR_SHIFT) as u64 - 1;
    if sector & sector_mask != 0 || len & (core.sector_size - 1) != 0 {
        return finish_direct(BlockStatus::IoErr, completion);
    }

    // Oversize I/Os are split so each piece fits the page pool's maximum
    // run (and, when tags overflow the heap threshold, a pooled tag
    // buffer). The remainder is re-delivered as further children.
    let on_disk = core.integrity.on_disk_tag_size;
    let mut chunk_len = usize::MAX;
    let mut tags_from_pool = false;
    if dir.is_write() || on_disk > 0 {
        chunk_len = MAX_RUN_PAGES * PAGE_SIZE;
    }
    if on_disk > 0 {
        let total_tag_len = on_disk * (len >> (SECTOR_SHIFT + core.sector_shift));
        if total_tag_len > TAG_HEAP_LIMIT {
            tags_from_pool = true;
            chunk_len = chunk_len.min(core.tag_pool_max_sectors << SECTOR_SHIFT);
        }
    }

    if len <= chunk_len {
        let io = CryptIo::new(Arc::clone(core), dir, sector, data, 0, len, completion);
        attach_integrity(core, &io, tags_from_pool);
        route(core, io);
        return;
    }

    // Parent aggregator: the upper completion fires once every child is
    // done, with the first latched error.
    struct SplitParent {
        remaining: AtomicU32,
        error: AtomicU8,
        done: Mutex<Option<IoCompletion>>,
    }
    let chunks = len.div_ceil(chunk_len);
    let parent = Arc::new(SplitParent {
        remaining: AtomicU32::new(chunks as u32),
        error: AtomicU8::new(0),
        done: Mutex::new(Some(completion)),
    });

    let mut offset = 0usize;
    while offset < len {
        let child_len = chunk_len.min(len - offset);
        let parent = Arc::clone(&parent);
        let child_done: IoCompletion = Box::new(move |status| {
            if !status.is_ok() {
                let _ = parent.error.compare_exchange(
                    0,
                    status_code(status),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            if parent.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(done) = parent.done.lock().unwrap().take() {
                    done(status_from_code(parent.error.load(Ordering::Acquire)));
                }
            }
        });

        // Children count as independent I/Os for accounting; the entry
        // inc above covers only the first.
        if offset > 0 {
            core.io_started();
        }
        let io = CryptIo::new(
            Arc::clone(core),
            dir,
            sector + (offset >> SECTOR_SHIFT) as u64,
            Arc::clone(&data),
            offset,
            child_len,
            child_done,
        );
        attach_integrity(core, &io, tags_from_pool);
        route(core, io);
        offset += child_len;
    }
}

fn attach_integrity(core: &Arc<MappingCore>, io: &Arc<CryptIo>, from_pool: bool) {
    let on_disk = core.integrity.on_disk_tag_size;
    if on_disk == 0 {
        return;
    }
    let tag_len = on_disk * (io.len >> (SECTOR_SHIFT + core.sector_shift));
    let buf: TagBuf = if from_pool {
        let pool = core.tag_pool.as_ref().expect("tag pool configured");
        Arc::new(Mutex::new(pool.alloc()))
    } else {
        Arc::new(Mutex::new(vec![0u8; tag_len]))
    };
    *io.integrity.lock().unwrap() = Some(TagAlloc { buf, from_pool });
}

fn route(core: &Arc<MappingCore>, io: Arc<CryptIo>) {
    match (core.kind, io.dir) {
        // Offloaded mappings submit directly in both directions; the
        // device runs the cipher.
        (CipherKind::Offload, _) | (_, Direction::Read) => {
            if !io_read(&io, false) {
                queue_read(core, io);
            }
        }
        (_, _) => {
            let io2 = Arc::clone(&io);
            core.crypt_pool().execute(move || crypt_write_convert(&io2));
        }
    }
}

/// Clone the descriptor and send it to the underlying device. Returns
/// false when no clone slot was available in non-blocking mode.
pub(crate) fn io_read(io: &Arc<CryptIo>, blocking: bool) -> bool {
    let core = &io.core;
    let acquired =
        if blocking { core.clone_pool.acquire_timeout() } else { core.clone_pool.try_acquire() };
    if !acquired {
        return false;
    }

    io.inc_pending();
    let io2 = Arc::clone(io);
    let offload = match core.kind {
        CipherKind::Offload => core.offload.clone(),
        _ => None,
    };

    core.dev.submit(DeviceRequest {
        dir: io.dir,
        sector: core.start + io.sector,
        payload: IoPayload::Shared(Arc::clone(&io.data)),
        data_offset: io.data_offset,
        len: io.len,
        integrity: io.integrity_buf(),
        offload,
        completion: Box::new(move |status| clone_endio(io2, status)),
    });
    true
}

/// Device completion for read/offload clones.
fn clone_endio(io: Arc<CryptIo>, status: BlockStatus) {
    let core = Arc::clone(&io.core);
    core.clone_pool.release();

    if status.is_ok() && io.dir == Direction::Read && core.kind != CipherKind::Offload {
        // Decrypt off the device-completion context.
        core.crypt_pool().execute(move || crypt_read_convert(&io));
        return;
    }

    io.latch_error(status);
    io.dec_pending();
}

/// Retry the clone submission from the io pool where blocking is allowed.
fn queue_read(core: &Arc<MappingCore>, io: Arc<CryptIo>) {
    core.io_pool.execute(move || {
        io.inc_pending();
        if !io_read(&io, true) {
            io.latch_error(BlockStatus::Resource);
        }
        io.dec_pending();
    });
}

fn free_out_run(io: &CryptIo) {
    if let Some(run) = io.ctx.out_run.lock().unwrap().take() {
        match Arc::try_unwrap(run) {
            Ok(run) => io.core.page_pool.free_run(run.into_inner().unwrap()),
            Err(shared) => {
                // A device still holds the payload; swap the pages out.
                let mut run = shared.lock().unwrap();
                let stolen = std::mem::replace(&mut *run, PageRun { pages: Vec::new(), len: 0 });
                io.core.page_pool.free_run(stolen);
            }
        }
    }
}

/// Crypt-pool stage for writes: allocate the clone, run the converter,
/// then submit (inline) or let the async completion path submit.
pub(crate) fn crypt_write_convert(io: &Arc<CryptIo>) {
    let core = &io.core;
    io.inc_pending();

    let run = core.page_pool.alloc_run(io.len);
    *io.ctx.out_run.lock().unwrap() = Some(Arc::new(Mutex::new(run)));

    io.inc_pending();
    let status = convert(io);
    if !status.is_ok() {
        io.latch_error(status);
    }

    if io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        write_io_submit(io, false);
    }
    io.dec_pending();
}

/// Hand a finished write clone to the sequencer, or straight to the
/// device when crypto completed inline and the mapping submits from crypt
/// context.
pub(crate) fn write_io_submit(io: &Arc<CryptIo>, async_completion: bool) {
    let core = &io.core;

    if !io.status().is_ok() {
        free_out_run(io);
        io.dec_pending();
        return;
    }

    let io2 = Arc::clone(io);
    let submit: Box<dyn FnOnce() + Send> = Box::new(move || submit_write_clone(io2));

    if !async_completion && core.flags.no_offload {
        submit();
        return;
    }
    core.sequencer().insert(io.sector, submit);
}

fn submit_write_clone(io: Arc<CryptIo>) {
    let core = Arc::clone(&io.core);
    let run = io
        .ctx
        .out_run
        .lock()
        .unwrap()
        .clone()
        .expect("submitted write carries its clone");

    let io2 = Arc::clone(&io);
    core.dev.submit(DeviceRequest {
        dir: Direction::Write,
        sector: core.start + io.sector,
        payload: IoPayload::Pages(run),
        data_offset: 0,
        len: io.len,
        integrity: io.integrity_buf(),
        offload: None,
        completion: Box::new(move |status| {
            free_out_run(&io2);
            io2.latch_error(status);
            io2.dec_pending();
        }),
    });
}

/// Crypt-pool stage for reads: decrypt in place after the device filled
/// the shared buffer.
pub(crate) fn crypt_read_convert(io: &Arc<CryptIo>) {
    io.inc_pending();

    let status = convert(io);
    if !status.is_ok() {
        io.latch_error(status);
    }

    if io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        io.dec_pending();
    }
    io.dec_pending();
}
