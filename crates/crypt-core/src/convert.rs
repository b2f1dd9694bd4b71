//! The converter: drives one I/O's sectors through a cipher engine.
//!
//! Engines complete inline, asynchronously, or after backlogging; the loop
//! handles all three. A backlogged submission parks the converter on the
//! context's restart gate until the engine signals that the request began
//! processing (the first of its two completion events). The context's
//! pending counter starts at one so the loop's own reference holds the
//! conversion open until the caller drops it.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use cipher_engine::{CipherRequest, CryptOp, EngineCallback, EngineError, EngineEvent, SubmitStatus};
use common::{BlockStatus, SECTOR_SHIFT};

use crate::io::{self, CryptIo};
use crate::request::{build_job, finish_job, JobMeta};

/// Suppresses repeat integrity-failure logging; one line per interval with
/// a count of what was dropped.
pub(crate) struct RateLimiter {
    interval: Duration,
    state: Mutex<(Option<Instant>, u64)>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, state: Mutex::new((None, 0)) }
    }

    fn allow(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match state.0 {
            Some(last) if now.duration_since(last) < self.interval => {
                state.1 += 1;
                None
            }
            _ => {
                state.0 = Some(now);
                Some(std::mem::take(&mut state.1))
            }
        }
    }
}

fn log_protection(io: &CryptIo, sector: u64) {
    if let Some(suppressed) = io.core.protection_log.allow() {
        warn!(sector, suppressed, "integrity tag mismatch");
    }
}

fn engine_status(err: &EngineError) -> BlockStatus {
    match err {
        EngineError::BadTag => BlockStatus::Protection,
        _ => BlockStatus::IoErr,
    }
}

fn make_callback(io: Arc<CryptIo>, meta: Arc<Mutex<Option<JobMeta>>>) -> EngineCallback {
    Box::new(move |event| match event {
        EngineEvent::Restarted => io.ctx.restart.signal(),
        EngineEvent::Finished(req, result) => {
            if let Some(meta) = meta.lock().unwrap().take() {
                async_done(&io, meta, req, result);
            }
        }
    })
}

/// Completion path for asynchronously finished requests; also routes the
/// I/O onward when the last pending request resolves.
fn async_done(
    io: &Arc<CryptIo>,
    mut meta: JobMeta,
    req: CipherRequest,
    result: Result<(), EngineError>,
) {
    let status = match result {
        Ok(()) => match finish_job(io, &mut meta, req) {
            Ok(shell) => {
                io.core.req_pool.put(shell);
                BlockStatus::Ok
            }
            Err(status) => status,
        },
        Err(err) => {
            let status = engine_status(&err);
            if status == BlockStatus::Protection {
                log_protection(io, meta.sector);
            }
            io.core.req_pool.put(req);
            status
        }
    };
    io.latch_error(status);

    if io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        if io.dir.is_write() {
            io::write_io_submit(io, true);
        } else {
            io.dec_pending();
        }
    }
}

/// Encrypt or decrypt the I/O window sector by sector.
///
/// Returns the first hard failure; asynchronous failures latch into the
/// I/O's sticky error instead.
pub(crate) fn convert(io: &Arc<CryptIo>) -> BlockStatus {
    let core = Arc::clone(&io.core);
    let sector_step = (core.sector_size >> SECTOR_SHIFT) as u64;
    let op = if io.dir.is_write() { CryptOp::Encrypt } else { CryptOp::Decrypt };
    let engine_mask = core.engines.len() as u64 - 1;

    io.ctx.cc_pending.store(1, Ordering::SeqCst);

    let mut cc_sector = io.sector + core.iv_offset;
    let mut offset = 0usize;
    let mut tag_offset = 0usize;
    let mut shell: Option<CipherRequest> = None;

    while offset < io.len {
        let req = shell.take().unwrap_or_else(|| core.req_pool.get());
        io.ctx.cc_pending.fetch_add(1, Ordering::AcqRel);

        let (req, meta) = match build_job(io, req, cc_sector, tag_offset, offset) {
            Ok(built) => built,
            Err(status) => {
                io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel);
                return status;
            }
        };

        let engine = &core.engines[(cc_sector & engine_mask) as usize];
        let meta = Arc::new(Mutex::new(Some(meta)));
        let callback = make_callback(Arc::clone(io), Arc::clone(&meta));

        match engine.process(op, req, callback) {
            SubmitStatus::Completed(req, Ok(())) => {
                let mut meta = meta
                    .lock()
                    .unwrap()
                    .take()
                    .expect("inline completion leaves meta untouched");
                match finish_job(io, &mut meta, req) {
                    Ok(returned) => shell = Some(returned),
                    Err(status) => {
                        io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel);
                        return status;
                    }
                }
                io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel);
                std::thread::yield_now();
            }
            SubmitStatus::Completed(req, Err(err)) => {
                let status = engine_status(&err);
                if status == BlockStatus::Protection {
                    log_protection(io, cc_sector - core.iv_offset);
                }
                core.req_pool.put(req);
                io.ctx.cc_pending.fetch_sub(1, Ordering::AcqRel);
                return status;
            }
            SubmitStatus::InFlight => {}
            SubmitStatus::Backlogged => {
                // The driver queued the request but its input queue was
                // full; wait for the restart event before feeding more.
                io.ctx.restart.wait();
            }
        }

        cc_sector += sector_step;
        offset += core.sector_size;
        tag_offset += 1;
    }

    BlockStatus::Ok
}
