//! Mapping lifecycle: construct, suspend/resume, status, message, destroy.
//!
//! Construction follows a fixed order: features, cipher spec, engines,
//! key install, IV generator, integrity validation, pools, then the
//! worker fabric (io pool, crypt pool, write sequencer). Failure at any
//! step tears down what exists and leaves nothing behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use cipher_engine::{authenc_mac_alg, inner_cipher_name, CipherEngine, QueuedEngine, SoftOffload};
use common::{shared_buf, BlockDevice, BlockStatus, Direction, Keyring, OffloadCipher, Sector,
    SECTOR_SHIFT};
use iv_gen::{IvMode, IvParams};

use crate::config::{parse_cipher_spec, status_table, CipherKind, TableArgs};
use crate::convert::RateLimiter;
use crate::error::MapError;
use crate::io::{submit_io, UpperRequest};
use crate::key::{key_spec_size, KeyState};
use crate::pool::{ClonePool, PageClient, PagePool, RequestPool, TagPool, MIN_IOS,
    POOL_ENTRY_SIZE};
use crate::queue::WorkPool;
use crate::sequencer::WriteSequencer;

const TCW_WHITENING_SIZE: usize = 16;

pub(crate) struct Flags {
    pub suspended: AtomicBool,
    pub key_valid: AtomicBool,
    pub same_cpu: bool,
    pub no_offload: bool,
    pub allow_discards: bool,
    pub iv_large_sectors: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IntegrityParams {
    /// Sideband bytes per encryption sector on the lower device.
    pub on_disk_tag_size: usize,
    /// Leading bytes holding the auth tag (AEAD only).
    pub tag_size: usize,
    /// Bytes after the tag holding the stored IV.
    pub iv_size: usize,
}

struct IoAccounting {
    active: Mutex<usize>,
    idle: Condvar,
}

pub(crate) struct MappingCore {
    pub dev: Arc<dyn BlockDevice>,
    pub keyring: Arc<dyn Keyring>,
    pub start: Sector,
    pub iv_offset: u64,
    pub sector_size: usize,
    /// Extra shift on top of the 512-byte base when sectors are larger.
    pub sector_shift: u32,
    pub flags: Flags,
    pub kind: CipherKind,
    pub engines: Vec<Arc<dyn CipherEngine>>,
    pub offload: Option<Arc<dyn OffloadCipher>>,
    pub iv: RwLock<Option<IvMode>>,
    pub iv_size: usize,
    pub key: Mutex<KeyState>,
    pub cipher_string: String,
    /// Integrity profile name for status output (`aead` or `none`).
    pub cipher_auth: Option<String>,
    pub integrity: IntegrityParams,
    /// Largest I/O (512-byte sectors) a pooled tag buffer covers.
    pub tag_pool_max_sectors: usize,
    pub page_pool: PagePool,
    pub tag_pool: Option<TagPool>,
    pub clone_pool: ClonePool,
    pub req_pool: RequestPool,
    pub io_pool: WorkPool,
    crypt_pool: Option<WorkPool>,
    sequencer: Option<WriteSequencer>,
    pub protection_log: RateLimiter,
    accounting: IoAccounting,
    _page_client: PageClient,
}

impl MappingCore {
    pub(crate) fn crypt_pool(&self) -> &WorkPool {
        self.crypt_pool.as_ref().expect("crypt pool exists for host-cipher mappings")
    }

    pub(crate) fn sequencer(&self) -> &WriteSequencer {
        self.sequencer.as_ref().expect("sequencer exists for host-cipher mappings")
    }

    pub(crate) fn io_started(&self) {
        *self.accounting.active.lock().unwrap() += 1;
    }

    pub(crate) fn io_finished(&self) {
        let mut active = self.accounting.active.lock().unwrap();
        *active -= 1;
        if *active == 0 {
            self.accounting.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut active = self.accounting.active.lock().unwrap();
        while *active > 0 {
            active = self.accounting.idle.wait(active).unwrap();
        }
    }
}

/// Status report flavour, matching the two table query types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    Info,
    Table,
}

/// Aggregate pool counters, exposed for observability and tests.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub pages_allocated: usize,
    pub page_slow_hits: u64,
}

/// Construction options beyond the table line.
#[derive(Default)]
pub struct MapOptions {
    /// Route crypto through a bounded asynchronous engine queue of this
    /// depth instead of completing inline; submissions beyond the depth
    /// are backlogged.
    pub engine_queue_depth: Option<usize>,
}

/// A transparent encryption mapping over a lower block device.
pub struct Mapping {
    core: Arc<MappingCore>,
}

impl Mapping {
    pub fn new(
        args: &TableArgs,
        dev: Arc<dyn BlockDevice>,
        keyring: Arc<dyn Keyring>,
    ) -> Result<Self, MapError> {
        Self::with_options(args, dev, keyring, MapOptions::default())
    }

    pub fn with_options(
        args: &TableArgs,
        dev: Arc<dyn BlockDevice>,
        keyring: Arc<dyn Keyring>,
        opts: MapOptions,
    ) -> Result<Self, MapError> {
        let features = &args.features;
        let sector_size = features.sector_size.unwrap_or(1 << SECTOR_SHIFT);
        let sector_shift = sector_size.trailing_zeros() - SECTOR_SHIFT;

        if args.iv_offset & ((sector_size >> SECTOR_SHIFT) as u64 - 1) != 0 {
            return Err(MapError::IvOffset);
        }

        let key_size = key_spec_size(&args.key)?;
        let integrity_aead = features.integrity_aead();
        let spec = parse_cipher_spec(&args.cipher_spec, integrity_aead)?;

        // Engines. The offload pipeline still allocates one software
        // engine: it backs the device-side cipher handle and receives the
        // key like any other.
        let tfms_count = match spec.kind {
            CipherKind::Offload => 1,
            _ => spec.tfms_count,
        };
        let mut engines: Vec<Arc<dyn CipherEngine>> = Vec::with_capacity(tfms_count);
        for _ in 0..tfms_count {
            engines.push(cipher_engine::alloc_engine(&spec.api)?);
        }
        match (spec.kind, engines[0].kind()) {
            (CipherKind::Aead, cipher_engine::EngineKind::Aead) => {}
            (CipherKind::Aead, _) | (_, cipher_engine::EngineKind::Aead) => {
                return Err(MapError::CipherSpec(args.cipher_spec.clone()));
            }
            _ => {}
        }
        let offload = match spec.kind {
            CipherKind::Offload => {
                Some(Arc::new(SoftOffload::new(Arc::clone(&engines[0]))) as Arc<dyn OffloadCipher>)
            }
            _ => None,
        };

        // The offload path needs inline engines; everything else may go
        // through the asynchronous queue.
        if spec.kind != CipherKind::Offload {
            if let Some(depth) = opts.engine_queue_depth {
                engines = engines
                    .into_iter()
                    .map(|e| Arc::new(QueuedEngine::new(e, depth)) as Arc<dyn CipherEngine>)
                    .collect();
            }
        }

        // IV sizing: at least a 64-bit sector number must fit.
        let mut ivmode = spec.ivmode.clone();
        let mut iv_size = engines[0].iv_size();
        if iv_size > 0 {
            iv_size = iv_size.max(8);
        } else if ivmode.is_some() && spec.kind != CipherKind::Offload {
            warn!("selected cipher does not support IVs, ignoring IV mode");
            ivmode = None;
        }
        if spec.kind == CipherKind::Offload {
            ivmode = None;
        }

        // Key layout adjustments owed to the IV mode.
        let mut key_state = KeyState::new(key_size, tfms_count);
        let mut integrity = IntegrityParams::default();
        match ivmode.as_deref() {
            Some("lmk") => {
                // Multi-key strings with a trailing odd part carry the
                // hash seed as an extra subkey.
                if key_size % key_state.key_parts != 0 {
                    key_state.key_parts += 1;
                    key_state.key_extra_size = key_size / key_state.key_parts;
                }
            }
            Some("tcw") => {
                key_state.key_parts += 2;
                key_state.key_extra_size = iv_size + TCW_WHITENING_SIZE;
            }
            Some("random") => {
                integrity.iv_size = iv_size;
            }
            _ => {}
        }
        if integrity_aead {
            if let Some(mac) = authenc_mac_alg(&spec.api) {
                key_state.key_mac_size = cipher_engine::mac_digest_size(mac)?;
            }
        }

        // Integrity geometry and device capability.
        let mut cipher_auth = None;
        let mut tag_pool_max_sectors = 0usize;
        if let Some((on_disk, profile)) = &features.integrity {
            integrity.on_disk_tag_size = *on_disk;
            cipher_auth = Some(profile.clone());
        }
        if integrity.on_disk_tag_size > 0 || integrity.iv_size > 0 {
            let profile = dev.integrity().ok_or(MapError::IntegrityProfile)?;
            if profile.interval != sector_size {
                return Err(MapError::IntegritySectorSize);
            }
            if profile.tag_size != integrity.on_disk_tag_size {
                return Err(MapError::IntegrityTagSize);
            }
            if integrity_aead {
                integrity.tag_size = integrity
                    .on_disk_tag_size
                    .checked_sub(integrity.iv_size)
                    .ok_or(MapError::IntegritySpace)?;
                info!(
                    tag_size = integrity.tag_size,
                    iv_size = integrity.iv_size,
                    "integrity AEAD"
                );
                for engine in &engines {
                    engine
                        .set_auth_size(integrity.tag_size)
                        .map_err(|_| MapError::IntegrityAuthSize)?;
                }
            } else if integrity.iv_size > 0 {
                info!(iv_size = integrity.iv_size, "additional per-sector space for IV");
            }
            if integrity.tag_size + integrity.iv_size != integrity.on_disk_tag_size {
                return Err(MapError::IntegritySpace);
            }

            let chunk = (POOL_ENTRY_SIZE / integrity.on_disk_tag_size).max(1);
            tag_pool_max_sectors = chunk << sector_shift;
        }

        let crypt_threads = if features.same_cpu_crypt {
            1
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        };

        let core = Arc::new(MappingCore {
            dev: Arc::clone(&dev),
            keyring,
            start: args.start,
            iv_offset: args.iv_offset,
            sector_size,
            sector_shift,
            flags: Flags {
                suspended: AtomicBool::new(false),
                key_valid: AtomicBool::new(false),
                same_cpu: features.same_cpu_crypt,
                no_offload: features.submit_from_crypt_cpus,
                allow_discards: features.allow_discards,
                iv_large_sectors: features.iv_large_sectors,
            },
            kind: spec.kind,
            engines,
            offload,
            iv: RwLock::new(None),
            iv_size,
            key: Mutex::new(key_state),
            cipher_string: args.cipher_spec.clone(),
            cipher_auth,
            integrity,
            tag_pool_max_sectors,
            page_pool: PagePool::new(),
            tag_pool: (integrity.on_disk_tag_size > 0).then(|| {
                TagPool::new(
                    (tag_pool_max_sectors >> sector_shift) * integrity.on_disk_tag_size,
                )
            }),
            clone_pool: ClonePool::new(MIN_IOS),
            req_pool: RequestPool::new(),
            io_pool: WorkPool::new("crypt-io", 1),
            crypt_pool: (spec.kind != CipherKind::Offload)
                .then(|| WorkPool::new("crypt-work", crypt_threads)),
            sequencer: (spec.kind != CipherKind::Offload)
                .then(|| WriteSequencer::new(Arc::clone(&dev))),
            protection_log: RateLimiter::new(Duration::from_secs(1)),
            accounting: IoAccounting { active: Mutex::new(0), idle: Condvar::new() },
            _page_client: PageClient::register(),
        });

        // Key first, then the generator that derives state from it.
        core.install_key(&args.key).map_err(|e| match e {
            MapError::Engine(e) => MapError::Key(e.to_string()),
            other => other,
        })?;

        if let Some(name) = &ivmode {
            let key = core.key.lock().unwrap();
            let params = IvParams {
                iv_size,
                cipher_name: inner_cipher_name(&spec.api).unwrap_or("aes"),
                cipher_block_size: core.engines[0].block_size(),
                sector_size,
                key_size,
                has_seed: key.key_parts > key.tfms_count,
            };
            let mode = IvMode::construct(name, spec.ivopts.as_deref(), &params)?;
            drop(key);
            *core.iv.write().unwrap() = Some(mode);
            core.init_iv()?;
        }

        info!(
            cipher = %core.cipher_string,
            device = core.dev.name(),
            start = core.start,
            sector_size,
            "mapping constructed"
        );

        Ok(Mapping { core })
    }

    /// Parse a full table line and construct.
    pub fn from_table(
        line: &str,
        dev: Arc<dyn BlockDevice>,
        keyring: Arc<dyn Keyring>,
    ) -> Result<Self, MapError> {
        let args = TableArgs::parse(line)?;
        Mapping::new(&args, dev, keyring)
    }

    /// Submit one upper I/O. Completion may fire on any worker context.
    pub fn submit(&self, req: UpperRequest) {
        if !self.core.flags.key_valid.load(Ordering::SeqCst)
            && !matches!(req.dir, Direction::Flush | Direction::Discard)
        {
            self.core.io_started();
            (req.completion)(BlockStatus::IoErr);
            self.core.io_finished();
            return;
        }
        submit_io(&self.core, req);
    }

    /// Synchronous read helper.
    pub fn read_at(&self, sector: Sector, len: usize) -> Result<Vec<u8>, BlockStatus> {
        let data = shared_buf(vec![0u8; len]);
        let (tx, rx) = std::sync::mpsc::channel();
        self.submit(UpperRequest {
            dir: Direction::Read,
            sector,
            data: Arc::clone(&data),
            completion: Box::new(move |status| {
                let _ = tx.send(status);
            }),
        });
        match rx.recv().unwrap_or(BlockStatus::IoErr) {
            BlockStatus::Ok => Ok(std::mem::take(&mut *data.lock().unwrap())),
            err => Err(err),
        }
    }

    /// Synchronous write helper.
    pub fn write_at(&self, sector: Sector, payload: &[u8]) -> Result<(), BlockStatus> {
        let data = shared_buf(payload.to_vec());
        let (tx, rx) = std::sync::mpsc::channel();
        self.submit(UpperRequest {
            dir: Direction::Write,
            sector,
            data,
            completion: Box::new(move |status| {
                let _ = tx.send(status);
            }),
        });
        match rx.recv().unwrap_or(BlockStatus::IoErr) {
            BlockStatus::Ok => Ok(()),
            err => Err(err),
        }
    }

    /// Quiesce outstanding I/O and gate key manipulation open.
    pub fn suspend(&self) {
        self.core.wait_idle();
        self.core.flags.suspended.store(true, Ordering::SeqCst);
    }

    /// Leave the suspended state; refused while no valid key is installed.
    pub fn resume(&self) -> Result<(), MapError> {
        if !self.core.flags.key_valid.load(Ordering::SeqCst) {
            return Err(MapError::KeyNotSet);
        }
        self.core.flags.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.core.flags.suspended.load(Ordering::SeqCst)
    }

    pub fn status(&self, kind: StatusType) -> String {
        match kind {
            StatusType::Info => String::new(),
            StatusType::Table => status_table(&self.core),
        }
    }

    /// Control messages: `key set <spec>` and `key wipe`, both only while
    /// suspended.
    pub fn message(&self, msg: &str) -> Result<(), MapError> {
        let words: Vec<&str> = msg.split_whitespace().collect();
        match words.as_slice() {
            ["key", rest @ ..] => {
                if !self.is_suspended() {
                    return Err(MapError::NotSuspended);
                }
                match rest {
                    ["set", spec] => {
                        let size = key_spec_size(spec)?;
                        if size != self.core.key.lock().unwrap().key_size {
                            return Err(MapError::Key("key size may not change".into()));
                        }
                        self.core.install_key(spec)
                    }
                    ["wipe"] => self.core.wipe_key(),
                    _ => Err(MapError::UnknownMessage),
                }
            }
            _ => Err(MapError::UnknownMessage),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            pages_allocated: self.core.page_pool.allocated(),
            page_slow_hits: self.core.page_pool.slow_hits(),
        }
    }

    /// Cap the page pool for pressure testing or tuning; zero restores
    /// the fair share.
    pub fn set_page_pool_limit(&self, pages: usize) {
        self.core.page_pool.set_limit(pages);
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Let in-flight I/O finish, then stop the fabric in dependency
        // order: no new submissions, no crypto, then the sequencer.
        self.core.wait_idle();
        self.core.io_pool.shutdown();
        if let Some(pool) = &self.core.crypt_pool {
            pool.shutdown();
        }
        if let Some(seq) = &self.core.sequencer {
            seq.shutdown();
        }

        let leaked = self.core.page_pool.allocated();
        if leaked != 0 {
            warn!(pages = leaked, "page pool not empty at destroy");
        }
    }
}
