//! Shared data model for the sectorveil workspace.
//!
//! Everything that crosses a crate boundary lives here: sector addressing,
//! the per-I/O status channel, the request/descriptor model consumed by
//! lower block devices, and the traits the encryption core programs
//! against (`BlockDevice`, `Keyring`, `OffloadCipher`).

use std::sync::{Arc, Mutex};

use thiserror::Error;
use zeroize::Zeroizing;

/// 512-byte units are the base addressing granularity, independent of the
/// encryption sector size configured on a mapping.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Granularity of the write-path buffer pool.
pub const PAGE_SIZE: usize = 4096;

/// Sector index, in 512-byte units.
pub type Sector = u64;

/// I/O direction of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    /// Pre-flush barrier; carries no payload and bypasses encryption.
    Flush,
    Discard,
}

impl Direction {
    pub fn is_write(self) -> bool {
        matches!(self, Direction::Write)
    }
}

/// Terminal status of an I/O, mirroring the block-layer status channel.
///
/// `Protection` is reserved for integrity-tag mismatches so callers can
/// distinguish tampering from plain media errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    IoErr,
    Protection,
    Resource,
}

impl BlockStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, BlockStatus::Ok)
    }
}

/// Payload buffer shared between an upper I/O and any clones derived from
/// it. Reads decrypt in place, so the same buffer travels down to the
/// device and back up through the crypto stage.
pub type SharedBuf = Arc<Mutex<Vec<u8>>>;

pub fn shared_buf(data: Vec<u8>) -> SharedBuf {
    Arc::new(Mutex::new(data))
}

/// Sideband buffer for per-sector integrity metadata, laid out as
/// `[auth_tag | iv | reserved]` repeated per encryption sector.
pub type TagBuf = Arc<Mutex<Vec<u8>>>;

/// A run of pool-allocated pages backing an encrypted write clone.
///
/// `len` is the number of payload bytes; the final page may be partially
/// filled.
pub struct PageRun {
    pub pages: Vec<Box<[u8; PAGE_SIZE]>>,
    pub len: usize,
}

impl PageRun {
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        let mut done = 0;
        while done < src.len() {
            let pos = offset + done;
            let page = pos / PAGE_SIZE;
            let in_page = pos % PAGE_SIZE;
            let take = (PAGE_SIZE - in_page).min(src.len() - done);
            self.pages[page][in_page..in_page + take]
                .copy_from_slice(&src[done..done + take]);
            done += take;
        }
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= self.len);
        let mut done = 0;
        while done < dst.len() {
            let pos = offset + done;
            let page = pos / PAGE_SIZE;
            let in_page = pos % PAGE_SIZE;
            let take = (PAGE_SIZE - in_page).min(dst.len() - done);
            dst[done..done + take]
                .copy_from_slice(&self.pages[page][in_page..in_page + take]);
            done += take;
        }
    }
}

/// Descriptor payload: either a window into a shared flat buffer, or a run
/// of pooled pages produced by the write path.
#[derive(Clone)]
pub enum IoPayload {
    Shared(SharedBuf),
    Pages(Arc<Mutex<PageRun>>),
}

pub type DeviceCompletion = Box<dyn FnOnce(BlockStatus) + Send>;

/// A request submitted to a lower block device.
///
/// `sector` is absolute on the device. `data_offset`/`len` select the byte
/// window of the payload this request covers; for `Pages` payloads the
/// offset is always zero.
pub struct DeviceRequest {
    pub dir: Direction,
    pub sector: Sector,
    pub payload: IoPayload,
    pub data_offset: usize,
    pub len: usize,
    /// Integrity metadata travelling on the sideband channel: filled by the
    /// device on reads, persisted by it on writes.
    pub integrity: Option<TagBuf>,
    /// When set, the device performs the encryption itself and the payload
    /// is plaintext in both directions.
    pub offload: Option<Arc<dyn OffloadCipher>>,
    pub completion: DeviceCompletion,
}

/// Integrity capability advertised by a lower device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityProfile {
    /// Sideband bytes available per interval.
    pub tag_size: usize,
    /// Bytes of data each tag covers.
    pub interval: usize,
}

/// The contract the encryption core consumes from the block layer below it.
///
/// Completion may be invoked inline from `submit` or later from any device
/// context; callers must not assume either.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;
    /// Device capacity in 512-byte sectors.
    fn sectors(&self) -> Sector;
    fn integrity(&self) -> Option<IntegrityProfile> {
        None
    }
    fn submit(&self, req: DeviceRequest);
    /// Batched-submission region hints; devices may coalesce submissions
    /// issued between the two calls.
    fn begin_batch(&self) {}
    fn end_batch(&self) {}
}

/// Device-side cipher handle for hardware-offload mappings. The device
/// invokes this on the payload instead of the host running the crypto
/// pipeline.
pub trait OffloadCipher: Send + Sync {
    /// Transform `data` in place. `sector` is the absolute device sector of
    /// the first byte.
    fn transform(&self, dir: Direction, sector: Sector, data: &mut [u8]);
}

/// Key type namespace understood by the key-storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    User,
    Logon,
}

impl KeyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(KeyKind::User),
            "logon" => Some(KeyKind::Logon),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::User => "user",
            KeyKind::Logon => "logon",
        }
    }
}

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("key not found: {kind}:{description}", kind = .0.as_str(), description = .1)]
    NotFound(KeyKind, String),
    #[error("key has been revoked")]
    Revoked,
}

/// Keyring lookup by type and description, returning opaque payload bytes.
pub trait Keyring: Send + Sync {
    fn lookup(&self, kind: KeyKind, description: &str)
        -> Result<Zeroizing<Vec<u8>>, KeyringError>;
}

/// In-memory keyring used by tests and the CLI.
#[derive(Default)]
pub struct MemoryKeyring {
    entries: Mutex<Vec<(KeyKind, String, Zeroizing<Vec<u8>>)>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: KeyKind, description: &str, payload: Vec<u8>) {
        self.entries.lock().unwrap().push((
            kind,
            description.to_string(),
            Zeroizing::new(payload),
        ));
    }
}

impl Keyring for MemoryKeyring {
    fn lookup(
        &self,
        kind: KeyKind,
        description: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KeyringError> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, d, _)| *k == kind && d == description)
            .map(|(_, _, p)| p.clone())
            .ok_or_else(|| KeyringError::NotFound(kind, description.to_string()))
    }
}
