//! Simulated lower block devices for the encryption layer.
//!
//! [`RamDevice`] is the workhorse for tests: a memory-backed sector store
//! with an optional per-sector integrity sideband, inline or
//! completion-thread delivery, batch-region counters, a submission log
//! and fault injection. [`FileDevice`] persists the same layout to a
//! backing file with a JSON metadata sidecar.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::{
    BlockDevice, BlockStatus, DeviceRequest, Direction, IntegrityProfile, IoPayload, Sector,
    SECTOR_SHIFT,
};

/// How completions are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Complete on the submitting thread, inside `submit`.
    Inline,
    /// Complete in submission order on a dedicated thread.
    Threaded,
}

/// One record per submitted request, for assertions about ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub dir: Direction,
    pub sector: Sector,
    /// Batch region the submission landed in; 0 outside any batch.
    pub batch: u64,
}

struct Store {
    data: Mutex<Vec<u8>>,
    tags: Mutex<Vec<u8>>,
    profile: Option<IntegrityProfile>,
    sectors: Sector,
}

impl Store {
    fn apply(&self, req: &DeviceRequest) -> BlockStatus {
        let byte_off = (req.sector as usize) << SECTOR_SHIFT;
        match req.dir {
            Direction::Flush | Direction::Discard => return BlockStatus::Ok,
            _ => {}
        }
        if byte_off + req.len > self.data.lock().unwrap().len() {
            return BlockStatus::IoErr;
        }

        match req.dir {
            Direction::Write => {
                let mut staging = vec![0u8; req.len];
                match &req.payload {
                    IoPayload::Shared(buf) => {
                        let buf = buf.lock().unwrap();
                        staging
                            .copy_from_slice(&buf[req.data_offset..req.data_offset + req.len]);
                    }
                    IoPayload::Pages(run) => run.lock().unwrap().read_at(0, &mut staging),
                }
                if let Some(offload) = &req.offload {
                    offload.transform(Direction::Write, req.sector, &mut staging);
                }
                self.data.lock().unwrap()[byte_off..byte_off + req.len]
                    .copy_from_slice(&staging);
                self.store_tags(req);
            }
            Direction::Read => {
                let mut staging = vec![0u8; req.len];
                staging.copy_from_slice(&self.data.lock().unwrap()[byte_off..byte_off + req.len]);
                if let Some(offload) = &req.offload {
                    offload.transform(Direction::Read, req.sector, &mut staging);
                }
                match &req.payload {
                    IoPayload::Shared(buf) => {
                        let mut buf = buf.lock().unwrap();
                        buf[req.data_offset..req.data_offset + req.len]
                            .copy_from_slice(&staging);
                    }
                    IoPayload::Pages(run) => run.lock().unwrap().write_at(0, &staging),
                }
                self.load_tags(req);
            }
            _ => {}
        }
        BlockStatus::Ok
    }

    fn tag_window(&self, req: &DeviceRequest) -> Option<(usize, usize)> {
        let profile = self.profile?;
        let byte_off = (req.sector as usize) << SECTOR_SHIFT;
        let first = byte_off / profile.interval;
        let count = req.len / profile.interval;
        Some((first * profile.tag_size, count * profile.tag_size))
    }

    fn store_tags(&self, req: &DeviceRequest) {
        let (Some((base, len)), Some(buf)) = (self.tag_window(req), &req.integrity) else {
            return;
        };
        let src = buf.lock().unwrap();
        self.tags.lock().unwrap()[base..base + len].copy_from_slice(&src[..len]);
    }

    fn load_tags(&self, req: &DeviceRequest) {
        let (Some((base, len)), Some(buf)) = (self.tag_window(req), &req.integrity) else {
            return;
        };
        let mut dst = buf.lock().unwrap();
        dst[..len].copy_from_slice(&self.tags.lock().unwrap()[base..base + len]);
    }
}

/// Memory-backed block device with an integrity sideband.
pub struct RamDevice {
    name: String,
    store: Arc<Store>,
    mode: CompletionMode,
    completer: Mutex<Option<Sender<(DeviceRequest, BlockStatus)>>>,
    completer_thread: Mutex<Option<JoinHandle<()>>>,
    batch: AtomicU64,
    in_batch: AtomicU64,
    log: Mutex<Vec<Submission>>,
    fail_next: AtomicUsize,
}

impl RamDevice {
    pub fn new(name: &str, sectors: Sector) -> Arc<Self> {
        Self::with_profile(name, sectors, None, CompletionMode::Inline)
    }

    pub fn with_profile(
        name: &str,
        sectors: Sector,
        profile: Option<IntegrityProfile>,
        mode: CompletionMode,
    ) -> Arc<Self> {
        let data_len = (sectors as usize) << SECTOR_SHIFT;
        let tags_len = profile
            .map(|p| (data_len / p.interval) * p.tag_size)
            .unwrap_or(0);

        let dev = Arc::new(Self {
            name: name.to_string(),
            store: Arc::new(Store {
                data: Mutex::new(vec![0u8; data_len]),
                tags: Mutex::new(vec![0u8; tags_len]),
                profile,
                sectors,
            }),
            mode,
            completer: Mutex::new(None),
            completer_thread: Mutex::new(None),
            batch: AtomicU64::new(0),
            in_batch: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
        });

        if mode == CompletionMode::Threaded {
            let (tx, rx) = unbounded::<(DeviceRequest, BlockStatus)>();
            let thread = std::thread::Builder::new()
                .name(format!("{name}-complete"))
                .spawn(move || {
                    for (req, status) in rx {
                        (req.completion)(status);
                    }
                })
                .expect("spawn sim completer");
            *dev.completer.lock().unwrap() = Some(tx);
            *dev.completer_thread.lock().unwrap() = Some(thread);
        }
        dev
    }

    /// Fail the next `n` submissions with an I/O error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.log.lock().unwrap().clone()
    }

    pub fn batches(&self) -> u64 {
        self.batch.load(Ordering::SeqCst)
    }

    /// Raw ciphertext bytes as stored, bypassing any crypto.
    pub fn raw_read(&self, sector: Sector, len: usize) -> Vec<u8> {
        let off = (sector as usize) << SECTOR_SHIFT;
        self.store.data.lock().unwrap()[off..off + len].to_vec()
    }

    pub fn raw_write(&self, sector: Sector, bytes: &[u8]) {
        let off = (sector as usize) << SECTOR_SHIFT;
        self.store.data.lock().unwrap()[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Stored sideband bytes for one encryption sector.
    pub fn raw_tag(&self, index: usize) -> Vec<u8> {
        let p = self.store.profile.expect("device has integrity profile");
        let base = index * p.tag_size;
        self.store.tags.lock().unwrap()[base..base + p.tag_size].to_vec()
    }

    pub fn corrupt_tag(&self, index: usize, byte: usize) {
        let p = self.store.profile.expect("device has integrity profile");
        self.store.tags.lock().unwrap()[index * p.tag_size + byte] ^= 0xFF;
    }

    pub fn corrupt_data(&self, sector: Sector, byte: usize) {
        let off = ((sector as usize) << SECTOR_SHIFT) + byte;
        self.store.data.lock().unwrap()[off] ^= 0xFF;
    }
}

impl BlockDevice for RamDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sectors(&self) -> Sector {
        self.store.sectors
    }

    fn integrity(&self) -> Option<IntegrityProfile> {
        self.store.profile
    }

    fn submit(&self, req: DeviceRequest) {
        let batch = if self.in_batch.load(Ordering::SeqCst) > 0 {
            self.batch.load(Ordering::SeqCst)
        } else {
            0
        };
        self.log.lock().unwrap().push(Submission { dir: req.dir, sector: req.sector, batch });

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let status = if failing { BlockStatus::IoErr } else { self.store.apply(&req) };

        match self.mode {
            CompletionMode::Inline => (req.completion)(status),
            CompletionMode::Threaded => {
                let sender = self.completer.lock().unwrap();
                if let Some(tx) = sender.as_ref() {
                    let _ = tx.send((req, status));
                }
            }
        }
    }

    fn begin_batch(&self) {
        self.batch.fetch_add(1, Ordering::SeqCst);
        self.in_batch.fetch_add(1, Ordering::SeqCst);
    }

    fn end_batch(&self) {
        self.in_batch.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for RamDevice {
    fn drop(&mut self) {
        drop(self.completer.lock().unwrap().take());
        if let Some(thread) = self.completer_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FileMeta {
    sectors: Sector,
    tag_size: usize,
    interval: usize,
}

/// File-backed device: sector data in the file itself, sideband tags in a
/// `.tags` companion, geometry in a `.meta` JSON sidecar.
pub struct FileDevice {
    name: String,
    file: Mutex<File>,
    tags: Mutex<File>,
    meta: FileMeta,
    path: PathBuf,
}

impl FileDevice {
    pub fn create<P: AsRef<Path>>(
        path: P,
        sectors: Sector,
        profile: Option<IntegrityProfile>,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let meta = FileMeta {
            sectors,
            tag_size: profile.map(|p| p.tag_size).unwrap_or(0),
            interval: profile.map(|p| p.interval).unwrap_or(1 << SECTOR_SHIFT),
        };
        std::fs::write(Self::meta_path(&path), serde_json::to_string_pretty(&meta)?)
            .context("write device metadata")?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context("open backing file")?;
        file.set_len(sectors << SECTOR_SHIFT)?;

        let tags = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::tags_path(&path))?;
        let data_len = (sectors as usize) << SECTOR_SHIFT;
        tags.set_len(((data_len / meta.interval) * meta.tag_size) as u64)?;

        Self::from_parts(path, file, tags, meta)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let meta: FileMeta =
            serde_json::from_str(&std::fs::read_to_string(Self::meta_path(&path))?)
                .context("parse device metadata")?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let tags = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::tags_path(&path))?;
        Self::from_parts(path, file, tags, meta)
    }

    fn from_parts(path: PathBuf, file: File, tags: File, meta: FileMeta) -> Result<Arc<Self>> {
        let name = path.display().to_string();
        Ok(Arc::new(Self { name, file: Mutex::new(file), tags: Mutex::new(tags), meta, path }))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".meta");
        PathBuf::from(p)
    }

    fn tags_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".tags");
        PathBuf::from(p)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sectors(&self) -> Sector {
        self.meta.sectors
    }

    fn integrity(&self) -> Option<IntegrityProfile> {
        (self.meta.tag_size > 0)
            .then(|| IntegrityProfile { tag_size: self.meta.tag_size, interval: self.meta.interval })
    }

    fn submit(&self, req: DeviceRequest) {
        let status = self.apply(&req).unwrap_or(BlockStatus::IoErr);
        (req.completion)(status);
    }
}

impl FileDevice {
    fn apply(&self, req: &DeviceRequest) -> Result<BlockStatus> {
        let byte_off = req.sector << SECTOR_SHIFT;
        match req.dir {
            Direction::Flush => {
                self.file.lock().unwrap().sync_data()?;
                return Ok(BlockStatus::Ok);
            }
            Direction::Discard => return Ok(BlockStatus::Ok),
            _ => {}
        }
        if byte_off + req.len as u64 > self.meta.sectors << SECTOR_SHIFT {
            return Ok(BlockStatus::IoErr);
        }

        let tag_base = ((byte_off as usize) / self.meta.interval * self.meta.tag_size) as u64;
        let tag_len = req.len / self.meta.interval * self.meta.tag_size;

        match req.dir {
            Direction::Write => {
                let mut staging = vec![0u8; req.len];
                match &req.payload {
                    IoPayload::Shared(buf) => {
                        let buf = buf.lock().unwrap();
                        staging
                            .copy_from_slice(&buf[req.data_offset..req.data_offset + req.len]);
                    }
                    IoPayload::Pages(run) => run.lock().unwrap().read_at(0, &mut staging),
                }
                if let Some(offload) = &req.offload {
                    offload.transform(Direction::Write, req.sector, &mut staging);
                }
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(byte_off))?;
                file.write_all(&staging)?;

                if tag_len > 0 {
                    if let Some(buf) = &req.integrity {
                        let src = buf.lock().unwrap();
                        let mut tags = self.tags.lock().unwrap();
                        tags.seek(SeekFrom::Start(tag_base))?;
                        tags.write_all(&src[..tag_len])?;
                    }
                }
            }
            Direction::Read => {
                let mut staging = vec![0u8; req.len];
                {
                    let mut file = self.file.lock().unwrap();
                    file.seek(SeekFrom::Start(byte_off))?;
                    file.read_exact(&mut staging)?;
                }
                if let Some(offload) = &req.offload {
                    offload.transform(Direction::Read, req.sector, &mut staging);
                }
                match &req.payload {
                    IoPayload::Shared(buf) => {
                        let mut buf = buf.lock().unwrap();
                        buf[req.data_offset..req.data_offset + req.len]
                            .copy_from_slice(&staging);
                    }
                    IoPayload::Pages(run) => run.lock().unwrap().write_at(0, &staging),
                }

                if tag_len > 0 {
                    if let Some(buf) = &req.integrity {
                        let mut dst = buf.lock().unwrap();
                        let mut tags = self.tags.lock().unwrap();
                        tags.seek(SeekFrom::Start(tag_base))?;
                        tags.read_exact(&mut dst[..tag_len])?;
                    }
                }
            }
            _ => {}
        }

        debug!(dir = ?req.dir, sector = req.sector, len = req.len, "file device request");
        Ok(BlockStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::shared_buf;
    use std::sync::mpsc;

    fn roundtrip(dev: &Arc<RamDevice>) {
        let payload: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Write,
            sector: 4,
            payload: IoPayload::Shared(shared_buf(payload.clone())),
            data_offset: 0,
            len: 1024,
            integrity: None,
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        assert_eq!(rx.recv().unwrap(), BlockStatus::Ok);

        let out = shared_buf(vec![0u8; 1024]);
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Read,
            sector: 4,
            payload: IoPayload::Shared(Arc::clone(&out)),
            data_offset: 0,
            len: 1024,
            integrity: None,
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        assert_eq!(rx.recv().unwrap(), BlockStatus::Ok);
        assert_eq!(*out.lock().unwrap(), payload);
    }

    #[test]
    fn ram_device_round_trips_inline() {
        let dev = RamDevice::new("ram0", 64);
        roundtrip(&dev);
        assert_eq!(dev.submissions().len(), 2);
    }

    #[test]
    fn ram_device_round_trips_threaded() {
        let dev = RamDevice::with_profile("ram1", 64, None, CompletionMode::Threaded);
        roundtrip(&dev);
    }

    #[test]
    fn integrity_sideband_round_trips() {
        let profile = IntegrityProfile { tag_size: 16, interval: 512 };
        let dev = RamDevice::with_profile("ram2", 64, Some(profile), CompletionMode::Inline);

        let tags = Arc::new(Mutex::new(vec![0xABu8; 2 * 16]));
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Write,
            sector: 8,
            payload: IoPayload::Shared(shared_buf(vec![1u8; 1024])),
            data_offset: 0,
            len: 1024,
            integrity: Some(Arc::clone(&tags)),
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        rx.recv().unwrap();

        assert_eq!(dev.raw_tag(8), vec![0xABu8; 16]);
        assert_eq!(dev.raw_tag(9), vec![0xABu8; 16]);

        let back = Arc::new(Mutex::new(vec![0u8; 2 * 16]));
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Read,
            sector: 8,
            payload: IoPayload::Shared(shared_buf(vec![0u8; 1024])),
            data_offset: 0,
            len: 1024,
            integrity: Some(Arc::clone(&back)),
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        rx.recv().unwrap();
        assert_eq!(*back.lock().unwrap(), vec![0xABu8; 32]);
    }

    #[test]
    fn fault_injection_fails_then_recovers() {
        let dev = RamDevice::new("ram3", 64);
        dev.fail_next(1);

        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Write,
            sector: 0,
            payload: IoPayload::Shared(shared_buf(vec![0u8; 512])),
            data_offset: 0,
            len: 512,
            integrity: None,
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        assert_eq!(rx.recv().unwrap(), BlockStatus::IoErr);

        roundtrip(&dev);
    }

    #[test]
    fn out_of_range_access_errors() {
        let dev = RamDevice::new("ram4", 4);
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Write,
            sector: 3,
            payload: IoPayload::Shared(shared_buf(vec![0u8; 1024])),
            data_offset: 0,
            len: 1024,
            integrity: None,
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        assert_eq!(rx.recv().unwrap(), BlockStatus::IoErr);
    }

    #[test]
    fn file_device_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let dev = FileDevice::create(&path, 64, None).unwrap();
            let (tx, rx) = mpsc::channel();
            dev.submit(DeviceRequest {
                dir: Direction::Write,
                sector: 2,
                payload: IoPayload::Shared(shared_buf(vec![9u8; 512])),
                data_offset: 0,
                len: 512,
                integrity: None,
                offload: None,
                completion: Box::new(move |st| tx.send(st).unwrap()),
            });
            assert_eq!(rx.recv().unwrap(), BlockStatus::Ok);
        }

        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.sectors(), 64);
        let out = shared_buf(vec![0u8; 512]);
        let (tx, rx) = mpsc::channel();
        dev.submit(DeviceRequest {
            dir: Direction::Read,
            sector: 2,
            payload: IoPayload::Shared(Arc::clone(&out)),
            data_offset: 0,
            len: 512,
            integrity: None,
            offload: None,
            completion: Box::new(move |st| tx.send(st).unwrap()),
        });
        assert_eq!(rx.recv().unwrap(), BlockStatus::Ok);
        assert_eq!(*out.lock().unwrap(), vec![9u8; 512]);
    }
}
