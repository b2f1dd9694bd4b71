//! Per-sector request assembly.
//!
//! The composite request is an owned record: the little-endian sector and
//! IV double as AEAD associated data, `data` carries the payload, `tag`
//! the integrity bytes. Gathering copies the sector window out of the
//! I/O's buffers and places the IV per mode rules; scattering writes the
//! cipher output (and freshly minted tags) back.

use cipher_engine::CipherRequest;
use common::BlockStatus;
use iv_gen::SectorView;

use crate::io::CryptIo;

/// Sidecar state for one in-flight sector request; everything the
/// completion path needs that the engine does not carry.
pub(crate) struct JobMeta {
    pub iv_sector: u64,
    /// Logical sector (iv_offset removed), for diagnostics.
    pub sector: u64,
    pub org_iv: Vec<u8>,
    pub tag_offset: usize,
    pub out_off: usize,
}

/// Assemble one sector's request. `offset` is the byte offset of the
/// sector within the I/O window; `cc_sector` includes the iv_offset shift.
pub(crate) fn build_job(
    io: &CryptIo,
    mut shell: CipherRequest,
    cc_sector: u64,
    tag_offset: usize,
    offset: usize,
) -> Result<(CipherRequest, JobMeta), BlockStatus> {
    let core = &io.core;
    let write = io.dir.is_write();
    let sector_size = core.sector_size;

    let iv_sector = if core.flags.iv_large_sectors {
        cc_sector >> core.sector_shift
    } else {
        cc_sector
    };
    let logical = cc_sector - core.iv_offset;
    shell.sector_le = logical.to_le_bytes();

    // Gather the payload window: plaintext for writes, ciphertext (already
    // read from the device) for reads.
    shell.data.resize(sector_size, 0);
    {
        let data = io.data.lock().unwrap();
        let start = io.data_offset + offset;
        shell.data.copy_from_slice(&data[start..start + sector_size]);
    }

    let on_disk = core.integrity.on_disk_tag_size;
    let tag_base = tag_offset * on_disk;

    // AEAD carries the tag through the request; reads feed the on-disk tag
    // into verification.
    if core.integrity.tag_size > 0 {
        shell.tag.resize(core.integrity.tag_size, 0);
        if !write {
            let meta = io.integrity_buf().expect("aead io carries metadata");
            let meta = meta.lock().unwrap();
            shell.tag
                .copy_from_slice(&meta[tag_base..tag_base + core.integrity.tag_size]);
        }
    } else {
        shell.tag.clear();
    }

    let mut org_iv = vec![0u8; core.iv_size];
    let iv = core.iv.read().unwrap();
    if let Some(iv) = iv.as_ref() {
        let iv_bytes = core.integrity.iv_size;
        if iv_bytes > 0 && !write {
            // The IV that encrypted this sector was stored next to the tag.
            let meta = io.integrity_buf().expect("metadata iv configured");
            let meta = meta.lock().unwrap();
            let base = tag_base + core.integrity.tag_size;
            org_iv[..iv_bytes].copy_from_slice(&meta[base..base + iv_bytes]);
        } else {
            let mut view =
                SectorView { iv_sector, write, data: &mut shell.data };
            if iv.generate(&mut org_iv, &mut view).is_err() {
                return Err(BlockStatus::IoErr);
            }
            if iv_bytes > 0 {
                // Store it so the matching read can recover it.
                let meta = io.integrity_buf().expect("metadata iv configured");
                let mut meta = meta.lock().unwrap();
                let base = tag_base + core.integrity.tag_size;
                meta[base..base + iv_bytes].copy_from_slice(&org_iv[..iv_bytes]);
            }
        }
    }
    drop(iv);

    // Working copy; the engine may clobber it.
    shell.iv.clear();
    shell.iv.extend_from_slice(&org_iv);

    let meta = JobMeta { iv_sector, sector: logical, org_iv, tag_offset, out_off: offset };
    Ok((shell, meta))
}

/// Post-process and scatter a successfully transformed request. Returns
/// the shell for reuse.
pub(crate) fn finish_job(
    io: &CryptIo,
    meta: &mut JobMeta,
    mut req: CipherRequest,
) -> Result<CipherRequest, BlockStatus> {
    let core = &io.core;
    let write = io.dir.is_write();

    {
        let iv = core.iv.read().unwrap();
        if let Some(iv) = iv.as_ref() {
            let mut view =
                SectorView { iv_sector: meta.iv_sector, write, data: &mut req.data };
            if iv.post(&mut meta.org_iv, &mut view).is_err() {
                return Err(BlockStatus::IoErr);
            }
        }
    }

    if write {
        let run = io
            .ctx
            .out_run
            .lock()
            .unwrap()
            .clone()
            .expect("write conversion has an output clone");
        run.lock().unwrap().write_at(meta.out_off, &req.data);

        let on_disk = core.integrity.on_disk_tag_size;
        if on_disk > 0 {
            let buf = io.integrity_buf().expect("integrity io carries metadata");
            let mut buf = buf.lock().unwrap();
            let base = meta.tag_offset * on_disk;
            let tag_size = core.integrity.tag_size;
            buf[base..base + tag_size].copy_from_slice(&req.tag);
            // IV (if any) was stored at assembly time; zero the remainder.
            let used = tag_size + core.integrity.iv_size;
            buf[base + used..base + on_disk].fill(0);
        }
    } else {
        let mut data = io.data.lock().unwrap();
        let start = io.data_offset + meta.out_off;
        data[start..start + core.sector_size].copy_from_slice(&req.data);
    }

    Ok(req)
}
