//! TrueCrypt-compatible IV and whitening (tcw).
//!
//! State is an IV seed plus a 16-byte whitening secret, both carved from
//! the tail of the volume key. The IV XORs the little-endian sector into
//! the seed; the whitening folds per-sector CRC32s into an 8-byte mask
//! applied across every 8-byte lane of the 512-byte payload. Writes whiten
//! the ciphertext in `post`; reads strip the whitening in `generate`
//! before the cipher runs.

use zeroize::{Zeroize, Zeroizing};

use crate::{IvError, IvParams, SectorView};

const WHITENING_SIZE: usize = 16;

pub struct Tcw {
    iv_size: usize,
    iv_seed: Zeroizing<Vec<u8>>,
    whitening: Zeroizing<[u8; WHITENING_SIZE]>,
}

impl Tcw {
    pub(crate) fn construct(p: &IvParams) -> Result<Self, IvError> {
        if p.sector_size != 512 {
            return Err(IvError::SectorSize("TCW"));
        }
        if p.key_size <= p.iv_size + WHITENING_SIZE {
            return Err(IvError::KeySize("TCW"));
        }

        Ok(Self {
            iv_size: p.iv_size,
            iv_seed: Zeroizing::new(vec![0u8; p.iv_size]),
            whitening: Zeroizing::new([0u8; WHITENING_SIZE]),
        })
    }

    pub(crate) fn init(&mut self, key: &[u8]) {
        let offset = key.len() - self.iv_size - WHITENING_SIZE;
        self.iv_seed.copy_from_slice(&key[offset..offset + self.iv_size]);
        self.whitening
            .copy_from_slice(&key[offset + self.iv_size..offset + self.iv_size + WHITENING_SIZE]);
    }

    pub(crate) fn wipe(&mut self) {
        self.iv_seed.fill(0);
        self.whitening.fill(0);
    }

    fn whiten(&self, iv_sector: u64, data: &mut [u8]) {
        let sector = iv_sector.to_le_bytes();
        let mut buf = [0u8; WHITENING_SIZE];

        for i in 0..8 {
            buf[i] = self.whitening[i] ^ sector[i];
            buf[8 + i] = self.whitening[8 + i] ^ sector[i];
        }

        // CRC32 each 32-bit part in place, then fold the four checksums
        // into one 8-byte mask.
        for i in 0..4 {
            let crc = crc32fast::hash(&buf[i * 4..i * 4 + 4]);
            buf[i * 4..i * 4 + 4].copy_from_slice(&crc.to_le_bytes());
        }
        for i in 0..4 {
            buf[i] ^= buf[12 + i];
            buf[4 + i] ^= buf[8 + i];
        }

        for lane in data.chunks_exact_mut(8) {
            for (b, m) in lane.iter_mut().zip(buf[..8].iter()) {
                *b ^= m;
            }
        }

        buf.zeroize();
    }

    pub(crate) fn generate(&self, iv: &mut [u8], s: &mut SectorView) -> Result<(), IvError> {
        // Remove whitening from ciphertext before decryption.
        if !s.write {
            self.whiten(s.iv_sector, s.data);
        }

        let sector = s.iv_sector.to_le_bytes();
        for i in 0..8 {
            iv[i] = self.iv_seed[i] ^ sector[i];
        }
        for i in 8..iv.len() {
            iv[i] = self.iv_seed[i] ^ sector[i - 8];
        }
        Ok(())
    }

    pub(crate) fn post(&self, s: &mut SectorView) -> Result<(), IvError> {
        if s.write {
            self.whiten(s.iv_sector, s.data);
        }
        Ok(())
    }
}
