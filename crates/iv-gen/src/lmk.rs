//! Loop-AES compatible IV (lmk).
//!
//! The IV is an MD5 over an optional seed, payload bytes 16..512 and a
//! packed sector trailer, taken from the raw hash state *without* MD5
//! padding. On writes the IV is derived from plaintext before encryption;
//! on reads the cipher runs with a zero IV and `post` recovers the tweak
//! from the decrypted payload, XORing it into the first block.
//!
//! No packaged digest exposes the unpadded state, so the compression
//! function lives here; inputs are always whole 64-byte blocks.

use zeroize::Zeroizing;

use crate::{IvError, IvKeyMaterial, IvParams, SectorView};

const SEED_SIZE: usize = 64;

pub(crate) const MD5_INIT: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

#[rustfmt::skip]
const K: [u32; 64] = [
    0xd76a_a478, 0xe8c7_b756, 0x2420_70db, 0xc1bd_ceee,
    0xf57c_0faf, 0x4787_c62a, 0xa830_4613, 0xfd46_9501,
    0x6980_98d8, 0x8b44_f7af, 0xffff_5bb1, 0x895c_d7be,
    0x6b90_1122, 0xfd98_7193, 0xa679_438e, 0x49b4_0821,
    0xf61e_2562, 0xc040_b340, 0x265e_5a51, 0xe9b6_c7aa,
    0xd62f_105d, 0x0244_1453, 0xd8a1_e681, 0xe7d3_fbc8,
    0x21e1_cde6, 0xc337_07d6, 0xf4d5_0d87, 0x455a_14ed,
    0xa9e3_e905, 0xfcef_a3f8, 0x676f_02d9, 0x8d2a_4c8a,
    0xfffa_3942, 0x8771_f681, 0x6d9d_6122, 0xfde5_380c,
    0xa4be_ea44, 0x4bde_cfa9, 0xf6bb_4b60, 0xbebf_bc70,
    0x289b_7ec6, 0xeaa1_27fa, 0xd4ef_3085, 0x0488_1d05,
    0xd9d4_d039, 0xe6db_99e5, 0x1fa2_7cf8, 0xc4ac_5665,
    0xf429_2244, 0x432a_ff97, 0xab94_23a7, 0xfc93_a039,
    0x655b_59c3, 0x8f0c_cc92, 0xffef_f47d, 0x8584_5dd1,
    0x6fa8_7e4f, 0xfe2c_e6e0, 0xa301_4314, 0x4e08_11a1,
    0xf753_7e82, 0xbd3a_f235, 0x2ad7_d2bb, 0xeb86_d391,
];

#[rustfmt::skip]
const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22,
    5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20, 5,  9, 14, 20,
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23,
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

pub(crate) fn md5_compress(state: &mut [u32; 4], block: &[u8]) {
    debug_assert_eq!(block.len(), 64);
    let mut m = [0u32; 16];
    for (i, word) in m.iter_mut().enumerate() {
        *word = u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
    }

    let (mut a, mut b, mut c, mut d) = (state[0], state[1], state[2], state[3]);
    for i in 0..64 {
        let (f, g) = match i / 16 {
            0 => ((b & c) | (!b & d), i),
            1 => ((d & b) | (!d & c), (5 * i + 1) % 16),
            2 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | !d), (7 * i) % 16),
        };
        let rotated = a
            .wrapping_add(f)
            .wrapping_add(K[i])
            .wrapping_add(m[g])
            .rotate_left(S[i]);
        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(rotated);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// Complete MD5 with standard padding; used by the ESSIV md5 option.
pub(crate) fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut state = MD5_INIT;
    let mut chunks = data.chunks_exact(64);
    for block in &mut chunks {
        md5_compress(&mut state, block);
    }

    let rem = chunks.remainder();
    let mut tail = [0u8; 128];
    tail[..rem.len()].copy_from_slice(rem);
    tail[rem.len()] = 0x80;
    let tail_len = if rem.len() < 56 { 64 } else { 128 };
    let bits = (data.len() as u64).wrapping_mul(8);
    tail[tail_len - 8..tail_len].copy_from_slice(&bits.to_le_bytes());
    for block in tail[..tail_len].chunks_exact(64) {
        md5_compress(&mut state, block);
    }

    let mut out = [0u8; 16];
    for i in 0..4 {
        out[i * 4..i * 4 + 4].copy_from_slice(&state[i].to_le_bytes());
    }
    out
}

pub struct Lmk {
    has_seed: bool,
    seed: Option<Zeroizing<[u8; SEED_SIZE]>>,
}

impl Lmk {
    pub(crate) fn construct(p: &IvParams) -> Result<Self, IvError> {
        if p.sector_size != 512 {
            return Err(IvError::SectorSize("LMK"));
        }
        Ok(Self { has_seed: p.has_seed, seed: None })
    }

    /// The seed occupies the subkey slot after the cipher keys; only its
    /// first 16 bytes come from the key, the rest of the block stays zero.
    pub(crate) fn init(&mut self, km: &IvKeyMaterial) {
        if !self.has_seed {
            return;
        }
        let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
        let offset = km.tfms_count * km.subkey_size;
        seed[..16].copy_from_slice(&km.key[offset..offset + 16]);
        self.seed = Some(seed);
    }

    pub(crate) fn wipe(&mut self) {
        if let Some(seed) = &mut self.seed {
            seed.fill(0);
        }
    }

    fn one(&self, iv: &mut [u8], iv_sector: u64, data: &[u8]) {
        let mut state = MD5_INIT;

        if let Some(seed) = &self.seed {
            md5_compress(&mut state, &seed[..]);
        }

        // Sector is always 512 bytes; hash payload blocks 1..31 plus the
        // packed trailer, with the sector value cropped to 56 bits.
        let mut msg = Zeroizing::new(Vec::with_capacity(512));
        msg.extend_from_slice(&data[16..512]);
        msg.extend_from_slice(&((iv_sector & 0xffff_ffff) as u32).to_le_bytes());
        msg.extend_from_slice(
            &((((iv_sector >> 32) & 0x00ff_ffff) as u32) | 0x8000_0000).to_le_bytes(),
        );
        msg.extend_from_slice(&4024u32.to_le_bytes());
        msg.extend_from_slice(&0u32.to_le_bytes());
        for block in msg.chunks_exact(64) {
            md5_compress(&mut state, block);
        }

        let mut words = [0u8; 16];
        for i in 0..4 {
            words[i * 4..i * 4 + 4].copy_from_slice(&state[i].to_le_bytes());
        }
        let n = iv.len().min(16);
        iv[..n].copy_from_slice(&words[..n]);
    }

    pub(crate) fn generate(&self, iv: &mut [u8], s: &mut SectorView) -> Result<(), IvError> {
        if s.write {
            self.one(iv, s.iv_sector, s.data);
        } else {
            iv.fill(0);
        }
        Ok(())
    }

    pub(crate) fn post(&self, iv: &mut [u8], s: &mut SectorView) -> Result<(), IvError> {
        if s.write {
            return Ok(());
        }

        self.one(iv, s.iv_sector, s.data);

        // Tweak the first block of the recovered plaintext.
        for (b, v) in s.data.iter_mut().zip(iv.iter()) {
            *b ^= v;
        }
        Ok(())
    }
}
