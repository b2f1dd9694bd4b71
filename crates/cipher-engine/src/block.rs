//! Block-cipher engines over AES. All complete inline.

use std::sync::RwLock;

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use xts_mode::Xts128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    CipherEngine, CipherRequest, CryptOp, EngineCallback, EngineError, EngineKind, SubmitStatus,
};

const AES_BLOCK: usize = 16;

/// Raw AES key material; the variant selects the key schedule width.
#[derive(Zeroize, ZeroizeOnDrop)]
enum AesKey {
    K128([u8; 16]),
    K192([u8; 24]),
    K256([u8; 32]),
}

impl AesKey {
    fn from_bytes(key: &[u8]) -> Result<Self, EngineError> {
        match key.len() {
            16 => Ok(AesKey::K128(key.try_into().unwrap())),
            24 => Ok(AesKey::K192(key.try_into().unwrap())),
            32 => Ok(AesKey::K256(key.try_into().unwrap())),
            n => Err(EngineError::InvalidKeySize(n)),
        }
    }
}

fn check_block_aligned(data: &[u8]) -> Result<(), EngineError> {
    if data.is_empty() || data.len() % AES_BLOCK != 0 {
        return Err(EngineError::BadLength(data.len()));
    }
    Ok(())
}

/// cbc(aes)
#[derive(Default)]
pub struct CbcEngine {
    key: RwLock<Option<AesKey>>,
}

impl CbcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn run(&self, op: CryptOp, req: &mut CipherRequest) -> Result<(), EngineError> {
        check_block_aligned(&req.data)?;
        let guard = self.key.read().unwrap();
        let key = guard.as_ref().ok_or(EngineError::KeyNotSet)?;
        let iv = GenericArray::from_slice(&req.iv[..AES_BLOCK]);
        let len = req.data.len();

        macro_rules! cbc_run {
            ($aes:ty, $key:expr) => {{
                let key = GenericArray::from_slice($key);
                match op {
                    CryptOp::Encrypt => {
                        cbc::Encryptor::<$aes>::new(key, iv)
                            .encrypt_padded_mut::<NoPadding>(&mut req.data, len)
                            .map(|_| ())
                            .map_err(|_| EngineError::BadLength(len))
                    }
                    CryptOp::Decrypt => {
                        cbc::Decryptor::<$aes>::new(key, iv)
                            .decrypt_padded_mut::<NoPadding>(&mut req.data)
                            .map(|_| ())
                            .map_err(|_| EngineError::BadLength(len))
                    }
                }
            }};
        }

        match key {
            AesKey::K128(k) => cbc_run!(Aes128, k),
            AesKey::K192(k) => cbc_run!(Aes192, k),
            AesKey::K256(k) => cbc_run!(Aes256, k),
        }
    }
}

impl CipherEngine for CbcEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Block
    }

    fn iv_size(&self) -> usize {
        AES_BLOCK
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        *self.key.write().unwrap() = Some(AesKey::from_bytes(key)?);
        Ok(())
    }

    fn process(&self, op: CryptOp, mut req: CipherRequest, _done: EngineCallback) -> SubmitStatus {
        let result = self.run(op, &mut req);
        SubmitStatus::Completed(req, result)
    }
}

/// ecb(aes); no IV.
#[derive(Default)]
pub struct EcbEngine {
    key: RwLock<Option<AesKey>>,
}

impl EcbEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, op: CryptOp, req: &mut CipherRequest) -> Result<(), EngineError> {
        check_block_aligned(&req.data)?;
        let guard = self.key.read().unwrap();
        let key = guard.as_ref().ok_or(EngineError::KeyNotSet)?;
        let len = req.data.len();

        macro_rules! ecb_run {
            ($aes:ty, $key:expr) => {{
                let key = GenericArray::from_slice($key);
                match op {
                    CryptOp::Encrypt => {
                        ecb::Encryptor::<$aes>::new(key)
                            .encrypt_padded_mut::<NoPadding>(&mut req.data, len)
                            .map(|_| ())
                            .map_err(|_| EngineError::BadLength(len))
                    }
                    CryptOp::Decrypt => {
                        ecb::Decryptor::<$aes>::new(key)
                            .decrypt_padded_mut::<NoPadding>(&mut req.data)
                            .map(|_| ())
                            .map_err(|_| EngineError::BadLength(len))
                    }
                }
            }};
        }

        match key {
            AesKey::K128(k) => ecb_run!(Aes128, k),
            AesKey::K192(k) => ecb_run!(Aes192, k),
            AesKey::K256(k) => ecb_run!(Aes256, k),
        }
    }
}

impl CipherEngine for EcbEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Block
    }

    fn iv_size(&self) -> usize {
        0
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        *self.key.write().unwrap() = Some(AesKey::from_bytes(key)?);
        Ok(())
    }

    fn process(&self, op: CryptOp, mut req: CipherRequest, _done: EngineCallback) -> SubmitStatus {
        let result = self.run(op, &mut req);
        SubmitStatus::Completed(req, result)
    }
}

/// xts(aes); the key splits into two halves for the data and tweak
/// schedules.
#[derive(Zeroize, ZeroizeOnDrop)]
enum XtsKey {
    K256([u8; 16], [u8; 16]),
    K512([u8; 32], [u8; 32]),
}

#[derive(Default)]
pub struct XtsEngine {
    key: RwLock<Option<XtsKey>>,
}

impl XtsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, op: CryptOp, req: &mut CipherRequest) -> Result<(), EngineError> {
        check_block_aligned(&req.data)?;
        let guard = self.key.read().unwrap();
        let key = guard.as_ref().ok_or(EngineError::KeyNotSet)?;
        let tweak: [u8; 16] = req.iv[..AES_BLOCK].try_into().unwrap();

        match key {
            XtsKey::K256(k1, k2) => {
                let xts = Xts128::<Aes128>::new(
                    Aes128::new(GenericArray::from_slice(k1)),
                    Aes128::new(GenericArray::from_slice(k2)),
                );
                match op {
                    CryptOp::Encrypt => xts.encrypt_sector(&mut req.data, tweak),
                    CryptOp::Decrypt => xts.decrypt_sector(&mut req.data, tweak),
                }
            }
            XtsKey::K512(k1, k2) => {
                let xts = Xts128::<Aes256>::new(
                    Aes256::new(GenericArray::from_slice(k1)),
                    Aes256::new(GenericArray::from_slice(k2)),
                );
                match op {
                    CryptOp::Encrypt => xts.encrypt_sector(&mut req.data, tweak),
                    CryptOp::Decrypt => xts.decrypt_sector(&mut req.data, tweak),
                }
            }
        }
        Ok(())
    }
}

impl CipherEngine for XtsEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Block
    }

    fn iv_size(&self) -> usize {
        AES_BLOCK
    }

    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        let parsed = match key.len() {
            32 => XtsKey::K256(key[..16].try_into().unwrap(), key[16..].try_into().unwrap()),
            64 => XtsKey::K512(key[..32].try_into().unwrap(), key[32..].try_into().unwrap()),
            n => return Err(EngineError::InvalidKeySize(n)),
        };
        *self.key.write().unwrap() = Some(parsed);
        Ok(())
    }

    fn process(&self, op: CryptOp, mut req: CipherRequest, _done: EngineCallback) -> SubmitStatus {
        let result = self.run(op, &mut req);
        SubmitStatus::Completed(req, result)
    }
}
