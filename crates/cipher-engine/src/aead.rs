//! AEAD engines. The associated data is always the 8-byte little-endian
//! sector number followed by the IV, so a sector's ciphertext cannot be
//! replayed at another location.

use std::sync::RwLock;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce, Tag};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::block::CbcEngine;
use crate::{
    mac_digest_size, parse_composite_key, CipherEngine, CipherRequest, CryptOp, EngineCallback,
    EngineError, EngineKind, SubmitStatus,
};

const GCM_IV_SIZE: usize = 12;
const GCM_TAG_SIZE: usize = 16;

enum GcmKey {
    K128(Box<Aes128Gcm>),
    K256(Box<Aes256Gcm>),
}

/// gcm(aes)
#[derive(Default)]
pub struct GcmEngine {
    key: RwLock<Option<GcmKey>>,
}

impl GcmEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, op: CryptOp, req: &mut CipherRequest) -> Result<(), EngineError> {
        let guard = self.key.read().unwrap();
        let key = guard.as_ref().ok_or(EngineError::KeyNotSet)?;

        let mut aad = Vec::with_capacity(8 + req.iv.len());
        aad.extend_from_slice(&req.sector_le);
        aad.extend_from_slice(&req.iv);
        let nonce = Nonce::from_slice(&req.iv[..GCM_IV_SIZE]);

        match op {
            CryptOp::Encrypt => {
                let tag = match key {
                    GcmKey::K128(c) => c.encrypt_in_place_detached(nonce, &aad, &mut req.data),
                    GcmKey::K256(c) => c.encrypt_in_place_detached(nonce, &aad, &mut req.data),
                }
                .map_err(|_| EngineError::BadLength(req.data.len()))?;
                req.tag.resize(GCM_TAG_SIZE, 0);
                req.tag.copy_from_slice(&tag);
                Ok(())
            }
            CryptOp::Decrypt => {
                if req.tag.len() != GCM_TAG_SIZE {
                    return Err(EngineError::BadAuthSize(req.tag.len()));
                }
                let tag = Tag::from_slice(&req.tag);
                match key {
                    GcmKey::K128(c) => c.decrypt_in_place_detached(nonce, &aad, &mut req.data, tag),
                    GcmKey::K256(c) => c.decrypt_in_place_detached(nonce, &aad, &mut req.data, tag),
                }
                .map_err(|_| EngineError::BadTag)
            }
        }
    }
}

impl CipherEngine for GcmEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Aead
    }

    fn iv_size(&self) -> usize {
        GCM_IV_SIZE
    }

    fn block_size(&self) -> usize {
        16
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        let parsed = match key.len() {
            16 => GcmKey::K128(Box::new(Aes128Gcm::new_from_slice(key).unwrap())),
            32 => GcmKey::K256(Box::new(Aes256Gcm::new_from_slice(key).unwrap())),
            n => return Err(EngineError::InvalidKeySize(n)),
        };
        *self.key.write().unwrap() = Some(parsed);
        Ok(())
    }

    fn set_auth_size(&self, size: usize) -> Result<(), EngineError> {
        // The software backend verifies full tags only.
        if size != GCM_TAG_SIZE {
            return Err(EngineError::BadAuthSize(size));
        }
        Ok(())
    }

    fn process(&self, op: CryptOp, mut req: CipherRequest, _done: EngineCallback) -> SubmitStatus {
        let result = self.run(op, &mut req);
        SubmitStatus::Completed(req, result)
    }
}

#[derive(Clone, Copy)]
enum MacAlg {
    Sha256,
    Sha512,
}

impl MacAlg {
    fn digest_size(self) -> usize {
        match self {
            MacAlg::Sha256 => 32,
            MacAlg::Sha512 => 64,
        }
    }

    fn mac(self, key: &[u8], parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        match self {
            MacAlg::Sha256 => {
                let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key).expect("hmac accepts any key");
                for p in parts {
                    mac.update(p);
                }
                Zeroizing::new(mac.finalize().into_bytes().to_vec())
            }
            MacAlg::Sha512 => {
                let mut mac = <Hmac<Sha512> as KeyInit>::new_from_slice(key).expect("hmac accepts any key");
                for p in parts {
                    mac.update(p);
                }
                Zeroizing::new(mac.finalize().into_bytes().to_vec())
            }
        }
    }
}

/// authenc(hmac(h),cbc(aes)): encrypt-then-MAC with the MAC spanning the
/// associated data and the ciphertext. Keys arrive in the composite
/// encoding built by [`crate::build_composite_key`].
pub struct AuthencEngine {
    alg: MacAlg,
    inner: CbcEngine,
    mac_key: RwLock<Option<Zeroizing<Vec<u8>>>>,
    auth_size: RwLock<usize>,
}

impl AuthencEngine {
    pub fn new(mac_alg: &str) -> Result<Self, EngineError> {
        let alg = match mac_alg {
            "sha256" => MacAlg::Sha256,
            "sha512" => MacAlg::Sha512,
            other => return Err(EngineError::UnknownMac(other.to_string())),
        };
        // Size checked against the registry too; keep the two in sync.
        debug_assert_eq!(mac_digest_size(mac_alg).unwrap(), alg.digest_size());

        Ok(Self {
            alg,
            inner: CbcEngine::new(),
            mac_key: RwLock::new(None),
            auth_size: RwLock::new(alg.digest_size()),
        })
    }

    fn run(&self, op: CryptOp, req: &mut CipherRequest) -> Result<(), EngineError> {
        let guard = self.mac_key.read().unwrap();
        let mac_key = guard.as_ref().ok_or(EngineError::KeyNotSet)?;
        let auth_size = *self.auth_size.read().unwrap();
        let org_iv = req.iv.clone();

        match op {
            CryptOp::Encrypt => {
                self.inner.run(CryptOp::Encrypt, req)?;
                let mac = self.alg.mac(mac_key, &[&req.sector_le, &org_iv, &req.data]);
                req.tag.resize(auth_size, 0);
                req.tag.copy_from_slice(&mac[..auth_size]);
                Ok(())
            }
            CryptOp::Decrypt => {
                if req.tag.len() != auth_size {
                    return Err(EngineError::BadAuthSize(req.tag.len()));
                }
                let mac = self.alg.mac(mac_key, &[&req.sector_le, &org_iv, &req.data]);
                if !bool::from(mac[..auth_size].ct_eq(&req.tag)) {
                    return Err(EngineError::BadTag);
                }
                self.inner.run(CryptOp::Decrypt, req)
            }
        }
    }
}

impl CipherEngine for AuthencEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Aead
    }

    fn iv_size(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        16
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        let (auth, enc) = parse_composite_key(key)?;
        self.inner.set_key(enc)?;
        *self.mac_key.write().unwrap() = Some(Zeroizing::new(auth.to_vec()));
        Ok(())
    }

    fn set_auth_size(&self, size: usize) -> Result<(), EngineError> {
        if size < 4 || size > self.alg.digest_size() {
            return Err(EngineError::BadAuthSize(size));
        }
        *self.auth_size.write().unwrap() = size;
        Ok(())
    }

    fn process(&self, op: CryptOp, mut req: CipherRequest, _done: EngineCallback) -> SubmitStatus {
        let result = self.run(op, &mut req);
        SubmitStatus::Completed(req, result)
    }
}
