//! Encrypted salt-sector IV.
//!
//! The salt is a digest of the volume key; a second cipher instance keyed
//! with the salt encrypts the plain64 sector number, so IVs are
//! unpredictable without the key.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use zeroize::Zeroizing;

use crate::lmk::md5_digest;
use crate::{IvError, IvParams};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy)]
enum EssivDigest {
    Sha256,
    Md5,
}

impl EssivDigest {
    fn size(self) -> usize {
        match self {
            EssivDigest::Sha256 => 32,
            EssivDigest::Md5 => 16,
        }
    }

    fn digest(self, data: &[u8]) -> Zeroizing<Vec<u8>> {
        match self {
            EssivDigest::Sha256 => Zeroizing::new(Sha256::digest(data).to_vec()),
            EssivDigest::Md5 => Zeroizing::new(md5_digest(data).to_vec()),
        }
    }
}

enum SaltCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl SaltCipher {
    fn new(salt: &[u8]) -> Self {
        match salt.len() {
            16 => SaltCipher::Aes128(Aes128::new(GenericArray::from_slice(salt))),
            _ => SaltCipher::Aes256(Aes256::new(GenericArray::from_slice(salt))),
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            SaltCipher::Aes128(c) => c.encrypt_block(block),
            SaltCipher::Aes256(c) => c.encrypt_block(block),
        }
    }
}

pub struct Essiv {
    digest: EssivDigest,
    salt: Zeroizing<Vec<u8>>,
    cipher: Option<SaltCipher>,
}

impl Essiv {
    pub(crate) fn construct(opts: Option<&str>, p: &IvParams) -> Result<Self, IvError> {
        let digest = match opts {
            None => return Err(IvError::EssivMissingDigest),
            Some("sha256") => EssivDigest::Sha256,
            Some("md5") => EssivDigest::Md5,
            Some(other) => return Err(IvError::EssivUnknownDigest(other.to_string())),
        };

        if p.cipher_name != "aes" {
            return Err(IvError::EssivCipher);
        }
        if p.cipher_block_size != p.iv_size {
            return Err(IvError::EssivBlockSize);
        }

        Ok(Self {
            digest,
            salt: Zeroizing::new(vec![0u8; digest.size()]),
            cipher: None,
        })
    }

    /// Recompute the salt from the installed key and rekey the salt cipher.
    pub(crate) fn init(&mut self, key: &[u8]) -> Result<(), IvError> {
        self.salt = self.digest.digest(key);
        self.cipher = Some(SaltCipher::new(&self.salt));
        Ok(())
    }

    pub(crate) fn wipe(&mut self) -> Result<(), IvError> {
        self.salt.iter_mut().for_each(|b| *b = 0);
        self.cipher = Some(SaltCipher::new(&self.salt));
        Ok(())
    }

    pub(crate) fn generate(&self, iv: &mut [u8], iv_sector: u64) -> Result<(), IvError> {
        iv.fill(0);
        iv[..8].copy_from_slice(&iv_sector.to_le_bytes());
        if let Some(cipher) = &self.cipher {
            cipher.encrypt_block(iv);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IvMode, IvKeyMaterial, SectorView};

    fn essiv_mode(key: &[u8]) -> IvMode {
        let p = IvParams {
            iv_size: 16,
            cipher_name: "aes",
            cipher_block_size: 16,
            sector_size: 512,
            key_size: key.len(),
            has_seed: false,
        };
        let mut mode = IvMode::construct("essiv", Some("sha256"), &p).unwrap();
        mode.init(&IvKeyMaterial { key, subkey_size: key.len(), tfms_count: 1 })
            .unwrap();
        mode
    }

    fn gen(mode: &IvMode, sector: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        let mut data = [0u8; 512];
        let mut view = SectorView { iv_sector: sector, write: true, data: &mut data };
        mode.generate(&mut iv, &mut view).unwrap();
        iv
    }

    #[test]
    fn salt_depends_on_key() {
        let a = essiv_mode(&[1u8; 32]);
        let b = essiv_mode(&[2u8; 32]);
        assert_ne!(gen(&a, 5), gen(&b, 5));
    }

    #[test]
    fn deterministic_per_sector() {
        let mode = essiv_mode(&[9u8; 32]);
        assert_eq!(gen(&mode, 42), gen(&mode, 42));
        assert_ne!(gen(&mode, 42), gen(&mode, 43));
    }

    #[test]
    fn iv_is_not_the_plain_sector() {
        let mode = essiv_mode(&[9u8; 32]);
        let iv = gen(&mode, 42);
        let mut plain = [0u8; 16];
        plain[..8].copy_from_slice(&42u64.to_le_bytes());
        assert_ne!(iv, plain);
    }

    #[test]
    fn requires_digest_option() {
        let p = IvParams {
            iv_size: 16,
            cipher_name: "aes",
            cipher_block_size: 16,
            sector_size: 512,
            key_size: 32,
            has_seed: false,
        };
        assert!(matches!(
            IvMode::construct("essiv", None, &p),
            Err(IvError::EssivMissingDigest)
        ));
    }

    #[test]
    fn wipe_changes_output() {
        let mut mode = essiv_mode(&[9u8; 32]);
        let before = gen(&mode, 1);
        mode.wipe().unwrap();
        assert_ne!(gen(&mode, 1), before);
    }
}
