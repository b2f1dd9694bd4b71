//! Per-sector IV generation.
//!
//! Every encryption sector needs a cipher input tied to its logical
//! address; some schemes additionally post-process the payload itself
//! (lmk tweaks recovered plaintext, tcw whitens ciphertext). The family is
//! modelled as a tagged variant with a fixed capability set — construct,
//! init (after key install), wipe, generate, post — where absent
//! capabilities are no-ops.
//!
//! ## Variants
//!
//! | mode       | IV contents                                             |
//! |------------|---------------------------------------------------------|
//! | plain      | low 32 bits of the sector, little-endian, zero padded   |
//! | plain64    | full sector, little-endian, zero padded                 |
//! | plain64be  | full sector, big-endian, right-aligned                  |
//! | essiv      | E_salt(plain64), salt = H(key)                          |
//! | benbi      | big-endian cipher-block number, right-aligned           |
//! | null       | zeros                                                   |
//! | lmk        | loop-AES compatible MD5 over the payload                |
//! | tcw        | TrueCrypt-compatible seed XOR plus payload whitening    |
//! | random     | fresh CSPRNG bytes, recovered from metadata on read     |

mod essiv;
mod lmk;
mod tcw;

use rand::RngCore;
use thiserror::Error;

pub use essiv::Essiv;
pub use lmk::Lmk;
pub use tcw::Tcw;

#[derive(Debug, Error)]
pub enum IvError {
    #[error("unknown IV mode: {0}")]
    UnknownMode(String),
    #[error("digest algorithm missing for ESSIV mode")]
    EssivMissingDigest,
    #[error("unsupported ESSIV digest: {0}")]
    EssivUnknownDigest(String),
    #[error("block size of ESSIV cipher does not match IV size of block cipher")]
    EssivBlockSize,
    #[error("ESSIV is only available for aes in the software backends")]
    EssivCipher,
    #[error("cipher blocksize is not a power of 2")]
    BenbiBlockSize,
    #[error("cipher blocksize is > 512")]
    BenbiBlockTooLarge,
    #[error("unsupported sector size for {0}")]
    SectorSize(&'static str),
    #[error("wrong key size for {0}")]
    KeySize(&'static str),
}

/// Construction-time facts the generators validate against.
pub struct IvParams<'a> {
    pub iv_size: usize,
    /// Bare cipher name extracted from the cipher spec (essiv keys a second
    /// instance of it with the salt).
    pub cipher_name: &'a str,
    pub cipher_block_size: usize,
    pub sector_size: usize,
    pub key_size: usize,
    /// lmk only: a trailing subkey is reserved as the hash seed.
    pub has_seed: bool,
}

/// Key material handed to `init` after a successful setkey cycle.
pub struct IvKeyMaterial<'a> {
    pub key: &'a [u8],
    pub subkey_size: usize,
    pub tfms_count: usize,
}

/// One sector's worth of context for `generate`/`post`.
///
/// `data` is the payload the cipher will consume or has produced: plaintext
/// before encryption on writes, ciphertext before decryption on reads, and
/// the cipher output in `post`. lmk and tcw read or mutate it.
pub struct SectorView<'a> {
    pub iv_sector: u64,
    pub write: bool,
    pub data: &'a mut [u8],
}

pub enum IvMode {
    Plain,
    Plain64,
    Plain64Be,
    Essiv(Essiv),
    Benbi { shift: u32 },
    Null,
    Lmk(Lmk),
    Tcw(Tcw),
    Random,
}

impl IvMode {
    pub fn construct(name: &str, opts: Option<&str>, p: &IvParams) -> Result<Self, IvError> {
        match name {
            "plain" => Ok(IvMode::Plain),
            "plain64" => Ok(IvMode::Plain64),
            "plain64be" => Ok(IvMode::Plain64Be),
            "essiv" => Ok(IvMode::Essiv(Essiv::construct(opts, p)?)),
            "benbi" => {
                let bs = p.cipher_block_size;
                if !bs.is_power_of_two() {
                    return Err(IvError::BenbiBlockSize);
                }
                let log = bs.trailing_zeros();
                if log > 9 {
                    return Err(IvError::BenbiBlockTooLarge);
                }
                Ok(IvMode::Benbi { shift: 9 - log })
            }
            "null" => Ok(IvMode::Null),
            "lmk" => Ok(IvMode::Lmk(Lmk::construct(p)?)),
            "tcw" => Ok(IvMode::Tcw(Tcw::construct(p)?)),
            "random" => Ok(IvMode::Random),
            other => Err(IvError::UnknownMode(other.to_string())),
        }
    }

    /// Derive per-mode state from freshly installed key material.
    pub fn init(&mut self, key: &IvKeyMaterial) -> Result<(), IvError> {
        match self {
            IvMode::Essiv(essiv) => essiv.init(key.key),
            IvMode::Lmk(lmk) => {
                lmk.init(key);
                Ok(())
            }
            IvMode::Tcw(tcw) => {
                tcw.init(key.key);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Forget key-derived state; part of `key wipe`.
    pub fn wipe(&mut self) -> Result<(), IvError> {
        match self {
            IvMode::Essiv(essiv) => essiv.wipe(),
            IvMode::Lmk(lmk) => {
                lmk.wipe();
                Ok(())
            }
            IvMode::Tcw(tcw) => {
                tcw.wipe();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn generate(&self, iv: &mut [u8], s: &mut SectorView) -> Result<(), IvError> {
        match self {
            IvMode::Plain => {
                iv.fill(0);
                iv[..4].copy_from_slice(&((s.iv_sector & 0xffff_ffff) as u32).to_le_bytes());
                Ok(())
            }
            IvMode::Plain64 => {
                iv.fill(0);
                iv[..8].copy_from_slice(&s.iv_sector.to_le_bytes());
                Ok(())
            }
            IvMode::Plain64Be => {
                iv.fill(0);
                let n = iv.len();
                iv[n - 8..].copy_from_slice(&s.iv_sector.to_be_bytes());
                Ok(())
            }
            IvMode::Essiv(essiv) => essiv.generate(iv, s.iv_sector),
            IvMode::Benbi { shift } => {
                iv.fill(0);
                let val = (s.iv_sector << shift).wrapping_add(1);
                let n = iv.len();
                iv[n - 8..].copy_from_slice(&val.to_be_bytes());
                Ok(())
            }
            IvMode::Null => {
                iv.fill(0);
                Ok(())
            }
            IvMode::Lmk(lmk) => lmk.generate(iv, s),
            IvMode::Tcw(tcw) => tcw.generate(iv, s),
            IvMode::Random => {
                rand::thread_rng().fill_bytes(iv);
                Ok(())
            }
        }
    }

    /// Payload post-processing after the cipher ran. Only lmk and tcw do
    /// anything here.
    pub fn post(&self, iv: &mut [u8], s: &mut SectorView) -> Result<(), IvError> {
        match self {
            IvMode::Lmk(lmk) => lmk.post(iv, s),
            IvMode::Tcw(tcw) => tcw.post(s),
            _ => Ok(()),
        }
    }

    pub fn has_post(&self) -> bool {
        matches!(self, IvMode::Lmk(_) | IvMode::Tcw(_))
    }

    /// Random-mode IVs cannot be recomputed; reads recover them from the
    /// per-sector integrity metadata instead.
    pub fn needs_metadata_iv(&self) -> bool {
        matches!(self, IvMode::Random)
    }
}
