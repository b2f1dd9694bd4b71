//! Cipher engine abstraction and software backends.
//!
//! The encryption core treats engines as black boxes with a
//! setkey/process surface and an asynchronous completion channel. An
//! engine may finish a request inline, accept it for asynchronous
//! processing, or backlog it when its input queue is full; backlogged
//! requests complete in two events (a restart notification when processing
//! begins, then the final result).
//!
//! Software backends cover the block-cipher modes (`cbc`, `ecb`, `xts`
//! over AES) and the AEAD modes (`gcm`, `authenc`); they always complete
//! inline. [`QueuedEngine`] wraps any inline engine behind a bounded
//! worker queue to produce genuinely asynchronous and backlogged
//! completions.

mod aead;
mod block;
mod offload;
mod queued;

use thiserror::Error;
use zeroize::Zeroizing;

pub use aead::{AuthencEngine, GcmEngine};
pub use block::{CbcEngine, EcbEngine, XtsEngine};
pub use offload::SoftOffload;
pub use queued::QueuedEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid key size {0}")]
    InvalidKeySize(usize),
    #[error("no key installed")]
    KeyNotSet,
    #[error("integrity tag mismatch")]
    BadTag,
    #[error("unsupported auth tag size {0}")]
    BadAuthSize(usize),
    #[error("unknown cipher api spec: {0}")]
    UnknownSpec(String),
    #[error("unsupported mac algorithm: {0}")]
    UnknownMac(String),
    #[error("bad composite key encoding")]
    BadCompositeKey,
    #[error("payload length {0} is not a multiple of the cipher block")]
    BadLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Block,
    Aead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptOp {
    Encrypt,
    Decrypt,
}

/// One sector's worth of work, owned by whoever currently holds it.
///
/// `iv` is the engine's working copy and may be mutated; callers that need
/// the original value keep their own. For AEAD both `sector_le` and the IV
/// are authenticated as associated data; `tag` is produced on encrypt and
/// consumed on decrypt.
pub struct CipherRequest {
    pub sector_le: [u8; 8],
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
    pub tag: Vec<u8>,
}

impl CipherRequest {
    pub fn empty() -> Self {
        Self { sector_le: [0; 8], iv: Vec::new(), data: Vec::new(), tag: Vec::new() }
    }
}

pub enum EngineEvent {
    /// A backlogged request has started processing; a second event follows.
    Restarted,
    Finished(CipherRequest, Result<(), EngineError>),
}

/// Invoked once for in-flight requests, twice for backlogged ones.
pub type EngineCallback = Box<dyn FnMut(EngineEvent) + Send>;

pub enum SubmitStatus {
    /// Finished on the submitting thread; the callback was not invoked.
    Completed(CipherRequest, Result<(), EngineError>),
    /// Accepted; the callback delivers the result later.
    InFlight,
    /// Accepted into the backlog because the input queue was full; the
    /// callback fires `Restarted` when processing begins.
    Backlogged,
}

pub trait CipherEngine: Send + Sync {
    fn kind(&self) -> EngineKind;
    fn iv_size(&self) -> usize;
    fn block_size(&self) -> usize;
    fn set_key(&self, key: &[u8]) -> Result<(), EngineError>;
    /// AEAD only: configure the produced/verified tag length.
    fn set_auth_size(&self, size: usize) -> Result<(), EngineError> {
        let _ = size;
        Err(EngineError::BadAuthSize(0))
    }
    fn process(&self, op: CryptOp, req: CipherRequest, done: EngineCallback) -> SubmitStatus;
}

/// Allocate a software engine for a crypto API spec string.
pub fn alloc_engine(api: &str) -> Result<std::sync::Arc<dyn CipherEngine>, EngineError> {
    use std::sync::Arc;

    if let Some(mac) = authenc_mac_alg(api) {
        let inner = api
            .split_once(',')
            .map(|(_, rest)| rest.strip_suffix(')').unwrap_or(rest))
            .unwrap_or("");
        if inner != "cbc(aes)" {
            return Err(EngineError::UnknownSpec(api.to_string()));
        }
        return Ok(Arc::new(AuthencEngine::new(mac)?));
    }

    match api {
        "cbc(aes)" => Ok(Arc::new(CbcEngine::new())),
        "ecb(aes)" => Ok(Arc::new(EcbEngine::new())),
        "xts(aes)" => Ok(Arc::new(XtsEngine::new())),
        "gcm(aes)" => Ok(Arc::new(GcmEngine::new())),
        other => Err(EngineError::UnknownSpec(other.to_string())),
    }
}

/// Extract the HMAC hash name from an `authenc(hmac(...)...)` spec.
pub fn authenc_mac_alg(api: &str) -> Option<&str> {
    let rest = api.strip_prefix("authenc(hmac(")?;
    let end = rest.find(')')?;
    Some(&rest[..end])
}

pub fn mac_digest_size(alg: &str) -> Result<usize, EngineError> {
    match alg {
        "sha256" => Ok(32),
        "sha512" => Ok(64),
        other => Err(EngineError::UnknownMac(other.to_string())),
    }
}

/// Extract the bare block-cipher name from an api spec, e.g. `aes` from
/// `xts(aes)` or from `authenc(hmac(sha256),cbc(aes))`. ESSIV keys a second
/// instance of this cipher.
pub fn inner_cipher_name(api: &str) -> Option<&str> {
    let tail = match api.split_once(',') {
        Some((head, rest)) if head.starts_with("authenc(") => rest,
        _ => api,
    };
    match (tail.rfind('('), tail.find(')')) {
        (None, None) => Some(tail),
        (Some(start), Some(end)) if start < end => Some(&tail[start + 1..end]),
        _ => None,
    }
}

// Composite key encoding for authenc engines. The outer key wraps the
// encryption and authentication sub-keys in a small TLV so a single setkey
// call carries both:
//
//   | u16 len | u16 type=1 | u32 enckeylen (BE) | auth key | enc key |
const COMPOSITE_HEADER: usize = 8;
const COMPOSITE_TYPE: u16 = 1;

pub fn build_composite_key(enc_key: &[u8], auth_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(
        COMPOSITE_HEADER + enc_key.len() + auth_key.len(),
    ));
    out.extend_from_slice(&(COMPOSITE_HEADER as u16).to_le_bytes());
    out.extend_from_slice(&COMPOSITE_TYPE.to_le_bytes());
    out.extend_from_slice(&(enc_key.len() as u32).to_be_bytes());
    out.extend_from_slice(auth_key);
    out.extend_from_slice(enc_key);
    out
}

pub fn parse_composite_key(key: &[u8]) -> Result<(&[u8], &[u8]), EngineError> {
    if key.len() < COMPOSITE_HEADER {
        return Err(EngineError::BadCompositeKey);
    }
    let len = u16::from_le_bytes(key[0..2].try_into().unwrap()) as usize;
    let typ = u16::from_le_bytes(key[2..4].try_into().unwrap());
    let enckeylen = u32::from_be_bytes(key[4..8].try_into().unwrap()) as usize;
    if len != COMPOSITE_HEADER || typ != COMPOSITE_TYPE {
        return Err(EngineError::BadCompositeKey);
    }
    let rest = &key[COMPOSITE_HEADER..];
    if enckeylen > rest.len() {
        return Err(EngineError::BadCompositeKey);
    }
    let (auth, enc) = rest.split_at(rest.len() - enckeylen);
    Ok((auth, enc))
}
