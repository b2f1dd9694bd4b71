use thiserror::Error;

use cipher_engine::EngineError;
use common::KeyringError;
use iv_gen::IvError;

/// Construction, key-handling and control-interface failures. Per-I/O
/// outcomes travel on [`common::BlockStatus`] instead.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("not enough arguments")]
    NotEnoughArguments,
    #[error("invalid number of feature args")]
    FeatureCount,
    #[error("invalid feature arguments: {0}")]
    FeatureArgs(String),
    #[error("invalid feature value for sector_size")]
    SectorSize,
    #[error("bad cipher specification: {0}")]
    CipherSpec(String),
    #[error("bad cipher key count specification")]
    KeyCount,
    #[error("IV mechanism required")]
    IvRequired,
    #[error("cannot parse key size")]
    KeySize,
    #[error("error decoding and setting key: {0}")]
    Key(String),
    #[error("invalid iv_offset sector")]
    IvOffset,
    #[error("invalid device sector")]
    StartSector,
    #[error("integrity profile not supported")]
    IntegrityProfile,
    #[error("integrity profile tag size mismatch")]
    IntegrityTagSize,
    #[error("integrity profile sector size mismatch")]
    IntegritySectorSize,
    #[error("not enough space for integrity tag in the profile")]
    IntegritySpace,
    #[error("integrity AEAD auth tag size is not supported")]
    IntegrityAuthSize,
    #[error("not suspended during key manipulation")]
    NotSuspended,
    #[error("crypt key is not set")]
    KeyNotSet,
    #[error("unrecognised message received")]
    UnknownMessage,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Iv(#[from] IvError),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
}
