//! Transparent block-device encryption core.
//!
//! A [`Mapping`] interposes between an upper block client and a lower
//! [`common::BlockDevice`], presenting a virtual device whose sectors are
//! stored encrypted. Reads decrypt on the way up, writes encrypt on the
//! way down; operation is per-sector and stateless across sectors, so the
//! layout is crash-safe at sector granularity without a journal.
//!
//! The pipeline per write: the stage machine clones the I/O into pooled
//! pages, the converter feeds each sector through a cipher engine with an
//! IV tied to its logical address, and the write sequencer re-orders
//! completed clones by sector before submission. Reads run the same
//! machinery in reverse, decrypting in place after the device completes.
//!
//! Construction is driven by a table line (see [`TableArgs`]):
//!
//! ```text
//! aes-cbc-essiv:sha256 <hexkey> <iv_offset> <device> <start> [features]
//! ```

mod config;
mod convert;
mod error;
mod io;
mod key;
mod mapping;
mod pool;
mod queue;
mod request;
mod sequencer;

pub use config::{CipherKind, Features, TableArgs};
pub use error::MapError;
pub use io::{IoCompletion, UpperRequest};
pub use mapping::{MapOptions, Mapping, PoolStats, StatusType};

pub use common::{BlockStatus, Direction};
