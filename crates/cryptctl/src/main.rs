//! Control utility: map a file-backed device through the encryption layer
//! and poke at it from the command line.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockdev_sim::FileDevice;
use common::{BlockDevice, IntegrityProfile, KeyKind, MemoryKeyring};
use crypt_core::{Mapping, StatusType};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();
}

#[derive(Parser)]
#[command(name = "cryptctl")]
#[command(about = "Transparent block-device encryption control utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backing device image
    CreateDev {
        /// Image path
        path: String,
        /// Capacity in 512-byte sectors
        sectors: u64,
        /// Per-sector integrity sideband bytes
        #[arg(long, default_value_t = 0)]
        tag_size: usize,
        /// Integrity interval in bytes (the encryption sector size)
        #[arg(long, default_value_t = 512)]
        interval: usize,
    },
    /// Print the table-form status of a mapping
    Status {
        /// Backing image path
        path: String,
        /// Mapping table line (without the device token resolved)
        table: String,
    },
    /// Write hex bytes at a logical sector
    Write {
        path: String,
        table: String,
        sector: u64,
        /// Payload as hex; length must be a multiple of the sector size
        hex: String,
    },
    /// Read bytes at a logical sector and print them as hex
    Read {
        path: String,
        table: String,
        sector: u64,
        /// Length in bytes
        length: usize,
    },
    /// Send a control message (e.g. "key wipe") to a suspended mapping
    Message {
        path: String,
        table: String,
        message: String,
    },
}

/// Keys referenced as `:<size>:user:<desc>` resolve through the process
/// keyring, seeded from `CRYPTCTL_KEY_<DESC>` environment variables.
fn build_keyring() -> Arc<MemoryKeyring> {
    let ring = MemoryKeyring::new();
    for (name, value) in std::env::vars() {
        if let Some(desc) = name.strip_prefix("CRYPTCTL_KEY_") {
            if let Ok(bytes) = hex::decode(value) {
                ring.insert(KeyKind::User, &desc.to_ascii_lowercase(), bytes);
            }
        }
    }
    Arc::new(ring)
}

fn open_mapping(path: &str, table: &str) -> Result<Mapping> {
    let dev = FileDevice::open(path).context("open backing device")?;
    let keyring = build_keyring();
    Mapping::from_table(table, dev, keyring)
        .with_context(|| format!("construct mapping from table: {table}"))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::CreateDev { path, sectors, tag_size, interval } => {
            let profile =
                (tag_size > 0).then_some(IntegrityProfile { tag_size, interval });
            let dev = FileDevice::create(&path, sectors, profile)
                .context("create backing device")?;
            info!(path = %dev.name(), sectors, tag_size, "device created");
            println!("{} ({} sectors)", dev.name(), sectors);
        }
        Commands::Status { path, table } => {
            let mapping = open_mapping(&path, &table)?;
            println!("{}", mapping.status(StatusType::Table));
        }
        Commands::Write { path, table, sector, hex } => {
            let payload = ::hex::decode(hex).context("decode hex payload")?;
            let mapping = open_mapping(&path, &table)?;
            if let Err(status) = mapping.write_at(sector, &payload) {
                bail!("write failed: {status:?}");
            }
            info!(sector, len = payload.len(), "write complete");
        }
        Commands::Read { path, table, sector, length } => {
            let mapping = open_mapping(&path, &table)?;
            match mapping.read_at(sector, length) {
                Ok(data) => println!("{}", ::hex::encode(data)),
                Err(status) => bail!("read failed: {status:?}"),
            }
        }
        Commands::Message { path, table, message } => {
            let mapping = open_mapping(&path, &table)?;
            mapping.suspend();
            mapping.message(&message).context("message rejected")?;
            if message.trim() != "key wipe" {
                mapping.resume().context("resume failed")?;
            }
            info!(%message, "message applied");
        }
    }

    Ok(())
}
