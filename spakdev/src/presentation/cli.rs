use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "spakdev CLI (alpha)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Cache tuning. Flags override values loaded from `--config`.
#[derive(Args, Clone, Debug, Default)]
pub struct CacheArgs {
    /// JSON file holding a cache config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// logical bytes per chunk
    #[arg(long = "chunk-size")]
    pub chunk_size: Option<u64>,

    /// number of chunk buffers
    #[arg(long = "pool-size")]
    pub pool_size: Option<usize>,

    /// chunks to request ahead of each read
    #[arg(long)]
    pub precache: Option<usize>,
}

#[derive(Args, Clone, Debug)]
pub struct KeyArgs {
    /// 32-byte hex Ed25519 public key that signed the archive
    #[arg(long = "pubkey")]
    pub pubkey_hex: String,

    /// 32-byte hex key for encrypted archives
    #[arg(long = "key")]
    pub key_hex: Option<String>,

    /// 32-byte hex salt used during sealing
    #[arg(long = "key-salt")]
    pub key_salt_hex: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print archive geometry without verifying anything
    Info {
        archive: PathBuf,

        #[arg(long = "signature-len", default_value_t = 64)]
        signature_len: u64,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Verify every chunk signature
    Verify {
        archive: PathBuf,

        #[command(flatten)]
        keys: KeyArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Stream verified bytes (or a range) to stdout
    Cat {
        archive: PathBuf,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long)]
        len: Option<u64>,

        #[command(flatten)]
        keys: KeyArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Write verified bytes (or a range) to an output path
    Get {
        archive: PathBuf,
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long)]
        len: Option<u64>,

        #[command(flatten)]
        keys: KeyArgs,

        #[command(flatten)]
        cache: CacheArgs,
    },
}
