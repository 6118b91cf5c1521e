#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod source;
pub mod stats;

pub mod container {
    pub mod layout;
}

pub mod crypto;

pub mod cache {
    pub mod buffer;
    pub mod request;
    pub mod worker;
}

pub mod read {
    pub mod signed;
}

pub mod repo;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports: stable API surface
pub use cache::request::ChunkHandle;
pub use cache::worker::ChunkCacheWorker;
pub use config::CacheConfig;
pub use container::layout::ChunkLayout;
pub use crypto::ChunkCrypto;
pub use crypto::cipher::CipherKey;
pub use crypto::sign::ArchiveKey;
pub use error::{Result, SpakError};
pub use read::signed::SignedArchiveReader;
pub use repo::{OpenParams, SignedArchive};
pub use source::{ByteSource, FileSource, MemorySource};
pub use stats::Stats;
