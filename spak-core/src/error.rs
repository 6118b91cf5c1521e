use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpakError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("archive is corrupt or tampered (chunk {chunk})")]
    Tampered { chunk: u64 },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("read of {len} bytes at offset {pos} runs past end of archive ({size} bytes)")]
    OutOfBounds { pos: u64, len: u64, size: u64 },

    #[error("chunk cache worker stopped")]
    Stopped,
}

impl SpakError {
    /// True when signed content failed verification, as opposed to an
    /// ordinary read failure.
    pub fn is_tampered(&self) -> bool {
        matches!(self, SpakError::Tampered { .. })
    }
}

impl From<SpakError> for std::io::Error {
    fn from(e: SpakError) -> Self {
        use std::io::ErrorKind;
        let kind = match e {
            SpakError::Io(inner) => return inner,
            SpakError::Tampered { .. } | SpakError::Format(_) => ErrorKind::InvalidData,
            SpakError::OutOfBounds { .. } => ErrorKind::UnexpectedEof,
            SpakError::Key(_) | SpakError::Config(_) => ErrorKind::InvalidInput,
            SpakError::Stopped => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, SpakError>;
