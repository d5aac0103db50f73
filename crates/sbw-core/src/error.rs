use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// The input ended before a declared length was satisfied.
    #[error("truncated data at {offset:#x}: needed {needed} byte(s), {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown type tag {tag:#04x} at {offset:#x}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("read of {length} byte(s) at {offset:#x} is out of range (size {size:#x})")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidFormat(msg.into())
    }
}
