use std::io;

use thiserror::Error;

/// Errors surfaced by the container.
///
/// `Io` leaves a file being written in an undefined state — the caller must
/// discard it. `Format` means an open failed cleanly and no handle was
/// produced. `NotSupported` and `NotFound` leave state unchanged.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("format error: {0}")]
    Format(String),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<codec::CodecError> for EmuError {
    fn from(value: codec::CodecError) -> Self {
        match value {
            codec::CodecError::Io(err) => EmuError::Io(err),
            other => EmuError::Format(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmuError>;
