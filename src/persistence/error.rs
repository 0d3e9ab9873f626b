//! Persistence error types

use std::fmt;

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Errors surfaced by storage backends
#[derive(Debug)]
pub enum PersistenceError {
    /// Backend-level failure (I/O, corruption)
    Storage(String),
    /// Serialization failure
    Encode(bincode::error::EncodeError),
    /// Deserialization failure
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<fjall::Error> for PersistenceError {
    fn from(e: fjall::Error) -> Self {
        PersistenceError::Storage(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PersistenceError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PersistenceError::Decode(e)
    }
}
