//! Error types for pyramid construction, storage and encoding

use thiserror::Error;

/// Main error type for volseg operations
#[derive(Error, Debug)]
pub enum VolsegError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A grid value has no entry in the set table it is read against.
    #[error("Unknown category id: {0}")]
    UnknownCategoryId(u32),

    /// The pyramid contradicts itself (duplicated sets, missing levels, ...).
    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    /// An encoder was asked to store values its declared type cannot hold.
    #[error("Encoder range violation: {0}")]
    EncoderRange(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Specialized Result type for volseg operations
pub type Result<T> = std::result::Result<T, VolsegError>;

impl From<bincode::Error> for VolsegError {
    fn from(err: bincode::Error) -> Self {
        VolsegError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VolsegError {
    fn from(err: serde_json::Error) -> Self {
        VolsegError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for VolsegError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        VolsegError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for VolsegError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        VolsegError::Decode(err.to_string())
    }
}

impl From<ndarray::ShapeError> for VolsegError {
    fn from(err: ndarray::ShapeError) -> Self {
        VolsegError::InvalidDimensions(err.to_string())
    }
}
