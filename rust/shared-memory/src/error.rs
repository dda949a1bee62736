//! Shared memory specific error types

use thiserror::Error;
use vnet_session_core::SessionError;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum ShmError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Region not found
    #[error("Shared memory region not found: {0}")]
    RegionNotFound(String),

    /// Region already exists
    #[error("Shared memory region already exists: {0}")]
    RegionExists(String),

    /// Invalid region size
    #[error("Invalid region size: {size}, must be between {min} and {max}")]
    InvalidSize { size: usize, min: usize, max: usize },

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Segment has no free range large enough
    #[error("Segment {segment} has no room for {requested} bytes")]
    OutOfSpace { segment: String, requested: u64 },

    /// Segment layout does not match
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ShmError>;

impl ShmError {
    /// Convert platform-specific error codes to ShmError
    pub fn from_platform_error(error: i32, message: impl Into<String>) -> Self {
        match error {
            13 => ShmError::PermissionDenied(message.into()), // EACCES
            2 => ShmError::RegionNotFound(message.into()),    // ENOENT
            17 => ShmError::RegionExists(message.into()),     // EEXIST
            _ => ShmError::Platform(format!("Error {}: {}", error, message.into())),
        }
    }
}

impl From<ShmError> for SessionError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::RegionNotFound(name) => SessionError::NotFound(format!("segment {}", name)),
            ShmError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            ShmError::Protocol(msg) => SessionError::InvalidArgument(msg),
            other => SessionError::ResourceExhausted(other.to_string()),
        }
    }
}
