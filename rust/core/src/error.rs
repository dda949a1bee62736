//! Error types for the session layer control plane

use thiserror::Error;

/// Session layer error types
///
/// Every synchronous control-plane operation (attach, detach, bind, unbind,
/// connect submission, disconnect) returns one of these or success.
/// Asynchronous outcomes are delivered as notifications instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed endpoint or URI, incomplete callback set, out-of-range handle
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Listen key already has a listener
    #[error("Already bound: {0}")]
    AlreadyBound(String),

    /// Unknown application index, listener key or session handle
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted by a non-owning application
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Segment or queue allocation failure
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Resource still in use
    #[error("Resource busy: {0}")]
    ResourceBusy(String),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error kinds, without the context message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyBound,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    ResourceBusy,
}

impl SessionError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SessionError::AlreadyBound(_) => ErrorKind::AlreadyBound,
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SessionError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SessionError::ResourceBusy(_) => ErrorKind::ResourceBusy,
        }
    }

    /// Numeric reply code for API front ends.
    ///
    /// Always negative, so it never collides with success (0) or with
    /// [`crate::VNET_CONNECT_REDIRECTED`].
    pub fn code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidArgument => -1,
            ErrorKind::AlreadyBound => -2,
            ErrorKind::NotFound => -3,
            ErrorKind::PermissionDenied => -4,
            ErrorKind::ResourceExhausted => -5,
            ErrorKind::ResourceBusy => -6,
        }
    }

    /// Whether a caller may reasonably retry later.
    ///
    /// This layer itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted | ErrorKind::ResourceBusy
        )
    }
}

impl From<bincode::Error> for SessionError {
    fn from(err: bincode::Error) -> Self {
        SessionError::InvalidArgument(format!("event encoding: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let errors = [
            SessionError::InvalidArgument(String::new()),
            SessionError::AlreadyBound(String::new()),
            SessionError::NotFound(String::new()),
            SessionError::PermissionDenied(String::new()),
            SessionError::ResourceExhausted(String::new()),
            SessionError::ResourceBusy(String::new()),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&crate::VNET_CONNECT_REDIRECTED));
    }

    #[test]
    fn test_transient_kinds() {
        assert!(SessionError::ResourceBusy("listener".into()).is_transient());
        assert!(!SessionError::NotFound("app 3".into()).is_transient());
        assert_eq!(
            SessionError::AlreadyBound("tcp".into()).kind(),
            ErrorKind::AlreadyBound
        );
    }
}
