//! Boundary to the transport protocol layer
//!
//! TCP/UDP state machines live outside this crate. The session layer hands
//! them listen keys and connect requests through [`TransportLayer`], and the
//! transport reports connect completions, accepted connections and closes
//! back through the session layer's notify entry points.

use crate::{ListenKey, Result, SessionHandle, TransportEndpoint};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbound connect request handed to the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConnect {
    /// Correlates the later completion with the pending request
    pub request_id: u32,
    pub destination: ListenKey,
}

/// Successful transport-level connect, reported on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSession {
    /// Worker thread that owns the new connection
    pub thread_index: u32,
    pub remote: TransportEndpoint,
}

/// Why an outbound connect did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectFailReason {
    Refused,
    TimedOut,
    Unreachable,
    Reset,
    /// No FIFO space could be placed for the session
    FifoExhausted,
    Other(i32),
}

impl fmt::Display for ConnectFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailReason::Refused => f.write_str("connection refused"),
            ConnectFailReason::TimedOut => f.write_str("connect timed out"),
            ConnectFailReason::Unreachable => f.write_str("destination unreachable"),
            ConnectFailReason::Reset => f.write_str("connection reset"),
            ConnectFailReason::FifoExhausted => f.write_str("no fifo space"),
            ConnectFailReason::Other(code) => write!(f, "transport error {}", code),
        }
    }
}

/// Transport protocol layer, as seen from the session layer.
///
/// Every call returns synchronously with acceptance or rejection. An
/// accepted `connect` completes later through the session layer's
/// `connect_notify`; implementations must not call back into the session
/// layer from within these methods.
pub trait TransportLayer: Send + Sync {
    /// Start listening on `key`; a rejection aborts the bind
    fn listen(&self, key: &ListenKey, listener: SessionHandle) -> Result<()>;

    /// Stop listening on `key`
    fn unlisten(&self, key: &ListenKey, listener: SessionHandle) -> Result<()>;

    /// Begin an outbound connection
    fn connect(&self, request: &TransportConnect) -> Result<()>;

    /// Close an established session
    fn disconnect(&self, handle: SessionHandle) -> Result<()>;
}
