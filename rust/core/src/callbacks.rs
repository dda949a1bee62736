//! Notifications from the session layer to applications
//!
//! Builtin applications implement [`SessionCallbacks`] directly and are
//! called in-process. External applications live in another process; their
//! notifications travel as [`AppEvent`]s through the application's event
//! queue in shared memory.

use crate::{ConnectFailReason, Result, SessionHandle, TransportEndpoint};
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a session's FIFOs were placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoLocation {
    pub segment_name: String,
    pub rx_offset: u64,
    pub rx_size: u32,
    pub tx_offset: u64,
    pub tx_size: u32,
}

/// A segment the application has to map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub size: u64,
}

/// Outbound connect that reached the established state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    pub api_context: u32,
    pub external_token: Option<u32>,
    pub handle: SessionHandle,
    pub remote: TransportEndpoint,
    pub fifos: FifoLocation,
}

/// Outbound connect that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub api_context: u32,
    pub external_token: Option<u32>,
    pub reason: ConnectFailReason,
}

/// Incoming connection on one of the application's listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSession {
    pub handle: SessionHandle,
    pub listener: SessionHandle,
    pub remote: TransportEndpoint,
    pub accept_cookie: u64,
    pub fifos: FifoLocation,
}

/// Connect from a local client, handed straight to the listening application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectedConnect {
    pub client_app_index: u32,
    pub api_context: u32,
    pub external_token: Option<u32>,
    pub listener: SessionHandle,
    /// Opaque request payload for the server to replay
    pub payload: Bytes,
}

/// Notification interface every attached application exposes.
///
/// Builtin applications may leave any method at its default.
pub trait SessionCallbacks: Send + Sync {
    fn connection_established(&self, _session: &EstablishedSession) {}

    fn connection_failed(&self, _failure: &ConnectFailure) {}

    /// Returning an error rejects the connection
    fn session_accepted(&self, _session: &AcceptedSession) -> Result<()> {
        Ok(())
    }

    fn session_disconnected(&self, _handle: SessionHandle) {}

    fn segment_added(&self, _segment: &SegmentInfo) {}

    /// Returning an error fails the redirected connect
    fn redirect_connect(&self, _request: &RedirectedConnect) -> Result<()> {
        Ok(())
    }
}

bitflags! {
    /// Notifications an external application subscribed to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackMask: u32 {
        const CONNECTED     = 1 << 0;
        const ACCEPTED      = 1 << 1;
        const DISCONNECTED  = 1 << 2;
        const SEGMENT_ADDED = 1 << 3;
        const REDIRECT      = 1 << 4;
    }
}

impl CallbackMask {
    /// Minimum subscription of any external application
    pub const REQUIRED: CallbackMask = CallbackMask::CONNECTED
        .union(CallbackMask::ACCEPTED)
        .union(CallbackMask::DISCONNECTED)
        .union(CallbackMask::SEGMENT_ADDED);
}

/// Callback set supplied at attach
#[derive(Clone)]
pub enum AppCallbacks {
    /// In-process application, notified by direct calls
    Builtin(Arc<dyn SessionCallbacks>),
    /// Application in another process, notified through its event queue
    External {
        api_client_index: u32,
        subscribed: CallbackMask,
    },
}

impl AppCallbacks {
    pub fn is_builtin(&self) -> bool {
        matches!(self, AppCallbacks::Builtin(_))
    }
}

impl std::fmt::Debug for AppCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppCallbacks::Builtin(_) => f.write_str("Builtin"),
            AppCallbacks::External {
                api_client_index,
                subscribed,
            } => f
                .debug_struct("External")
                .field("api_client_index", api_client_index)
                .field("subscribed", subscribed)
                .finish(),
        }
    }
}

/// Notification as written to an external application's event queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppEvent {
    Connected {
        api_context: u32,
        external_token: Option<u32>,
        handle: SessionHandle,
        remote: TransportEndpoint,
        fifos: FifoLocation,
    },
    ConnectFailed {
        api_context: u32,
        external_token: Option<u32>,
        reason: ConnectFailReason,
    },
    Accepted {
        handle: SessionHandle,
        listener: SessionHandle,
        remote: TransportEndpoint,
        accept_cookie: u64,
        fifos: FifoLocation,
    },
    Disconnected {
        handle: SessionHandle,
    },
    SegmentAdded(SegmentInfo),
    RedirectConnect {
        client_app_index: u32,
        api_context: u32,
        external_token: Option<u32>,
        listener: SessionHandle,
        payload: Vec<u8>,
    },
}

impl AppEvent {
    /// Subscription bit that gates this event
    pub fn mask(&self) -> CallbackMask {
        match self {
            AppEvent::Connected { .. } | AppEvent::ConnectFailed { .. } => CallbackMask::CONNECTED,
            AppEvent::Accepted { .. } => CallbackMask::ACCEPTED,
            AppEvent::Disconnected { .. } => CallbackMask::DISCONNECTED,
            AppEvent::SegmentAdded(_) => CallbackMask::SEGMENT_ADDED,
            AppEvent::RedirectConnect { .. } => CallbackMask::REDIRECT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl From<&EstablishedSession> for AppEvent {
    fn from(s: &EstablishedSession) -> Self {
        AppEvent::Connected {
            api_context: s.api_context,
            external_token: s.external_token,
            handle: s.handle,
            remote: s.remote,
            fifos: s.fifos.clone(),
        }
    }
}

impl From<&ConnectFailure> for AppEvent {
    fn from(f: &ConnectFailure) -> Self {
        AppEvent::ConnectFailed {
            api_context: f.api_context,
            external_token: f.external_token,
            reason: f.reason,
        }
    }
}

impl From<&AcceptedSession> for AppEvent {
    fn from(s: &AcceptedSession) -> Self {
        AppEvent::Accepted {
            handle: s.handle,
            listener: s.listener,
            remote: s.remote,
            accept_cookie: s.accept_cookie,
            fifos: s.fifos.clone(),
        }
    }
}

impl From<&RedirectedConnect> for AppEvent {
    fn from(r: &RedirectedConnect) -> Self {
        AppEvent::RedirectConnect {
            client_app_index: r.client_app_index,
            api_context: r.api_context,
            external_token: r.external_token,
            listener: r.listener,
            payload: r.payload.to_vec(),
        }
    }
}
