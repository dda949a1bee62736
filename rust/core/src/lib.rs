//! vnet session layer - Core Module
//!
//! Types shared by every part of the session layer: the session handle
//! codec, transport endpoints and listen keys, attach options, the
//! application notification interface and the boundary to the transport
//! protocol layer.

pub mod callbacks;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod options;
pub mod transport;

pub use callbacks::*;
pub use endpoint::*;
pub use error::*;
pub use handle::*;
pub use options::*;
pub use transport::*;

/// Re-export common types
pub mod prelude {
    pub use crate::{
        callbacks::{AppCallbacks, AppEvent, CallbackMask, SessionCallbacks},
        endpoint::{EndpointArg, ListenKey, Protocol, TransportEndpoint, UnbindTarget},
        error::{Result, SessionError},
        handle::{HandleCodec, SessionHandle},
        options::{AppOptions, AttachOption, OptionFlags},
        transport::TransportLayer,
    };
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returned by connect when the request was handed to a local listener
/// instead of the transport layer
pub const VNET_CONNECT_REDIRECTED: i32 = 123;
