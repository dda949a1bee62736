//! vnet session layer
//!
//! Control plane through which applications attach to a vectorized network
//! session layer: each gets a shared memory segment and an event queue,
//! binds listeners, and opens or accepts transport connections. Connects
//! to a local listener that opted in are redirected to it without touching
//! the transport.

pub mod bind_table;
pub mod broker;
pub mod config;
pub mod layer;
pub mod logger;
pub mod registry;
pub mod sessions;

pub use bind_table::{BindTable, Listener};
pub use broker::{ConnectArgs, ConnectStatus, ConnectionBroker, PendingConnect};
pub use config::SessionLayerConfig;
pub use layer::{BindReply, SessionLayer};
pub use logger::init_logger;
pub use registry::{Application, ApplicationRegistry, AttachArgs, AttachReply, FifoPlacement};
pub use sessions::{SessionKind, SessionRecord, SessionTable};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
