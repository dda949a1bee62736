//! vnet session layer - Shared Memory Module
//!
//! Named segments shared with application processes, the space allocator
//! that places FIFOs inside them, and the event queues the dataplane uses to
//! notify applications.

pub mod error;
pub mod event_queue;
pub mod platform;
pub mod protocol;
pub mod region;
pub mod segment;

pub use error::*;
pub use event_queue::*;
pub use region::*;
pub use segment::*;

/// Re-export platform-specific implementations
pub use platform::*;

/// Current version of the segment layout
pub use protocol::SEGMENT_VERSION;
