//! Session handle encoding
//!
//! A session handle packs the index of the worker thread owning the session
//! together with the session's slot in that worker's pool:
//!
//! ```text
//!  63      56 55                     32 31                              0
//! +----------+-------------------------+--------------------------------+
//! | reserved |      thread index       |       session slot index       |
//! +----------+-------------------------+--------------------------------+
//! ```
//!
//! Reserved bits are always zero in handles produced by [`HandleCodec::encode`],
//! which keeps [`SessionHandle::INVALID`] (all ones) out of the valid range.

use crate::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 64-bit session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Handle that never names a session
    pub const INVALID: SessionHandle = SessionHandle(u64::MAX);

    /// Wrap a raw value received from an application
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value handed to applications
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Decode into `(thread_index, session_index)`
    pub fn decode(self) -> Result<(u32, u32)> {
        HandleCodec::decode(self)
    }

    /// Worker thread owning the session
    pub fn thread_index(self) -> u32 {
        ((self.0 >> HandleCodec::SESSION_INDEX_BITS) & HandleCodec::THREAD_INDEX_MASK) as u32
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Bit-packing codec for [`SessionHandle`]
pub struct HandleCodec;

impl HandleCodec {
    /// Width of the per-thread session slot index
    pub const SESSION_INDEX_BITS: u32 = 32;
    /// Width of the worker thread index
    pub const THREAD_INDEX_BITS: u32 = 24;
    /// Largest encodable thread index
    pub const MAX_THREAD_INDEX: u32 = (1 << Self::THREAD_INDEX_BITS) - 1;

    const THREAD_INDEX_MASK: u64 = (1 << Self::THREAD_INDEX_BITS) - 1;
    const RESERVED_MASK: u64 =
        !((1u64 << (Self::SESSION_INDEX_BITS + Self::THREAD_INDEX_BITS)) - 1);

    /// Pack a thread index and session slot index into a handle
    pub fn encode(thread_index: u32, session_index: u32) -> Result<SessionHandle> {
        if thread_index > Self::MAX_THREAD_INDEX {
            return Err(SessionError::InvalidArgument(format!(
                "thread index {} exceeds {} bits",
                thread_index,
                Self::THREAD_INDEX_BITS
            )));
        }

        Ok(SessionHandle(
            ((thread_index as u64) << Self::SESSION_INDEX_BITS) | session_index as u64,
        ))
    }

    /// Unpack a handle into `(thread_index, session_index)`
    pub fn decode(handle: SessionHandle) -> Result<(u32, u32)> {
        if handle.0 & Self::RESERVED_MASK != 0 {
            return Err(SessionError::InvalidArgument(format!(
                "handle {} has reserved bits set",
                handle
            )));
        }

        Ok((handle.thread_index(), handle.0 as u32))
    }
}
