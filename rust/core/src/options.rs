//! Application attach options

use crate::{Result, SessionError};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Index of an option in the attach option vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttachOption {
    EventQueueSize = 0,
    Flags = 1,
    SegmentSize = 2,
    AddSegmentSize = 3,
    RxFifoSize = 4,
    TxFifoSize = 5,
    AcceptCookie = 6,
}

impl AttachOption {
    /// Number of known options
    pub const COUNT: usize = 7;

    pub const ALL: [AttachOption; Self::COUNT] = [
        AttachOption::EventQueueSize,
        AttachOption::Flags,
        AttachOption::SegmentSize,
        AttachOption::AddSegmentSize,
        AttachOption::RxFifoSize,
        AttachOption::TxFifoSize,
        AttachOption::AcceptCookie,
    ];
}

impl TryFrom<u32> for AttachOption {
    type Error = SessionError;

    fn try_from(value: u32) -> Result<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| SessionError::InvalidArgument(format!("unknown attach option {}", value)))
    }
}

bitflags! {
    /// Application option flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OptionFlags: u64 {
        /// Server handles connects from local clients over FIFOs (redirect)
        const USE_FIFO    = 1 << 0;
        /// Add a segment and signal the app when FIFO space runs out
        const ADD_SEGMENT = 1 << 1;
        /// Application runs inside the dataplane process
        const BUILTIN_APP = 1 << 2;
    }
}

/// Largest event queue an application may ask for
pub const MAX_EVENT_QUEUE_SIZE: u32 = 1 << 16;

/// Smallest event queue; a one-slot ring cannot tell full from free
pub const MIN_EVENT_QUEUE_SIZE: u32 = 2;

/// Options an application attaches with.
///
/// Zero sizes mean "use the layer default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppOptions {
    pub evt_queue_size: u32,
    #[serde(with = "flags_bits")]
    pub flags: OptionFlags,
    pub segment_size: u64,
    pub add_segment_size: u64,
    pub rx_fifo_size: u32,
    pub tx_fifo_size: u32,
    pub accept_cookie: u64,
}

impl AppOptions {
    /// Build options from `(index, value)` pairs
    pub fn from_pairs(pairs: &[(u32, u64)]) -> Result<Self> {
        let mut options = Self::default();
        for (index, value) in pairs {
            options.set(AttachOption::try_from(*index)?, *value)?;
        }
        Ok(options)
    }

    /// Build options from a positional vector indexed by [`AttachOption`].
    ///
    /// Entries past the known options must be zero.
    pub fn from_array(values: &[u64]) -> Result<Self> {
        if let Some(pos) = values
            .iter()
            .enumerate()
            .skip(AttachOption::COUNT)
            .find_map(|(i, v)| (*v != 0).then_some(i))
        {
            return Err(SessionError::InvalidArgument(format!(
                "unknown attach option {}",
                pos
            )));
        }

        let mut options = Self::default();
        for (option, value) in AttachOption::ALL.iter().zip(values) {
            options.set(*option, *value)?;
        }
        Ok(options)
    }

    /// Set one option
    pub fn set(&mut self, option: AttachOption, value: u64) -> Result<()> {
        let narrow = |value: u64| {
            u32::try_from(value).map_err(|_| {
                SessionError::InvalidArgument(format!("{:?} value {} out of range", option, value))
            })
        };

        match option {
            AttachOption::EventQueueSize => self.evt_queue_size = narrow(value)?,
            AttachOption::Flags => {
                self.flags = OptionFlags::from_bits(value).ok_or_else(|| {
                    SessionError::InvalidArgument(format!("unknown option flags {:#x}", value))
                })?
            }
            AttachOption::SegmentSize => self.segment_size = value,
            AttachOption::AddSegmentSize => self.add_segment_size = value,
            AttachOption::RxFifoSize => self.rx_fifo_size = narrow(value)?,
            AttachOption::TxFifoSize => self.tx_fifo_size = narrow(value)?,
            AttachOption::AcceptCookie => self.accept_cookie = value,
        }
        Ok(())
    }

    /// Positional vector form, the inverse of [`AppOptions::from_array`]
    pub fn to_array(&self) -> [u64; AttachOption::COUNT] {
        [
            self.evt_queue_size as u64,
            self.flags.bits(),
            self.segment_size,
            self.add_segment_size,
            self.rx_fifo_size as u64,
            self.tx_fifo_size as u64,
            self.accept_cookie,
        ]
    }

    pub fn with_flags(mut self, flags: OptionFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn use_fifo_for_redirect(&self) -> bool {
        self.flags.contains(OptionFlags::USE_FIFO)
    }

    pub fn auto_add_segment(&self) -> bool {
        self.flags.contains(OptionFlags::ADD_SEGMENT)
    }

    pub fn is_builtin(&self) -> bool {
        self.flags.contains(OptionFlags::BUILTIN_APP)
    }

    /// Check values that are wrong regardless of layer defaults
    pub fn validate(&self) -> Result<()> {
        if self.evt_queue_size > MAX_EVENT_QUEUE_SIZE {
            return Err(SessionError::InvalidArgument(format!(
                "event queue size {} exceeds {}",
                self.evt_queue_size, MAX_EVENT_QUEUE_SIZE
            )));
        }
        if self.evt_queue_size != 0 && self.evt_queue_size < MIN_EVENT_QUEUE_SIZE {
            return Err(SessionError::InvalidArgument(format!(
                "event queue size {} below {}",
                self.evt_queue_size, MIN_EVENT_QUEUE_SIZE
            )));
        }

        let fifo_bytes = self.rx_fifo_size as u64 + self.tx_fifo_size as u64;
        if self.segment_size != 0 && fifo_bytes > self.segment_size {
            return Err(SessionError::InvalidArgument(format!(
                "fifo pair of {} bytes cannot fit a {} byte segment",
                fifo_bytes, self.segment_size
            )));
        }

        Ok(())
    }
}

mod flags_bits {
    use super::OptionFlags;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &OptionFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(flags.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OptionFlags, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        OptionFlags::from_bits(bits).ok_or_else(|| D::Error::custom(format!("unknown option flags {:#x}", bits)))
    }
}
