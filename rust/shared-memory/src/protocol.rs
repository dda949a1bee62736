//! In-segment layouts shared with client processes
//!
//! A segment starts with a [`SegmentHeader`]. An event queue is a
//! [`EventQueueHeader`] immediately followed by `capacity` fixed-size
//! [`EventSlot`]s. All offsets are relative to the start of the segment.

use crate::{Result, ShmError};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Segment magic number ("VSEG")
pub const SEGMENT_MAGIC: u32 = 0x5653_4547;

/// Current segment layout version
pub const SEGMENT_VERSION: u32 = 1;

/// Event queue magic number ("VEVQ")
pub const EVENT_QUEUE_MAGIC: u32 = 0x5645_5651;

/// Queue accepts events
pub const QUEUE_STATE_LIVE: u32 = 1;
/// Queue was destroyed; posts fail
pub const QUEUE_STATE_DEAD: u32 = 2;

/// Size of one event slot in bytes
pub const EVENT_SLOT_SIZE: usize = 256;

/// Payload bytes available in one event slot
pub const EVENT_SLOT_DATA: usize = EVENT_SLOT_SIZE - 16;

/// Alignment of every structure placed in a segment
pub const LAYOUT_ALIGN: u64 = 64;

/// Fixed header at offset 0 of every segment
#[repr(C, align(64))]
pub struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    size: u64,
    /// Offset of the event queue, 0 when none is published
    event_queue_offset: AtomicU64,
}

impl SegmentHeader {
    pub const SIZE: usize = std::mem::size_of::<SegmentHeader>();

    /// Initialise a header at `ptr`; the magic is published last.
    ///
    /// # Safety
    /// `ptr` must be valid for `SIZE` writable bytes, 64-byte aligned, and
    /// stay mapped for `'a`.
    pub unsafe fn init<'a>(ptr: *mut u8, size: u64) -> &'a SegmentHeader {
        let header = ptr as *mut SegmentHeader;
        std::ptr::write(
            header,
            SegmentHeader {
                magic: AtomicU32::new(0),
                version: SEGMENT_VERSION,
                size,
                event_queue_offset: AtomicU64::new(0),
            },
        );
        let header = &*header;
        header.magic.store(SEGMENT_MAGIC, Ordering::Release);
        header
    }

    /// View an already initialised header, validating magic and version.
    ///
    /// # Safety
    /// Same requirements as [`SegmentHeader::init`].
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> Result<&'a SegmentHeader> {
        let header = &*(ptr as *const SegmentHeader);
        let magic = header.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(ShmError::Protocol(format!("bad segment magic {:#x}", magic)));
        }
        if header.version != SEGMENT_VERSION {
            return Err(ShmError::Protocol(format!(
                "unsupported segment version {}",
                header.version
            )));
        }
        Ok(header)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Make a fully initialised queue visible to readers
    pub fn publish_event_queue(&self, offset: u64) {
        self.event_queue_offset.store(offset, Ordering::Release);
    }

    pub fn clear_event_queue(&self) {
        self.event_queue_offset.store(0, Ordering::Release);
    }

    pub fn event_queue_offset(&self) -> Option<u64> {
        match self.event_queue_offset.load(Ordering::Acquire) {
            0 => None,
            offset => Some(offset),
        }
    }
}

/// Header of a bounded MPMC event ring
#[repr(C, align(64))]
pub struct EventQueueHeader {
    pub magic: AtomicU32,
    pub state: AtomicU32,
    pub capacity: u32,
    pub slot_size: u32,
    pub enqueue_pos: AtomicU64,
    pub dequeue_pos: AtomicU64,
}

impl EventQueueHeader {
    pub const SIZE: usize = std::mem::size_of::<EventQueueHeader>();

    /// Bytes needed for a queue of `capacity` slots
    pub fn footprint(capacity: u32) -> u64 {
        Self::SIZE as u64 + capacity as u64 * EVENT_SLOT_SIZE as u64
    }

    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == QUEUE_STATE_LIVE
    }
}

/// One ring slot: sequence word, payload length, CRC32, payload
#[repr(C)]
pub struct EventSlot {
    pub seq: AtomicU64,
    pub len: AtomicU32,
    pub checksum: AtomicU32,
    pub data: UnsafeCell<[u8; EVENT_SLOT_DATA]>,
}

/// Round `value` up to a multiple of `align` (a power of two)
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
