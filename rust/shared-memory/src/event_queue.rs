//! Event queues: bounded MPMC rings inside a segment
//!
//! The dataplane posts [`AppEvent`]s; the application (often in another
//! process) drains them. Each slot carries a sequence word in the style of
//! a Vyukov bounded queue, so producers and consumers never take a lock.

use crate::protocol::{
    EventQueueHeader, EventSlot, EVENT_QUEUE_MAGIC, EVENT_SLOT_DATA, EVENT_SLOT_SIZE,
    QUEUE_STATE_DEAD, QUEUE_STATE_LIVE,
};
use crate::{Segment, ShmError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use vnet_session_core::{
    AcceptedSession, AppEvent, CallbackMask, ConnectFailure, EstablishedSession,
    RedirectedConnect, Result, SegmentInfo, SessionCallbacks, SessionError, SessionHandle,
    MAX_EVENT_QUEUE_SIZE, MIN_EVENT_QUEUE_SIZE,
};

/// Poll interval of [`EventQueue::recv`]
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to an event queue living in a segment
pub struct EventQueue {
    segment: Arc<Segment>,
    offset: u64,
    capacity: u32,
}

impl EventQueue {
    /// Lay out a new queue inside `segment` and publish it in the header
    fn create_in(segment: Arc<Segment>, capacity: u32) -> Result<Self> {
        if segment.has_live_queue() {
            return Err(SessionError::ResourceExhausted(format!(
                "segment {} already hosts an event queue",
                segment.name()
            )));
        }

        let footprint = EventQueueHeader::footprint(capacity);
        let offset = segment.allocate(footprint)?;
        let base = match segment.region().ptr_at(offset as usize, footprint as usize) {
            Ok(base) => base,
            Err(e) => {
                segment.free(offset, footprint);
                return Err(e.into());
            }
        };

        unsafe {
            std::ptr::write(
                base as *mut EventQueueHeader,
                EventQueueHeader {
                    magic: AtomicU32::new(0),
                    state: AtomicU32::new(QUEUE_STATE_LIVE),
                    capacity,
                    slot_size: EVENT_SLOT_SIZE as u32,
                    enqueue_pos: AtomicU64::new(0),
                    dequeue_pos: AtomicU64::new(0),
                },
            );
            let slots = base.add(EventQueueHeader::SIZE) as *mut EventSlot;
            for i in 0..capacity as usize {
                let slot = slots.add(i);
                std::ptr::addr_of_mut!((*slot).seq).write(AtomicU64::new(i as u64));
                std::ptr::addr_of_mut!((*slot).len).write(AtomicU32::new(0));
                std::ptr::addr_of_mut!((*slot).checksum).write(AtomicU32::new(0));
            }
            (*(base as *const EventQueueHeader))
                .magic
                .store(EVENT_QUEUE_MAGIC, Ordering::Release);
        }

        segment.header().publish_event_queue(offset);

        Ok(Self {
            segment,
            offset,
            capacity,
        })
    }

    /// Attach to a queue another party created, validating its header
    pub fn attach(segment: Arc<Segment>, address: u64) -> Result<Self> {
        let base = segment
            .region()
            .ptr_at(address as usize, EventQueueHeader::SIZE)?;
        let header = unsafe { &*(base as *const EventQueueHeader) };

        let magic = header.magic.load(Ordering::Acquire);
        if magic != EVENT_QUEUE_MAGIC {
            return Err(SessionError::NotFound(format!(
                "no event queue at {:#x} in {} (magic {:#x})",
                address,
                segment.name(),
                magic
            )));
        }
        if header.slot_size as usize != EVENT_SLOT_SIZE {
            return Err(ShmError::Protocol(format!("unexpected slot size {}", header.slot_size)).into());
        }

        let capacity = header.capacity;
        if capacity < MIN_EVENT_QUEUE_SIZE {
            return Err(ShmError::Protocol(format!(
                "event queue at {:#x} in {} has {} slots",
                address,
                segment.name(),
                capacity
            ))
            .into());
        }
        segment
            .region()
            .ptr_at(address as usize, EventQueueHeader::footprint(capacity) as usize)?;

        Ok(Self {
            segment,
            offset: address,
            capacity,
        })
    }

    /// Opaque queue address: the byte offset inside its segment
    pub fn address(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn is_live(&self) -> bool {
        self.header().is_live()
    }

    /// Number of events waiting (approximate under concurrency)
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.enqueue_pos.load(Ordering::Acquire);
        let head = header.dequeue_pos.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn header(&self) -> &EventQueueHeader {
        unsafe { &*(self.segment.region().as_ptr().add(self.offset as usize) as *const EventQueueHeader) }
    }

    fn slot(&self, pos: u64) -> &EventSlot {
        let index = (pos % self.capacity as u64) as usize;
        unsafe {
            let slots = self
                .segment
                .region()
                .as_ptr()
                .add(self.offset as usize + EventQueueHeader::SIZE) as *const EventSlot;
            &*slots.add(index)
        }
    }

    /// Post an event. Never blocks: a full queue is an error.
    pub fn post(&self, event: &AppEvent) -> Result<()> {
        let header = self.header();
        if !header.is_live() {
            return Err(SessionError::NotFound(format!(
                "event queue {:#x} in {} was destroyed",
                self.offset,
                self.segment.name()
            )));
        }

        let bytes = event.encode()?;
        if bytes.len() > EVENT_SLOT_DATA {
            return Err(SessionError::InvalidArgument(format!(
                "event of {} bytes exceeds slot payload {}",
                bytes.len(),
                EVENT_SLOT_DATA
            )));
        }

        let mut pos = header.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                match header.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (&mut *slot.data.get())[..bytes.len()].copy_from_slice(&bytes);
                        }
                        slot.len.store(bytes.len() as u32, Ordering::Relaxed);
                        slot.checksum.store(crc32fast::hash(&bytes), Ordering::Relaxed);
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(SessionError::ResourceExhausted(format!(
                    "event queue {:#x} in {} is full ({} slots)",
                    self.offset,
                    self.segment.name(),
                    self.capacity
                )));
            } else {
                pos = header.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the next event if one is ready
    pub fn try_recv(&self) -> Result<Option<AppEvent>> {
        let header = self.header();
        let mut pos = header.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;

            if diff == 0 {
                match header.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let len = (slot.len.load(Ordering::Relaxed) as usize).min(EVENT_SLOT_DATA);
                        let checksum = slot.checksum.load(Ordering::Relaxed);
                        let bytes = unsafe { (&*slot.data.get())[..len].to_vec() };
                        slot.seq.store(pos + self.capacity as u64, Ordering::Release);

                        if crc32fast::hash(&bytes) != checksum {
                            return Err(ShmError::Protocol(format!(
                                "checksum mismatch in event queue {:#x}",
                                self.offset
                            ))
                            .into());
                        }
                        return AppEvent::decode(&bytes).map(Some);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Ok(None);
            } else {
                pos = header.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Wait up to `timeout` for the next event; `None` on timeout
    pub async fn recv(&self, timeout: Duration) -> Result<Option<AppEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_recv()? {
                return Ok(Some(event));
            }
            if !self.is_live() {
                return Err(SessionError::NotFound(format!(
                    "event queue {:#x} in {} was destroyed",
                    self.offset,
                    self.segment.name()
                )));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RECV_POLL_INTERVAL).await;
        }
    }

    fn mark_dead(&self) {
        self.header().state.store(QUEUE_STATE_DEAD, Ordering::Release);
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("segment", &self.segment.name())
            .field("address", &self.offset)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Creates and destroys the event queues of all applications
#[derive(Default)]
pub struct EventQueueManager {
    queues: RwLock<HashMap<(String, u64), Arc<EventQueue>>>,
}

impl EventQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue of `capacity` slots inside `segment`
    #[instrument(skip(self, segment), fields(segment = %segment.name()))]
    pub fn create(&self, segment: &Arc<Segment>, capacity: u32) -> Result<Arc<EventQueue>> {
        if !(MIN_EVENT_QUEUE_SIZE..=MAX_EVENT_QUEUE_SIZE).contains(&capacity) {
            return Err(SessionError::InvalidArgument(format!(
                "event queue capacity {} not in {}..={}",
                capacity, MIN_EVENT_QUEUE_SIZE, MAX_EVENT_QUEUE_SIZE
            )));
        }

        let queue = Arc::new(EventQueue::create_in(segment.clone(), capacity)?);
        self.queues
            .write()
            .insert((segment.name().to_string(), queue.address()), queue.clone());

        info!(
            "Created event queue at {:#x} in {} ({} slots)",
            queue.address(),
            segment.name(),
            capacity
        );
        Ok(queue)
    }

    /// Mark the queue dead, release its space and unpublish it
    #[instrument(skip(self))]
    pub fn destroy(&self, segment_name: &str, address: u64) -> Result<()> {
        let queue = self
            .queues
            .write()
            .remove(&(segment_name.to_string(), address))
            .ok_or_else(|| {
                SessionError::NotFound(format!("event queue {:#x} in {}", address, segment_name))
            })?;

        queue.mark_dead();
        queue.segment.header().clear_event_queue();
        queue
            .segment
            .free(address, EventQueueHeader::footprint(queue.capacity));

        debug!("Destroyed event queue at {:#x} in {}", address, segment_name);
        Ok(())
    }

    pub fn get(&self, segment_name: &str, address: u64) -> Option<Arc<EventQueue>> {
        self.queues
            .read()
            .get(&(segment_name.to_string(), address))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notification sink of an external application: every subscribed
/// callback becomes an [`AppEvent`] on its queue.
pub struct EventQueueNotifier {
    queue: Arc<EventQueue>,
    api_client_index: u32,
    subscribed: CallbackMask,
}

impl EventQueueNotifier {
    pub fn new(queue: Arc<EventQueue>, api_client_index: u32, subscribed: CallbackMask) -> Self {
        Self {
            queue,
            api_client_index,
            subscribed,
        }
    }

    pub fn api_client_index(&self) -> u32 {
        self.api_client_index
    }

    fn deliver(&self, event: AppEvent) -> Result<()> {
        if !self.subscribed.contains(event.mask()) {
            debug!(
                "Client {} not subscribed to {:?}, dropping event",
                self.api_client_index,
                event.mask()
            );
            return Ok(());
        }
        self.queue.post(&event)
    }

    fn deliver_or_log(&self, event: AppEvent) {
        if let Err(e) = self.deliver(event) {
            warn!("Failed to notify client {}: {}", self.api_client_index, e);
        }
    }
}

impl SessionCallbacks for EventQueueNotifier {
    fn connection_established(&self, session: &EstablishedSession) {
        self.deliver_or_log(session.into());
    }

    fn connection_failed(&self, failure: &ConnectFailure) {
        self.deliver_or_log(failure.into());
    }

    fn session_accepted(&self, session: &AcceptedSession) -> Result<()> {
        // A client that cannot be told about the session does not get it
        self.deliver(session.into())
    }

    fn session_disconnected(&self, handle: SessionHandle) {
        self.deliver_or_log(AppEvent::Disconnected { handle });
    }

    fn segment_added(&self, segment: &SegmentInfo) {
        self.deliver_or_log(AppEvent::SegmentAdded(segment.clone()));
    }

    fn redirect_connect(&self, request: &RedirectedConnect) -> Result<()> {
        // The client was told the server has it; the server must hear of it
        self.deliver(request.into())
    }
}
