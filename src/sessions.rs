//! Per-worker session pools
//!
//! Every worker thread owns a pool of session slots. A session handle is
//! the pair (worker, slot) packed by [`HandleCodec`]. Listeners take slots
//! in worker 0's pool so they share the handle namespace.

use parking_lot::Mutex;
use std::collections::VecDeque;
use vnet_session_core::{HandleCodec, ListenKey, Result, SessionError, SessionHandle};

use crate::registry::FifoPlacement;

/// What a session slot holds
#[derive(Debug, Clone)]
pub enum SessionKind {
    Listener { key: ListenKey },
    /// Outbound connection opened by the owning application
    Connected,
    /// Inbound connection accepted on `listener`
    Accepted { listener: SessionHandle },
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub app_index: u32,
    pub kind: SessionKind,
    pub fifos: Option<FifoPlacement>,
}

impl SessionRecord {
    pub fn listener(app_index: u32, key: ListenKey) -> Self {
        Self {
            app_index,
            kind: SessionKind::Listener { key },
            fifos: None,
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.kind, SessionKind::Listener { .. })
    }
}

/// Freed slots a pool holds back before reusing any. Handles carry no
/// generation, so a reused slot makes an old handle name the new session.
const REUSE_AFTER_FREED: usize = 64;

#[derive(Default)]
struct WorkerPool {
    slots: Vec<Option<SessionRecord>>,
    /// Freed slots, reused oldest first
    free: VecDeque<u32>,
    live: usize,
}

impl WorkerPool {
    fn alloc(&mut self, record: SessionRecord) -> Result<u32> {
        let fresh = u32::try_from(self.slots.len())
            .ok()
            .filter(|_| self.free.len() < REUSE_AFTER_FREED);
        let index = match fresh {
            Some(index) => {
                self.slots.push(None);
                index
            }
            None => self
                .free
                .pop_front()
                .ok_or_else(|| SessionError::ResourceExhausted("session pool full".to_string()))?,
        };
        self.slots[index as usize] = Some(record);
        self.live += 1;
        Ok(index)
    }

    fn get(&self, index: u32) -> Option<&SessionRecord> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    fn remove(&mut self, index: u32) -> Option<SessionRecord> {
        let record = self.slots.get_mut(index as usize)?.take()?;
        self.free.push_back(index);
        self.live -= 1;
        Some(record)
    }
}

/// Session pools of all workers
pub struct SessionTable {
    workers: Vec<Mutex<WorkerPool>>,
}

impl SessionTable {
    pub fn new(num_workers: u32) -> Self {
        Self {
            workers: (0..num_workers.max(1)).map(|_| Mutex::new(WorkerPool::default())).collect(),
        }
    }

    pub fn num_workers(&self) -> u32 {
        self.workers.len() as u32
    }

    fn pool(&self, thread_index: u32) -> Result<&Mutex<WorkerPool>> {
        self.workers.get(thread_index as usize).ok_or_else(|| {
            SessionError::InvalidArgument(format!(
                "thread index {} beyond {} workers",
                thread_index,
                self.workers.len()
            ))
        })
    }

    /// Store `record` in a free slot of `thread_index`'s pool
    pub fn alloc(&self, thread_index: u32, record: SessionRecord) -> Result<SessionHandle> {
        let pool = self.pool(thread_index)?;
        let mut pool = pool.lock();
        let session_index = pool.alloc(record)?;
        match HandleCodec::encode(thread_index, session_index) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                pool.remove(session_index);
                Err(e)
            }
        }
    }

    fn locate(&self, handle: SessionHandle) -> Result<(&Mutex<WorkerPool>, u32)> {
        let not_found = || SessionError::NotFound(format!("session {}", handle));
        let (thread_index, session_index) = handle.decode().map_err(|_| not_found())?;
        let pool = self.workers.get(thread_index as usize).ok_or_else(not_found)?;
        Ok((pool, session_index))
    }

    pub fn get(&self, handle: SessionHandle) -> Result<SessionRecord> {
        let (pool, index) = self.locate(handle)?;
        pool.lock()
            .get(index)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("session {}", handle)))
    }

    /// Free the slot; the handle stops resolving
    pub fn remove(&self, handle: SessionHandle) -> Result<SessionRecord> {
        let (pool, index) = self.locate(handle)?;
        pool.lock()
            .remove(index)
            .ok_or_else(|| SessionError::NotFound(format!("session {}", handle)))
    }

    /// Live non-listener sessions owned by `app_index`
    pub fn sessions_of(&self, app_index: u32) -> usize {
        self.workers
            .iter()
            .map(|pool| {
                pool.lock()
                    .slots
                    .iter()
                    .flatten()
                    .filter(|r| r.app_index == app_index && !r.is_listener())
                    .count()
            })
            .sum()
    }

    /// Live slots across all workers, listeners included
    pub fn len(&self) -> usize {
        self.workers.iter().map(|pool| pool.lock().live).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
