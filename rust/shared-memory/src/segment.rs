//! Named segments and the manager that creates them

use crate::protocol::{align_up, SegmentHeader, LAYOUT_ALIGN};
use crate::{PlatformUtils, RegionBacking, Result, SharedMemoryRegion, ShmError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vnet_session_core::{SegmentInfo, SessionError};

/// A mapped segment plus the allocator carving its space
pub struct Segment {
    name: String,
    size: u64,
    region: SharedMemoryRegion,
    /// Free ranges as (offset, len), sorted by offset
    free: Mutex<Vec<(u64, u64)>>,
}

impl Segment {
    /// Wrap a freshly created region and write its header
    pub fn new(region: SharedMemoryRegion) -> Self {
        let size = region.size as u64;
        unsafe { SegmentHeader::init(region.as_ptr(), size) };

        let start = align_up(SegmentHeader::SIZE as u64, LAYOUT_ALIGN);
        let free = if size > start {
            vec![(start, size - start)]
        } else {
            Vec::new()
        };

        Self {
            name: region.name.clone(),
            size,
            region,
            free: Mutex::new(free),
        }
    }

    /// Map a segment created by another process. The result has no free
    /// space of its own; only the creator allocates.
    pub fn open(name: &str) -> Result<Arc<Self>> {
        let region = SharedMemoryRegion::open(name)?;
        let header = unsafe { SegmentHeader::from_ptr(region.as_ptr())? };
        if header.size() != region.size as u64 {
            return Err(ShmError::Protocol(format!(
                "segment {} header size {} does not match mapping {}",
                name,
                header.size(),
                region.size
            )));
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            size: region.size as u64,
            region,
            free: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    pub fn header(&self) -> &SegmentHeader {
        // The header was initialised or validated when the segment was built
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            name: self.name.clone(),
            size: self.size,
        }
    }

    /// Whether an event queue is currently published in this segment
    pub fn has_live_queue(&self) -> bool {
        self.header().event_queue_offset().is_some()
    }

    /// Reserve `len` bytes, first fit. Offsets are 64-byte aligned.
    pub fn allocate(&self, len: u64) -> Result<u64> {
        let len = align_up(len.max(1), LAYOUT_ALIGN);
        let mut free = self.free.lock();

        let pos = free
            .iter()
            .position(|&(_, avail)| avail >= len)
            .ok_or_else(|| ShmError::OutOfSpace {
                segment: self.name.clone(),
                requested: len,
            })?;

        let (offset, avail) = free[pos];
        if avail == len {
            free.remove(pos);
        } else {
            free[pos] = (offset + len, avail - len);
        }

        Ok(offset)
    }

    /// Return a range obtained from [`Segment::allocate`]
    pub fn free(&self, offset: u64, len: u64) {
        let len = align_up(len.max(1), LAYOUT_ALIGN);
        let mut free = self.free.lock();

        let pos = free.partition_point(|&(o, _)| o < offset);
        free.insert(pos, (offset, len));

        // Merge with the following range
        if pos + 1 < free.len() && offset + len == free[pos + 1].0 {
            free[pos].1 += free[pos + 1].1;
            free.remove(pos + 1);
        }
        // Merge with the preceding range
        if pos > 0 && free[pos - 1].0 + free[pos - 1].1 == offset {
            free[pos - 1].1 += free[pos].1;
            free.remove(pos);
        }
    }

    /// Total unreserved bytes
    pub fn free_bytes(&self) -> u64 {
        self.free.lock().iter().map(|&(_, len)| len).sum()
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("backing", &self.region.backing())
            .finish()
    }
}

/// Segment manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManagerConfig {
    /// Prefix of generated segment names
    pub name_prefix: String,
    pub backing: RegionBacking,
    /// Largest single segment
    pub max_segment_size: u64,
    /// Upper bound on all live segments together
    pub max_total_bytes: u64,
}

impl Default for SegmentManagerConfig {
    fn default() -> Self {
        Self {
            name_prefix: "vsession".to_string(),
            backing: RegionBacking::Posix,
            max_segment_size: 256 * 1024 * 1024,
            max_total_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct SegmentSet {
    by_name: HashMap<String, Arc<Segment>>,
    total_bytes: u64,
}

/// Creates and destroys named segments
pub struct SegmentManager {
    config: SegmentManagerConfig,
    instance: String,
    counter: AtomicU64,
    segments: RwLock<SegmentSet>,
}

impl SegmentManager {
    pub fn new(config: SegmentManagerConfig) -> Self {
        Self {
            config,
            instance: PlatformUtils::instance_tag(),
            counter: AtomicU64::new(0),
            segments: RwLock::new(SegmentSet::default()),
        }
    }

    pub fn config(&self) -> &SegmentManagerConfig {
        &self.config
    }

    /// Create a segment of at least `size` bytes (rounded up to pages)
    #[instrument(skip(self))]
    pub fn create(&self, size: u64) -> vnet_session_core::Result<Arc<Segment>> {
        let size = PlatformUtils::align_to_page_size(size as usize) as u64;
        if size > self.config.max_segment_size {
            return Err(SessionError::ResourceExhausted(format!(
                "segment size {} exceeds maximum {}",
                size, self.config.max_segment_size
            )));
        }

        let mut segments = self.segments.write();
        if segments.total_bytes + size > self.config.max_total_bytes {
            return Err(SessionError::ResourceExhausted(format!(
                "segment budget exhausted: {} of {} bytes in use",
                segments.total_bytes, self.config.max_total_bytes
            )));
        }

        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = PlatformUtils::segment_name(&self.config.name_prefix, &self.instance, counter);
        let region = SharedMemoryRegion::create(name.as_str(), size as usize, self.config.backing)?;
        let segment = Arc::new(Segment::new(region));

        segments.by_name.insert(name.clone(), segment.clone());
        segments.total_bytes += size;

        info!("Created segment {} ({} bytes, {:?})", name, size, self.config.backing);
        Ok(segment)
    }

    /// Destroy a segment; its event queue must be destroyed first
    #[instrument(skip(self))]
    pub fn destroy(&self, name: &str) -> vnet_session_core::Result<()> {
        let mut segments = self.segments.write();
        let segment = segments
            .by_name
            .get(name)
            .ok_or_else(|| SessionError::NotFound(format!("segment {}", name)))?;

        if segment.has_live_queue() {
            return Err(SessionError::ResourceBusy(format!(
                "segment {} still hosts an event queue",
                name
            )));
        }

        if let Some(segment) = segments.by_name.remove(name) {
            segments.total_bytes -= segment.size();
            debug!("Destroyed segment {}", name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Segment>> {
        self.segments.read().by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.segments.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.read().total_bytes
    }
}
