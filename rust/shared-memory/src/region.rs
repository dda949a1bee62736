//! Shared memory region management

use crate::{Result, ShmError};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;

/// Largest region the layer maps in one piece (1GB)
pub const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// How a region's memory is provided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegionBacking {
    /// Private mapping; only reachable from this process
    Anonymous,
    /// Named POSIX shared memory other processes can map by name
    #[default]
    Posix,
}

/// Shared memory region handle
pub struct SharedMemoryRegion {
    /// Region name/identifier
    pub name: String,
    /// Region size in bytes
    pub size: usize,
    /// Memory pointer
    ptr: NonNull<u8>,
    /// Keeps the mapping alive; unmapped on drop
    _map: MmapMut,
    backing: RegionBacking,
    /// Whether this process created the region
    is_creator: bool,
}

impl SharedMemoryRegion {
    /// Create a new shared memory region
    pub fn create(name: impl Into<String>, size: usize, backing: RegionBacking) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;
        validate_region_size(size)?;

        let mut map = match backing {
            RegionBacking::Anonymous => MmapMut::map_anon(size)
                .map_err(|e| ShmError::MappingFailed(format!("anonymous map of {} bytes: {}", size, e)))?,
            RegionBacking::Posix => create_posix_region(&name, size)?,
        };

        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::MappingFailed("mmap returned null".to_string()))?;

        Ok(Self {
            name,
            size,
            ptr,
            _map: map,
            backing,
            is_creator: true,
        })
    }

    /// Open an existing named region created by another process
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;

        let mut map = open_posix_region(&name)?;
        let size = map.len();
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::MappingFailed("mmap returned null".to_string()))?;

        Ok(Self {
            name,
            size,
            ptr,
            _map: map,
            backing: RegionBacking::Posix,
            is_creator: false,
        })
    }

    pub fn backing(&self) -> RegionBacking {
        self.backing
    }

    /// Get raw pointer to the memory.
    ///
    /// All shared state inside a region is accessed through atomics or
    /// through byte ranges reserved for a single writer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Pointer to `offset`, checked to leave room for `len` bytes
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(unsafe { self.as_ptr().add(offset) }),
            _ => Err(ShmError::Protocol(format!(
                "range {}+{} outside region {} of {} bytes",
                offset, len, self.name, self.size
            ))),
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if self.backing == RegionBacking::Posix && self.is_creator {
            unlink_posix_region(&self.name);
        }
    }
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("backing", &self.backing)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

// Safety: the region is a plain mapping; the pointer stays valid for the
// lifetime of the struct
unsafe impl Send for SharedMemoryRegion {}
// Safety: concurrent access goes through atomics or disjoint reservations
unsafe impl Sync for SharedMemoryRegion {}

/// POSIX object name for a region name
fn posix_object_name(name: &str) -> String {
    format!("/{}", name)
}

#[cfg(unix)]
fn create_posix_region(name: &str, size: usize) -> Result<MmapMut> {
    use nix::fcntl::OFlag;
    use nix::sys::mman::shm_open;
    use nix::sys::stat::Mode;

    let object = posix_object_name(name);
    let fd = shm_open(
        object.as_str(),
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|e| ShmError::from_platform_error(e as i32, format!("shm_open {} failed", object)))?;

    let file = std::fs::File::from(fd);
    let mapped = file
        .set_len(size as u64)
        .map_err(ShmError::from)
        .and_then(|_| unsafe { MmapMut::map_mut(&file) }.map_err(|e| ShmError::MappingFailed(e.to_string())));

    if mapped.is_err() {
        unlink_posix_region(name);
    }
    mapped
}

#[cfg(unix)]
fn open_posix_region(name: &str) -> Result<MmapMut> {
    use nix::fcntl::OFlag;
    use nix::sys::mman::shm_open;
    use nix::sys::stat::Mode;

    let object = posix_object_name(name);
    let fd = shm_open(object.as_str(), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| ShmError::from_platform_error(e as i32, format!("shm_open {} failed", object)))?;

    let file = std::fs::File::from(fd);
    if file.metadata()?.len() == 0 {
        return Err(ShmError::Protocol(format!("region {} is empty", name)));
    }

    unsafe { MmapMut::map_mut(&file) }.map_err(|e| ShmError::MappingFailed(e.to_string()))
}

#[cfg(unix)]
fn unlink_posix_region(name: &str) {
    let object = posix_object_name(name);
    if let Err(e) = nix::sys::mman::shm_unlink(object.as_str()) {
        tracing::warn!("shm_unlink {} failed: {}", object, e);
    }
}

#[cfg(not(unix))]
fn create_posix_region(_name: &str, _size: usize) -> Result<MmapMut> {
    Err(ShmError::Platform("named shared memory is not supported on this platform".to_string()))
}

#[cfg(not(unix))]
fn open_posix_region(name: &str) -> Result<MmapMut> {
    Err(ShmError::RegionNotFound(name.to_string()))
}

#[cfg(not(unix))]
fn unlink_posix_region(_name: &str) {}

/// Validate region name
fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(ShmError::Platform("Invalid region name length".to_string()));
    }

    if name.contains('\0') || name.contains('/') {
        return Err(ShmError::Platform(format!("Invalid character in region name {:?}", name)));
    }

    Ok(())
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_REGION_SIZE {
        return Err(ShmError::InvalidSize {
            size,
            min: 1,
            max: MAX_REGION_SIZE,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region_creation() {
        let region = SharedMemoryRegion::create("test-anon-region", 8192, RegionBacking::Anonymous).unwrap();
        assert_eq!(region.name, "test-anon-region");
        assert_eq!(region.size, 8192);
        assert_eq!(region.backing(), RegionBacking::Anonymous);

        let p = region.ptr_at(8000, 192).unwrap();
        unsafe {
            p.write(0x5a);
            assert_eq!(*region.as_ptr().add(8000), 0x5a);
        }
        assert!(region.ptr_at(8000, 193).is_err());
        assert!(region.ptr_at(usize::MAX, 1).is_err());
    }

    #[test]
    fn test_region_validation() {
        assert!(SharedMemoryRegion::create("", 4096, RegionBacking::Anonymous).is_err());
        assert!(SharedMemoryRegion::create("test\0name", 4096, RegionBacking::Anonymous).is_err());
        assert!(SharedMemoryRegion::create("a/b", 4096, RegionBacking::Anonymous).is_err());

        assert!(SharedMemoryRegion::create("test", 0, RegionBacking::Anonymous).is_err());
        assert!(SharedMemoryRegion::create("test", MAX_REGION_SIZE + 1, RegionBacking::Anonymous).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_posix_region_is_shared_by_name() {
        let name = format!("vsession-region-test-{}", std::process::id());
        let creator = SharedMemoryRegion::create(name.as_str(), 4096, RegionBacking::Posix).unwrap();
        unsafe { creator.as_ptr().add(100).write(42) };

        let opened = SharedMemoryRegion::open(name.as_str()).unwrap();
        assert_eq!(opened.size, 4096);
        assert_eq!(unsafe { *opened.as_ptr().add(100) }, 42);

        // A second create with the same name collides
        assert!(SharedMemoryRegion::create(name.as_str(), 4096, RegionBacking::Posix).is_err());

        drop(opened);
        drop(creator);
        assert!(SharedMemoryRegion::open(name.as_str()).is_err());
    }
}
