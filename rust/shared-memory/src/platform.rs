//! Platform-specific helpers for shared memory

use std::sync::OnceLock;

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Memory page size
    pub fn page_size() -> usize {
        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

        *PAGE_SIZE.get_or_init(|| {
            #[cfg(unix)]
            {
                let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if size > 0 {
                    return size as usize;
                }
            }
            4096
        })
    }

    /// Align size to page boundary
    pub fn align_to_page_size(size: usize) -> usize {
        let page_size = Self::page_size();
        size.max(1).div_ceil(page_size) * page_size
    }

    /// Short tag that tells apart segment managers living in one process
    pub fn instance_tag() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..8].to_string()
    }

    /// Generate a segment name from its parts
    pub fn segment_name(prefix: &str, instance: &str, counter: u64) -> String {
        format!("{}-{}-{}-{}", prefix, Self::get_process_id(), instance, counter)
    }
}
