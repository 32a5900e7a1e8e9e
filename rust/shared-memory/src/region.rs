//! Shared memory region management

use crate::PlatformUtils;
use memmap2::{MmapOptions, MmapRaw};
use scratchpad_core::{Result, ScratchpadError};
use std::fs::File;
use tracing::debug;

/// Shared memory region handle
///
/// Dropping a region only unmaps it. Removing the name from the OS namespace
/// is always explicit, see [`SharedMemoryRegion::unlink`].
pub struct SharedMemoryRegion {
    /// Region name, without the leading slash
    name: String,
    /// Mapped size in bytes
    size: usize,
    /// Memory mapping
    map: MmapRaw,
    /// Whether this process created the region
    is_creator: bool,
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

impl SharedMemoryRegion {
    /// Create a new shared memory region, failing if the name is taken
    pub fn create(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = PlatformUtils::public_name(&name.into()).to_string();
        PlatformUtils::validate_segment_name(&name)?;
        validate_region_size(size)?;

        let file = unix_impl::create_platform_region(&name, size)?;
        let map = match map_region(&file, size) {
            Ok(map) => map,
            Err(e) => {
                let _ = unix_impl::unlink_platform_region(&name);
                return Err(e);
            }
        };

        debug!("Created shared memory region {} ({} bytes)", name, size);
        Ok(Self {
            name,
            size,
            map,
            is_creator: true,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let name = PlatformUtils::public_name(&name.into()).to_string();
        PlatformUtils::validate_segment_name(&name)?;

        let (file, size) = unix_impl::open_platform_region(&name)?;
        let map = map_region(&file, size)?;

        debug!("Opened shared memory region {} ({} bytes)", name, size);
        Ok(Self {
            name,
            size,
            map,
            is_creator: false,
        })
    }

    /// Remove `name` from the OS namespace
    ///
    /// Existing mappings stay valid until their holders close them.
    pub fn unlink(name: &str) -> Result<()> {
        let name = PlatformUtils::public_name(name);
        unix_impl::unlink_platform_region(name)?;
        debug!("Unlinked shared memory region {}", name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether this handle came from [`SharedMemoryRegion::create`]
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Get raw pointer to the memory
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// Get raw mutable pointer to the memory
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Get a slice view of the memory
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the memory
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.size) }
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`
    ///
    /// Must not overlap a slice currently borrowed through [`Self::as_slice`].
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ScratchpadError::Index {
                index: offset as isize,
                len: self.size,
            }),
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        debug!("Closed shared memory region {}", self.name);
    }
}

// Safety: the mapping is plain memory; cross-process access is serialized by
// the container lock and in-process access by the owning container
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

fn map_region(file: &File, size: usize) -> Result<MmapRaw> {
    MmapOptions::new()
        .len(size)
        .map_raw(file)
        .map_err(|e| ScratchpadError::Platform(format!("mmap failed: {}", e)))
}

mod unix_impl {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::sys::mman::{shm_open, shm_unlink};
    use nix::sys::stat::Mode;

    pub fn create_platform_region(name: &str, size: usize) -> Result<File> {
        let os_name = PlatformUtils::os_name(name);
        let fd = shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ScratchpadError::from_platform_error(e as i32, format!("shm_open {}", name)))?;

        let file = File::from(fd);
        if let Err(e) = file.set_len(size as u64) {
            let _ = shm_unlink(os_name.as_str());
            return Err(ScratchpadError::Platform(format!("ftruncate {} failed: {}", name, e)));
        }
        Ok(file)
    }

    pub fn open_platform_region(name: &str) -> Result<(File, usize)> {
        let os_name = PlatformUtils::os_name(name);
        let fd = shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ScratchpadError::from_platform_error(e as i32, format!("shm_open {}", name)))?;

        let file = File::from(fd);
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(ScratchpadError::StaleReference(format!(
                "shared memory region {} has no backing storage",
                name
            )));
        }
        Ok((file, size))
    }

    pub fn unlink_platform_region(name: &str) -> Result<()> {
        shm_unlink(PlatformUtils::os_name(name).as_str())
            .map_err(|e| ScratchpadError::from_platform_error(e as i32, format!("shm_unlink {}", name)))
    }
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    const MAX_SIZE: usize = isize::MAX as usize;

    if size == 0 || size > MAX_SIZE {
        return Err(ScratchpadError::Value(format!(
            "invalid region size {}, must be between 1 and {}",
            size, MAX_SIZE
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        PlatformUtils::generate_segment_name(tag)
    }

    #[test]
    fn test_region_creation() {
        let name = unique("rgn");
        let region = SharedMemoryRegion::create(&name, 4096).unwrap();
        assert_eq!(region.name(), name);
        assert_eq!(region.len(), 4096);
        assert!(region.is_creator());
        assert!(region.as_slice().iter().all(|&b| b == 0));
        SharedMemoryRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_region_validation() {
        assert!(SharedMemoryRegion::create("", 4096).is_err());
        assert!(SharedMemoryRegion::create("test\0name", 4096).is_err());
        assert!(SharedMemoryRegion::create(unique("rgn"), 0).is_err());
    }

    #[test]
    fn test_open_shares_memory() {
        let name = unique("rgn");
        let writer = SharedMemoryRegion::create(&name, 64).unwrap();
        let reader = SharedMemoryRegion::open(&name).unwrap();
        assert!(!reader.is_creator());
        assert_eq!(reader.len(), 64);

        writer.write_at(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert!(reader.read_at(60, &mut buf).is_err());
        SharedMemoryRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_duplicate_name_unavailable() {
        let name = unique("rgn");
        let _first = SharedMemoryRegion::create(&name, 64).unwrap();
        let second = SharedMemoryRegion::create(&name, 64);
        assert!(matches!(second, Err(ScratchpadError::NameUnavailable(_))));
        SharedMemoryRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_unlink_keeps_mapping() {
        let name = unique("rgn");
        let region = SharedMemoryRegion::create(&name, 64).unwrap();
        region.write_at(0, &[7]).unwrap();
        SharedMemoryRegion::unlink(&name).unwrap();

        assert_eq!(region.as_slice()[0], 7);
        assert!(matches!(
            SharedMemoryRegion::open(&name),
            Err(ScratchpadError::SegmentNotFound(_))
        ));
    }
}
