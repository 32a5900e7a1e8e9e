//! Segment manager
//!
//! Allocates and opens the segments containers are built from. The only state
//! it keeps is the set of names this process created and has not yet
//! unlinked, so a host can clean up after itself.

use crate::header::{HeaderFields, HeaderList, HEADER_SIZE};
use crate::{PlatformUtils, SharedMemoryRegion};
use parking_lot::Mutex;
use scratchpad_core::{Result, ScratchpadConfig, ScratchpadError};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Creates, opens and releases named segments
pub struct SegmentManager {
    config: ScratchpadConfig,
    live: Mutex<HashSet<String>>,
}

impl SegmentManager {
    pub fn new(config: ScratchpadConfig) -> Self {
        Self {
            config,
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ScratchpadConfig {
        &self.config
    }

    /// Create a segment of `size` bytes under a freshly generated name
    #[instrument(skip(self))]
    pub fn create_segment(&self, size: usize) -> Result<SharedMemoryRegion> {
        if size > self.config.max_segment_size {
            return Err(ScratchpadError::Value(format!(
                "segment of {} bytes exceeds the {} byte limit",
                size, self.config.max_segment_size
            )));
        }
        let name = PlatformUtils::generate_segment_name(&self.config.name_prefix);
        let region = SharedMemoryRegion::create(&name, size)?;
        self.live.lock().insert(region.name().to_string());
        Ok(region)
    }

    /// Open a segment some process created
    pub fn open_segment(&self, name: &str) -> Result<SharedMemoryRegion> {
        SharedMemoryRegion::open(name)
    }

    pub fn create_data_buffer(&self, size: usize) -> Result<SharedMemoryRegion> {
        self.create_segment(size)
    }

    pub fn open_data_buffer(&self, name: &str) -> Result<SharedMemoryRegion> {
        self.open_segment(name)
    }

    /// Allocate a header segment and lay out `fields` in it
    pub fn create_header_list(&self, fields: &HeaderFields) -> Result<HeaderList> {
        let region = self.create_segment(HEADER_SIZE)?;
        let name = region.name().to_string();
        match HeaderList::initialize(region, fields) {
            Ok(header) => Ok(header),
            Err(e) => {
                let _ = self.unlink(&name);
                Err(e)
            }
        }
    }

    pub fn open_header_list(&self, name: &str) -> Result<HeaderList> {
        HeaderList::attach(self.open_segment(name)?)
    }

    /// Close `region`, unlinking it first if this process created it
    ///
    /// Returns whether the name was unlinked.
    pub fn release(&self, region: SharedMemoryRegion) -> Result<bool> {
        let name = region.name().to_string();
        let owned = region.is_creator();
        drop(region);
        if owned {
            self.unlink(&name)?;
        }
        Ok(owned)
    }

    /// Close `region` and unlink its name regardless of who created it
    ///
    /// Used for data segments abandoned by a relocation, which may have been
    /// allocated by another process.
    pub fn retire(&self, region: SharedMemoryRegion) -> Result<()> {
        let name = region.name().to_string();
        drop(region);
        self.unlink(&name)
    }

    /// Remove `name` from the OS namespace
    pub fn unlink(&self, name: &str) -> Result<()> {
        let public = PlatformUtils::public_name(name);
        let result = SharedMemoryRegion::unlink(public);
        self.live.lock().remove(public);
        result
    }

    /// Names created by this process that are still linked
    pub fn live_segments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Unlink every segment this process created and has not released
    ///
    /// Best effort: failures are logged and the remaining names still unlinked.
    /// Returns the number of names removed.
    pub fn release_all(&self) -> usize {
        let names: Vec<String> = self.live.lock().drain().collect();
        let mut removed = 0;
        for name in names {
            match SharedMemoryRegion::unlink(&name) {
                Ok(()) => removed += 1,
                Err(ScratchpadError::SegmentNotFound(_)) => {
                    debug!("Segment {} was already unlinked", name)
                }
                Err(e) => warn!("Failed to unlink {}: {}", name, e),
            }
        }
        removed
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("name_prefix", &self.config.name_prefix)
            .field("live", &self.live.lock().len())
            .finish()
    }
}
