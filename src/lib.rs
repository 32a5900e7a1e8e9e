//! Scratchpad
//!
//! Typed containers that several processes on one host can read and write
//! concurrently through named shared memory: a growable vector, an
//! N-dimensional array and a string-keyed dictionary.
//!
//! ```no_run
//! use scratchpad::prelude::*;
//!
//! # fn main() -> scratchpad::Result<()> {
//! let pad = Scratchpad::new();
//! let numbers = pad.create_vector(ElementType::Int32)?;
//! numbers.push_back(7)?;
//!
//! // in another process
//! let seen = pad.attach_vector(numbers.name())?;
//! assert_eq!(seen.get(-1)?, Scalar::Int(7));
//! # Ok(())
//! # }
//! ```

pub use ndarray;
pub use scratchpad_core::*;
pub use serde_json::{Map, Value};
pub use scratchpad_shared_memory::{
    ContainerKind, ContainerLock, CreateOptions, SegmentManager, SharedArray, SharedDict,
    SharedLockHandle, SharedVec,
};

use std::sync::Arc;
use tracing::{debug, info};

/// Creates and attaches containers
///
/// Cloning is cheap; clones share one segment manager.
#[derive(Debug, Clone)]
pub struct Scratchpad {
    manager: Arc<SegmentManager>,
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::new()
    }
}

impl Scratchpad {
    /// Use the default configuration
    pub fn new() -> Self {
        Self {
            manager: Arc::new(SegmentManager::new(ScratchpadConfig::default())),
        }
    }

    pub fn with_config(config: ScratchpadConfig) -> Result<Self> {
        config.validate()?;
        debug!("Scratchpad configured with prefix {:?}", config.name_prefix);
        Ok(Self {
            manager: Arc::new(SegmentManager::new(config)),
        })
    }

    pub fn config(&self) -> &ScratchpadConfig {
        self.manager.config()
    }

    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    pub fn create_vector(&self, element: ElementType) -> Result<SharedVec> {
        self.create_vector_with(element, &CreateOptions::default())
    }

    pub fn create_vector_with(&self, element: ElementType, options: &CreateOptions) -> Result<SharedVec> {
        SharedVec::create(Arc::clone(&self.manager), element, options)
    }

    pub fn attach_vector(&self, name: &str) -> Result<SharedVec> {
        SharedVec::attach(Arc::clone(&self.manager), name)
    }

    pub fn create_array(&self, shape: &[usize], dtype: ElementType) -> Result<SharedArray> {
        self.create_array_with(shape, dtype, &CreateOptions::default())
    }

    pub fn create_array_with(
        &self,
        shape: &[usize],
        dtype: ElementType,
        options: &CreateOptions,
    ) -> Result<SharedArray> {
        SharedArray::create(Arc::clone(&self.manager), shape, dtype, options)
    }

    pub fn attach_array(&self, name: &str) -> Result<SharedArray> {
        SharedArray::attach(Arc::clone(&self.manager), name)
    }

    pub fn create_dict(&self) -> Result<SharedDict> {
        self.create_dict_with(&CreateOptions::default())
    }

    pub fn create_dict_with(&self, options: &CreateOptions) -> Result<SharedDict> {
        SharedDict::create(Arc::clone(&self.manager), options)
    }

    pub fn attach_dict(&self, name: &str) -> Result<SharedDict> {
        SharedDict::attach(Arc::clone(&self.manager), name)
    }

    /// Allocate a standalone lock several containers can share
    pub fn create_lock(&self) -> Result<SharedLockHandle> {
        let lock = SharedLockHandle::create(&self.manager)?;
        info!("Created shared lock {}", lock.name());
        Ok(lock)
    }

    pub fn open_lock(&self, name: &str) -> Result<SharedLockHandle> {
        SharedLockHandle::open(&self.manager, name)
    }

    /// Unlink a lock segment created by [`Scratchpad::create_lock`]
    pub fn destroy_lock(&self, lock: SharedLockHandle) -> Result<()> {
        lock.destroy(&self.manager)
    }

    /// Segments this process created and has not unlinked
    pub fn live_segments(&self) -> Vec<String> {
        self.manager.live_segments()
    }

    /// Unlink every segment this process still owns
    pub fn release_all(&self) -> usize {
        let removed = self.manager.release_all();
        info!("Released {} segments", removed);
        removed
    }
}

/// Re-export common types
pub mod prelude {
    pub use crate::Scratchpad;
    pub use scratchpad_core::prelude::*;
    pub use scratchpad_shared_memory::{
        ContainerLock, CreateOptions, SharedArray, SharedDict, SharedLockHandle, SharedVec,
    };
}
