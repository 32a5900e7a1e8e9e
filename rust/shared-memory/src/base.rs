//! Shared base of every container
//!
//! A container is a fixed header segment plus a data segment that may be
//! replaced by a larger one at any time by any attached process. Every access
//! goes through a [`Session`], which takes the cross-process lock and then
//! checks whether the header still names the data segment this view has
//! mapped, reopening it when it does not.
//!
//! Lock order is always the cross-process lock first, then the local state
//! mutex. [`SharedBase::lock`] takes only the cross-process lock, which is
//! reentrant, so public operations can run while it is held.

use crate::header::{ContainerKind, HeaderFields, HeaderList};
use crate::lock::{ProcessMutex, ProcessMutexGuard, SharedLockHandle};
use crate::{SegmentManager, SharedMemoryRegion};
use parking_lot::{Mutex, MutexGuard};
use scratchpad_core::{Result, ScratchpadError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional parameters for creating a container
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Starting capacity: elements for vectors and arrays, bytes for dictionaries
    pub initial_capacity: Option<usize>,
    /// Vector growth ratio; defaults to the configured ratio
    pub growth_ratio: Option<f64>,
    /// Standalone lock segment to use instead of the embedded lock
    pub lock_name: Option<String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    pub fn with_growth_ratio(mut self, ratio: f64) -> Self {
        self.growth_ratio = Some(ratio);
        self
    }

    /// Share `lock` with every other container created with it
    pub fn with_lock(mut self, lock: &SharedLockHandle) -> Self {
        self.lock_name = Some(lock.name().to_string());
        self
    }
}

/// The local view of the current data segment
pub(crate) struct DataState {
    region: SharedMemoryRegion,
    name: String,
    epoch: u64,
}

/// Header, data segment and ownership shared by all container kinds
pub struct SharedBase {
    manager: Arc<SegmentManager>,
    header: HeaderList,
    external_lock: Option<SharedLockHandle>,
    state: Mutex<DataState>,
    owner: AtomicBool,
    unlink_on_drop: bool,
}

impl SharedBase {
    /// Allocate a header and a data segment of `capacity` bytes
    ///
    /// `init` fills the container-specific header slots before the name is
    /// handed out.
    pub(crate) fn create<F>(
        manager: Arc<SegmentManager>,
        kind: ContainerKind,
        logical_size: usize,
        capacity: usize,
        lock_name: Option<&str>,
        init: F,
    ) -> Result<Self>
    where
        F: FnOnce(&HeaderList) -> Result<()>,
    {
        if logical_size > capacity {
            return Err(ScratchpadError::Value(format!(
                "logical size {} exceeds capacity {}",
                logical_size, capacity
            )));
        }
        let external_lock = match lock_name {
            Some(name) => Some(SharedLockHandle::open(&manager, name)?),
            None => None,
        };

        let region = manager.create_data_buffer(capacity)?;
        let data_name = region.name().to_string();
        let fields = HeaderFields {
            kind,
            data_name: data_name.clone(),
            logical_size,
            capacity,
            lock_name: lock_name.map(str::to_string),
        };
        let header = match manager.create_header_list(&fields) {
            Ok(header) => header,
            Err(e) => {
                let _ = manager.retire(region);
                return Err(e);
            }
        };
        if let Err(e) = init(&header) {
            let header_name = header.name().to_string();
            drop(header);
            let _ = manager.unlink(&header_name);
            let _ = manager.retire(region);
            return Err(e);
        }

        info!(
            "Created {} {} ({} bytes in {})",
            kind,
            header.name(),
            capacity,
            data_name
        );
        let unlink_on_drop = manager.config().unlink_on_drop;
        Ok(Self {
            manager,
            header,
            external_lock,
            state: Mutex::new(DataState {
                region,
                name: data_name,
                epoch: 0,
            }),
            owner: AtomicBool::new(true),
            unlink_on_drop,
        })
    }

    /// Attach to the container published under `name`
    pub(crate) fn attach(manager: Arc<SegmentManager>, name: &str, expected: ContainerKind) -> Result<Self> {
        let header = manager.open_header_list(name)?;
        let kind = header.kind()?;
        if kind != expected {
            return Err(ScratchpadError::Type(format!(
                "{} is a {}, not a {}",
                name, kind, expected
            )));
        }
        let external_lock = match header.lock_name()? {
            Some(lock_name) => Some(SharedLockHandle::open(&manager, &lock_name)?),
            None => None,
        };

        let state = {
            let mutex = match &external_lock {
                Some(lock) => lock.mutex(),
                None => header.mutex(),
            };
            let _guard = mutex.lock()?;
            if header.is_destroyed()? {
                return Err(ScratchpadError::StaleReference(format!("{} was destroyed", name)));
            }
            let data_name = header.data_name()?;
            let epoch = header.epoch()?;
            let region = manager.open_data_buffer(&data_name).map_err(stale)?;
            DataState {
                region,
                name: data_name,
                epoch,
            }
        };

        info!("Attached to {} {} (data in {})", kind, header.name(), state.name);
        let unlink_on_drop = manager.config().unlink_on_drop;
        Ok(Self {
            manager,
            header,
            external_lock,
            state: Mutex::new(state),
            owner: AtomicBool::new(false),
            unlink_on_drop,
        })
    }

    /// Public name of the container
    pub fn name(&self) -> &str {
        self.header.name()
    }

    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    /// Name of the data segment currently published in the header
    pub fn data_name(&self) -> Result<String> {
        Ok(self.session()?.state.name.clone())
    }

    /// Name of the standalone lock, if the container does not use its own
    pub fn lock_name(&self) -> Option<&str> {
        self.external_lock.as_ref().map(SharedLockHandle::name)
    }

    pub fn is_owner(&self) -> bool {
        self.owner.load(Ordering::Acquire)
    }

    /// Take the lock and bring the local view up to date
    pub fn session(&self) -> Result<Session<'_>> {
        let lock = self.mutex().lock()?;
        let mut state = self.state.lock();
        let relocated = self.refresh(&mut state)?;
        Ok(Session {
            base: self,
            state,
            relocated,
            _lock: lock,
        })
    }

    /// Run the relocation check on its own
    ///
    /// Returns whether the data segment or the layout changed since this view
    /// last looked.
    pub fn sync(&self) -> Result<bool> {
        Ok(self.session()?.relocated())
    }

    /// Hold the container lock across several operations
    pub fn lock(&self) -> Result<ContainerLock<'_>> {
        Ok(ContainerLock {
            _guard: self.mutex().lock()?,
        })
    }

    /// Give up ownership so the segments outlive this handle
    pub fn persist(&self) -> String {
        if self.owner.swap(false, Ordering::AcqRel) {
            info!("Persisted {}", self.name());
        }
        self.name().to_string()
    }

    /// Close local handles without unlinking anything
    pub fn detach(self) {
        self.owner.store(false, Ordering::Release);
    }

    /// Mark the container destroyed and unlink its segments
    ///
    /// Attached views fail with a stale reference on their next access.
    pub fn destroy(self) -> Result<()> {
        self.owner.store(false, Ordering::Release);
        self.destroy_segments()
    }

    fn destroy_segments(&self) -> Result<()> {
        let _guard = self.mutex().lock()?;
        let _state = self.state.lock();
        if self.header.is_destroyed()? {
            return Ok(());
        }
        self.header.mark_destroyed()?;
        let data_name = self.header.data_name()?;
        ignore_missing(self.manager.unlink(&data_name))?;
        ignore_missing(self.manager.unlink(self.header.name()))?;
        info!("Destroyed {}", self.header.name());
        Ok(())
    }

    fn mutex(&self) -> &ProcessMutex {
        match &self.external_lock {
            Some(lock) => lock.mutex(),
            None => self.header.mutex(),
        }
    }

    fn refresh(&self, state: &mut DataState) -> Result<bool> {
        if self.header.is_destroyed()? {
            return Err(ScratchpadError::StaleReference(format!(
                "{} was destroyed",
                self.name()
            )));
        }
        let current = self.header.data_name()?;
        let epoch = self.header.epoch()?;
        let mut updated = epoch != state.epoch;
        if current != state.name {
            let region = self.manager.open_data_buffer(&current).map_err(stale)?;
            debug!("{} relocated from {} to {}", self.name(), state.name, current);
            state.region = region;
            state.name = current;
            updated = true;
        }
        state.epoch = epoch;
        Ok(updated)
    }
}

impl Drop for SharedBase {
    fn drop(&mut self) {
        if self.unlink_on_drop && self.owner.load(Ordering::Acquire) {
            if let Err(e) = self.destroy_segments() {
                warn!("Failed to destroy {}: {}", self.name(), e);
            }
        } else {
            debug!("Closed {}", self.name());
        }
    }
}

impl std::fmt::Debug for SharedBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBase")
            .field("name", &self.name())
            .field("lock", &self.lock_name())
            .field("owner", &self.is_owner())
            .finish()
    }
}

/// Forward the handle-level operations of a container to its `base` field
macro_rules! delegate_to_base {
    ($container:ty) => {
        impl $container {
            /// Public name other processes attach by
            pub fn name(&self) -> &str {
                self.base.name()
            }

            /// Name of the data segment currently in use
            pub fn data_name(&self) -> ::scratchpad_core::Result<String> {
                self.base.data_name()
            }

            /// Name of the standalone lock, if any
            pub fn lock_name(&self) -> Option<&str> {
                self.base.lock_name()
            }

            /// Run the relocation check; true when the layout changed
            pub fn sync(&self) -> ::scratchpad_core::Result<bool> {
                self.base.sync()
            }

            /// Hold the cross-process lock across several operations
            pub fn lock(&self) -> ::scratchpad_core::Result<$crate::base::ContainerLock<'_>> {
                self.base.lock()
            }

            pub fn is_owner(&self) -> bool {
                self.base.is_owner()
            }

            /// Keep the segments alive after this handle is dropped
            pub fn persist(&self) -> String {
                self.base.persist()
            }

            pub fn detach(self) {
                self.base.detach()
            }

            pub fn destroy(self) -> ::scratchpad_core::Result<()> {
                self.base.destroy()
            }

            pub fn base(&self) -> &$crate::base::SharedBase {
                &self.base
            }
        }
    };
}

pub(crate) use delegate_to_base;

fn stale(e: ScratchpadError) -> ScratchpadError {
    match e {
        ScratchpadError::SegmentNotFound(msg) => ScratchpadError::StaleReference(msg),
        other => other,
    }
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(ScratchpadError::SegmentNotFound(_)) => Ok(()),
        other => other,
    }
}

/// Guard for [`SharedBase::lock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ContainerLock<'a> {
    _guard: ProcessMutexGuard<'a>,
}

/// Exclusive, up-to-date access to a container for one operation
///
/// Slices obtained from a session must not outlive it.
pub struct Session<'a> {
    base: &'a SharedBase,
    state: MutexGuard<'a, DataState>,
    relocated: bool,
    _lock: ProcessMutexGuard<'a>,
}

impl<'a> Session<'a> {
    /// Whether the relocation check observed a change
    pub fn relocated(&self) -> bool {
        self.relocated
    }

    pub fn header(&self) -> &HeaderList {
        &self.base.header
    }

    pub fn logical_size(&self) -> Result<usize> {
        self.base.header.logical_size()
    }

    pub fn capacity(&self) -> Result<usize> {
        self.base.header.capacity()
    }

    pub fn set_logical_size(&mut self, size: usize) -> Result<()> {
        let capacity = self.capacity()?;
        if size > capacity {
            return Err(ScratchpadError::Value(format!(
                "logical size {} exceeds capacity {}",
                size, capacity
            )));
        }
        self.base.header.set_logical_size(size)
    }

    /// The data segment, `capacity` bytes long
    pub fn data(&self) -> Result<&[u8]> {
        let capacity = self.capacity()?;
        let bytes = self.state.region.as_slice();
        Ok(&bytes[..capacity.min(bytes.len())])
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let capacity = self.capacity()?;
        let bytes = self.state.region.as_slice_mut();
        let end = capacity.min(bytes.len());
        Ok(&mut bytes[..end])
    }

    /// Publish a layout change that kept the data segment
    pub fn bump_epoch(&mut self) -> Result<()> {
        self.state.epoch = self.base.header.bump_epoch()?;
        Ok(())
    }

    /// Move the data to a segment of `new_capacity` bytes
    ///
    /// A no-op returning `false` unless `new_capacity` exceeds the current
    /// capacity.
    pub fn recap(&mut self, new_capacity: usize) -> Result<bool> {
        let capacity = self.capacity()?;
        if new_capacity <= capacity {
            return Ok(false);
        }
        let manager = &self.base.manager;
        let header = &self.base.header;

        let mut fresh = manager.create_data_buffer(new_capacity)?;
        let keep = capacity.min(self.state.region.len());
        fresh.as_slice_mut()[..keep].copy_from_slice(&self.state.region.as_slice()[..keep]);

        let fresh_name = fresh.name().to_string();
        if let Err(e) = header.set_data_name(&fresh_name) {
            let _ = manager.retire(fresh);
            return Err(e);
        }
        header.set_capacity(new_capacity)?;
        let epoch = header.bump_epoch()?;

        let old = std::mem::replace(&mut self.state.region, fresh);
        let old_name = std::mem::replace(&mut self.state.name, fresh_name);
        self.state.epoch = epoch;
        if let Err(e) = manager.retire(old) {
            warn!("Failed to unlink abandoned segment {}: {}", old_name, e);
        }

        info!(
            "Grew {} from {} to {} bytes ({} -> {})",
            self.base.name(),
            capacity,
            new_capacity,
            old_name,
            self.state.name
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::slot;
    use scratchpad_core::ScratchpadConfig;

    fn manager() -> Arc<SegmentManager> {
        Arc::new(SegmentManager::new(ScratchpadConfig::default()))
    }

    fn create(manager: &Arc<SegmentManager>) -> SharedBase {
        SharedBase::create(Arc::clone(manager), ContainerKind::Vector, 0, 16, None, |header| {
            header.write_f64(slot::EXTENSION, 2.0)
        })
        .unwrap()
    }

    #[test]
    fn test_create_and_attach() {
        let manager = manager();
        let base = create(&manager);
        assert!(base.is_owner());

        let attached = SharedBase::attach(Arc::clone(&manager), base.name(), ContainerKind::Vector).unwrap();
        assert!(!attached.is_owner());
        assert_eq!(attached.data_name().unwrap(), base.data_name().unwrap());
        assert!(!attached.sync().unwrap());
    }

    #[test]
    fn test_attach_wrong_kind() {
        let manager = manager();
        let base = create(&manager);
        assert!(matches!(
            SharedBase::attach(Arc::clone(&manager), base.name(), ContainerKind::Dict),
            Err(ScratchpadError::Type(_))
        ));
    }

    #[test]
    fn test_recap_relocates_other_views() {
        let manager = manager();
        let base = create(&manager);
        let attached = SharedBase::attach(Arc::clone(&manager), base.name(), ContainerKind::Vector).unwrap();
        {
            let mut session = base.session().unwrap();
            session.data_mut().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
            session.set_logical_size(4).unwrap();
            assert!(!session.recap(16).unwrap());
            assert!(session.recap(64).unwrap());
            assert_eq!(session.capacity().unwrap(), 64);
        }

        let session = attached.session().unwrap();
        assert!(session.relocated());
        assert_eq!(session.data().unwrap().len(), 64);
        assert_eq!(&session.data().unwrap()[..4], &[1, 2, 3, 4]);
        drop(session);
        assert!(!attached.sync().unwrap());
    }

    #[test]
    fn test_old_segment_unlinked_after_recap() {
        let manager = manager();
        let base = create(&manager);
        let old = base.data_name().unwrap();
        base.session().unwrap().recap(32).unwrap();
        assert!(matches!(
            manager.open_data_buffer(&old),
            Err(ScratchpadError::SegmentNotFound(_))
        ));
        assert!(!manager.live_segments().contains(&old));
    }

    #[test]
    fn test_logical_size_bounded_by_capacity() {
        let manager = manager();
        let base = create(&manager);
        let mut session = base.session().unwrap();
        assert!(matches!(session.set_logical_size(17), Err(ScratchpadError::Value(_))));
    }

    #[test]
    fn test_destroy_makes_views_stale() {
        let manager = manager();
        let base = create(&manager);
        let attached = SharedBase::attach(Arc::clone(&manager), base.name(), ContainerKind::Vector).unwrap();
        let name = base.name().to_string();
        base.destroy().unwrap();

        assert!(matches!(attached.sync(), Err(ScratchpadError::StaleReference(_))));
        assert!(SharedBase::attach(Arc::clone(&manager), &name, ContainerKind::Vector).is_err());
        drop(attached);
        assert!(manager.live_segments().is_empty());
    }

    #[test]
    fn test_persist_keeps_segments() {
        let manager = manager();
        let base = create(&manager);
        let name = base.persist();
        assert!(!base.is_owner());
        drop(base);

        let attached = SharedBase::attach(Arc::clone(&manager), &name, ContainerKind::Vector).unwrap();
        attached.destroy().unwrap();
        assert!(manager.live_segments().is_empty());
    }

    #[test]
    fn test_lock_allows_nested_sessions() {
        let manager = manager();
        let base = create(&manager);
        let _held = base.lock().unwrap();
        let mut session = base.session().unwrap();
        session.set_logical_size(8).unwrap();
        drop(session);
        assert_eq!(base.session().unwrap().logical_size().unwrap(), 8);
    }

    #[test]
    fn test_external_lock_recorded() {
        let manager = manager();
        let lock = SharedLockHandle::create(&manager).unwrap();
        let base = SharedBase::create(Arc::clone(&manager), ContainerKind::Dict, 0, 32, Some(lock.name()), |_| {
            Ok(())
        })
        .unwrap();
        assert_eq!(base.lock_name(), Some(lock.name()));

        let attached = SharedBase::attach(Arc::clone(&manager), base.name(), ContainerKind::Dict).unwrap();
        assert_eq!(attached.lock_name(), Some(lock.name()));

        drop(attached);
        drop(base);
        lock.destroy(&manager).unwrap();
        assert!(manager.live_segments().is_empty());
    }
}
