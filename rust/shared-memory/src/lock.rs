//! Process-shared reentrant lock
//!
//! A `pthread_mutex_t` configured as `PTHREAD_PROCESS_SHARED` and
//! `PTHREAD_MUTEX_RECURSIVE` placed at the start of a shared segment. On Linux
//! the mutex is also robust, so a holder dying does not wedge its peers.

use crate::{SegmentManager, SharedMemoryRegion};
use scratchpad_core::{Result, ScratchpadError};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Bytes reserved for the mutex at the start of a segment
pub const LOCK_AREA_SIZE: usize = 64;

const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= LOCK_AREA_SIZE);

/// Magic number marking an initialized standalone lock segment
pub const LOCK_MAGIC: u32 = 0x5343_4c4b; // "SCLK"

const LOCK_SEGMENT_SIZE: usize = LOCK_AREA_SIZE + 8;

/// A mutex living in shared memory
pub struct ProcessMutex {
    raw: NonNull<libc::pthread_mutex_t>,
}

// Safety: pthread mutexes are designed to be shared between threads
unsafe impl Send for ProcessMutex {}
unsafe impl Sync for ProcessMutex {}

impl ProcessMutex {
    /// Initialize a fresh mutex at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, point to [`LOCK_AREA_SIZE`] writable bytes
    /// that stay mapped for the lifetime of the returned value, and no other
    /// thread or process may use the area until this returns.
    pub unsafe fn initialize(ptr: *mut u8) -> Result<Self> {
        let raw = NonNull::new(ptr as *mut libc::pthread_mutex_t)
            .ok_or_else(|| ScratchpadError::Platform("null mutex address".to_string()))?;

        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()), "pthread_mutexattr_init")?;
        let result = configure(attr.as_mut_ptr(), raw.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result?;

        Ok(Self { raw })
    }

    /// Use a mutex another process already initialized at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mutex set up by [`ProcessMutex::initialize`] that
    /// stays mapped for the lifetime of the returned value.
    pub unsafe fn attach(ptr: *mut u8) -> Result<Self> {
        let raw = NonNull::new(ptr as *mut libc::pthread_mutex_t)
            .ok_or_else(|| ScratchpadError::Platform("null mutex address".to_string()))?;
        Ok(Self { raw })
    }

    /// Block until the calling thread holds the mutex
    ///
    /// Reentrant: a thread that already holds the mutex acquires it again and
    /// must release it as many times.
    pub fn lock(&self) -> Result<ProcessMutexGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.as_ptr()) };
        match rc {
            0 => {}
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                warn!("Previous lock holder died; marking shared state consistent");
                check(
                    unsafe { libc::pthread_mutex_consistent(self.raw.as_ptr()) },
                    "pthread_mutex_consistent",
                )?;
            }
            errno => {
                return Err(ScratchpadError::from_platform_error(errno, "pthread_mutex_lock"));
            }
        }
        Ok(ProcessMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

unsafe fn configure(attr: *mut libc::pthread_mutexattr_t, raw: *mut libc::pthread_mutex_t) -> Result<()> {
    check(
        libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
        "pthread_mutexattr_setpshared",
    )?;
    check(
        libc::pthread_mutexattr_settype(attr, libc::PTHREAD_MUTEX_RECURSIVE),
        "pthread_mutexattr_settype",
    )?;
    #[cfg(target_os = "linux")]
    check(
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
        "pthread_mutexattr_setrobust",
    )?;
    check(libc::pthread_mutex_init(raw, attr), "pthread_mutex_init")
}

fn check(rc: libc::c_int, call: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ScratchpadError::from_platform_error(rc, call))
    }
}

/// Holds a [`ProcessMutex`] until dropped
///
/// Must be dropped on the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ProcessMutexGuard<'a> {
    mutex: &'a ProcessMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ProcessMutexGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw.as_ptr()) };
        if rc != 0 {
            warn!("pthread_mutex_unlock failed with {}", rc);
        }
    }
}

/// A standalone, named lock segment
///
/// Passed at container creation so several containers share one
/// mutual-exclusion domain; each container records the lock's name in its
/// header so attachers in other processes pick up the same lock.
pub struct SharedLockHandle {
    mutex: ProcessMutex,
    region: SharedMemoryRegion,
}

impl SharedLockHandle {
    /// Allocate and initialize a new lock segment
    pub fn create(manager: &SegmentManager) -> Result<Self> {
        let region = manager.create_segment(LOCK_SEGMENT_SIZE)?;
        let mutex = unsafe { ProcessMutex::initialize(region.as_mut_ptr())? };
        region.write_at(LOCK_AREA_SIZE, &LOCK_MAGIC.to_le_bytes())?;
        debug!("Created lock segment {}", region.name());
        Ok(Self { mutex, region })
    }

    /// Open a lock segment by name
    pub fn open(manager: &SegmentManager, name: &str) -> Result<Self> {
        let region = manager.open_segment(name)?;
        let mut magic = [0u8; 4];
        region.read_at(LOCK_AREA_SIZE, &mut magic)?;
        if u32::from_le_bytes(magic) != LOCK_MAGIC {
            return Err(ScratchpadError::Type(format!("{} is not a lock segment", name)));
        }
        let mutex = unsafe { ProcessMutex::attach(region.as_mut_ptr())? };
        Ok(Self { mutex, region })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn lock(&self) -> Result<ProcessMutexGuard<'_>> {
        self.mutex.lock()
    }

    pub(crate) fn mutex(&self) -> &ProcessMutex {
        &self.mutex
    }

    /// Remove the lock segment from the OS namespace
    pub fn destroy(self, manager: &SegmentManager) -> Result<()> {
        let name = self.region.name().to_string();
        drop(self);
        manager.unlink(&name)
    }
}

impl std::fmt::Debug for SharedLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLockHandle")
            .field("name", &self.region.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scratchpad_core::ScratchpadConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager() -> SegmentManager {
        SegmentManager::new(ScratchpadConfig::default())
    }

    #[test]
    fn test_lock_is_reentrant() {
        let manager = manager();
        let handle = SharedLockHandle::create(&manager).unwrap();
        let outer = handle.lock().unwrap();
        let inner = handle.lock().unwrap();
        drop(inner);
        drop(outer);
        handle.destroy(&manager).unwrap();
    }

    #[test]
    fn test_lock_shared_by_name() {
        let manager = manager();
        let handle = SharedLockHandle::create(&manager).unwrap();
        let other = SharedLockHandle::open(&manager, handle.name()).unwrap();
        assert_eq!(other.name(), handle.name());
        drop(other.lock().unwrap());
        handle.destroy(&manager).unwrap();
    }

    #[test]
    fn test_lock_excludes_threads() {
        let manager = manager();
        let handle = Arc::new(SharedLockHandle::create(&manager).unwrap());
        let inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = handle.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let name = handle.name().to_string();
        drop(handle);
        manager.unlink(&name).unwrap();
    }

    #[test]
    fn test_open_rejects_plain_segment() {
        let manager = manager();
        let region = manager.create_segment(128).unwrap();
        assert!(matches!(
            SharedLockHandle::open(&manager, region.name()),
            Err(ScratchpadError::Type(_))
        ));
        manager.unlink(region.name()).unwrap();
    }
}
