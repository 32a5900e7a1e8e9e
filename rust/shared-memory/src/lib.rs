//! Scratchpad - Shared Memory Module
//!
//! Named segments, the process-shared lock, the header list and the three
//! container kinds built on them.

#[cfg(not(unix))]
compile_error!("scratchpad shared memory requires a Unix platform");

pub mod array;
pub mod base;
pub mod dict;
pub mod header;
pub mod lock;
pub mod manager;
pub mod platform;
pub mod region;
pub mod vector;

pub use array::SharedArray;
pub use base::{ContainerLock, CreateOptions, Session, SharedBase};
pub use dict::SharedDict;
pub use header::{ContainerKind, HeaderFields, HeaderList, HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION};
pub use lock::{ProcessMutex, ProcessMutexGuard, SharedLockHandle};
pub use manager::SegmentManager;
pub use platform::*;
pub use region::*;
pub use vector::SharedVec;
