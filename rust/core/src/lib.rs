//! Scratchpad - Core Module
//!
//! Platform-independent building blocks for process-shared containers:
//! the element type registry, index and shape helpers, configuration and
//! the error taxonomy.

#[cfg(not(target_endian = "little"))]
compile_error!("shared buffers are little-endian and are viewed in place");

pub mod config;
pub mod element;
pub mod error;
pub mod shape;
pub mod slice;

pub use config::*;
pub use element::*;
pub use error::*;
pub use shape::{byte_count, decode_shape, element_count, encode_shape, MAX_RANK};
pub use slice::*;

/// Re-export common types
pub mod prelude {
    pub use crate::{
        config::ScratchpadConfig,
        element::{Element, ElementType, NumericElement, Scalar},
        error::{ErrorCategory, Result, ScratchpadError},
        slice::SliceSpec,
    };
}

/// Current version of the scratchpad crates
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
