//! Error types for process-shared containers

use crate::ElementType;
use thiserror::Error;

/// Scratchpad error types
#[derive(Error, Debug)]
pub enum ScratchpadError {
    /// Out-of-range access in a vector or array
    #[error("Index {index} out of range for length {len}")]
    Index { index: isize, len: usize },

    /// Mismatched slice length, reshape or dtype change without resize
    #[error("Value error: {0}")]
    Value(String),

    /// A value that does not fit the target element type
    #[error("Value {value} does not fit element type {element}")]
    ValueOutOfRange { value: String, element: ElementType },

    /// Wrong kind of value, index or container
    #[error("Type error: {0}")]
    Type(String),

    /// Element type key or dtype character not in the registry
    #[error("Unknown element type: {0}")]
    UnknownType(String),

    /// The OS refused to allocate a segment under the requested name
    #[error("Segment name unavailable: {0}")]
    NameUnavailable(String),

    /// No segment exists under the requested name
    #[error("Shared memory segment not found: {0}")]
    SegmentNotFound(String),

    /// The header references a data segment that no longer exists
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// A dictionary value could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Stored bytes could not be decoded
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, ScratchpadError>;

impl ScratchpadError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ScratchpadError::Io(err) => {
                matches!(err.kind(),
                    std::io::ErrorKind::WouldBlock |
                    std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Get the taxonomy bucket of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScratchpadError::Index { .. } => ErrorCategory::Index,
            ScratchpadError::Value(_) => ErrorCategory::Value,
            ScratchpadError::ValueOutOfRange { .. } => ErrorCategory::Value,
            ScratchpadError::Type(_) => ErrorCategory::Type,
            ScratchpadError::UnknownType(_) => ErrorCategory::Type,
            ScratchpadError::NameUnavailable(_) => ErrorCategory::NameUnavailable,
            ScratchpadError::SegmentNotFound(_) => ErrorCategory::StaleReference,
            ScratchpadError::StaleReference(_) => ErrorCategory::StaleReference,
            ScratchpadError::Serialization(_) => ErrorCategory::Serialization,
            ScratchpadError::Deserialization(_) => ErrorCategory::Serialization,
            ScratchpadError::Platform(_) => ErrorCategory::Platform,
            ScratchpadError::Io(_) => ErrorCategory::Platform,
        }
    }

    /// Convert platform error codes to ScratchpadError
    pub fn from_platform_error(errno: i32, message: impl Into<String>) -> Self {
        match errno {
            17 => ScratchpadError::NameUnavailable(message.into()), // EEXIST
            2 => ScratchpadError::SegmentNotFound(message.into()),  // ENOENT
            13 => ScratchpadError::Platform(format!("permission denied: {}", message.into())), // EACCES
            4 | 11 => ScratchpadError::Io(std::io::Error::from_raw_os_error(errno)), // EINTR, EAGAIN
            _ => ScratchpadError::Platform(format!("Error {}: {}", errno, message.into())),
        }
    }
}

/// Error categories matching the container error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Index,
    Value,
    Type,
    NameUnavailable,
    StaleReference,
    Serialization,
    Platform,
}

impl From<rmp_serde::encode::Error> for ScratchpadError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ScratchpadError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ScratchpadError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ScratchpadError::Deserialization(err.to_string())
    }
}

impl From<serde_json::Error> for ScratchpadError {
    fn from(err: serde_json::Error) -> Self {
        ScratchpadError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery() {
        let interrupted = ScratchpadError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(interrupted.is_recoverable());

        let stale = ScratchpadError::StaleReference("gone".to_string());
        assert!(!stale.is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        let index = ScratchpadError::Index { index: -7, len: 3 };
        assert_eq!(index.category(), ErrorCategory::Index);

        let overflow = ScratchpadError::ValueOutOfRange {
            value: "300".to_string(),
            element: ElementType::UInt8,
        };
        assert_eq!(overflow.category(), ErrorCategory::Value);

        let missing = ScratchpadError::SegmentNotFound("scp_0".to_string());
        assert_eq!(missing.category(), ErrorCategory::StaleReference);
    }

    #[test]
    fn test_platform_error_mapping() {
        assert!(matches!(
            ScratchpadError::from_platform_error(17, "shm_open"),
            ScratchpadError::NameUnavailable(_)
        ));
        assert!(matches!(
            ScratchpadError::from_platform_error(2, "shm_open"),
            ScratchpadError::SegmentNotFound(_)
        ));
        assert!(ScratchpadError::from_platform_error(4, "lock").is_recoverable());
    }
}
