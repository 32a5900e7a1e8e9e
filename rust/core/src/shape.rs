//! Fixed-width shape descriptor
//!
//! Array headers reserve room for [`MAX_RANK`] little-endian `i64` dimensions
//! followed by a [`SHAPE_SENTINEL`] marking the end of the used prefix.

use crate::{Result, ScratchpadError};

/// Maximum number of array dimensions
pub const MAX_RANK: usize = 16;

/// Terminates the dimension list
pub const SHAPE_SENTINEL: i64 = -1;

/// Bytes reserved for a shape descriptor
pub const SHAPE_SLOT_WIDTH: usize = (MAX_RANK + 1) * 8;

/// Serialize `shape` into a descriptor slot
pub fn encode_shape(shape: &[usize]) -> Result<[u8; SHAPE_SLOT_WIDTH]> {
    if shape.len() > MAX_RANK {
        return Err(ScratchpadError::Value(format!(
            "rank {} exceeds the maximum of {}",
            shape.len(),
            MAX_RANK
        )));
    }
    let mut slot = [0u8; SHAPE_SLOT_WIDTH];
    for (i, &dim) in shape.iter().enumerate() {
        let dim = i64::try_from(dim)
            .map_err(|_| ScratchpadError::Value(format!("dimension {} is too large", dim)))?;
        slot[i * 8..(i + 1) * 8].copy_from_slice(&dim.to_le_bytes());
    }
    let end = shape.len() * 8;
    slot[end..end + 8].copy_from_slice(&SHAPE_SENTINEL.to_le_bytes());
    Ok(slot)
}

/// Read dimensions up to the sentinel
pub fn decode_shape(slot: &[u8]) -> Result<Vec<usize>> {
    let mut shape = Vec::new();
    for chunk in slot.chunks_exact(8).take(MAX_RANK + 1) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let dim = i64::from_le_bytes(raw);
        if dim == SHAPE_SENTINEL {
            return Ok(shape);
        }
        let dim = usize::try_from(dim).map_err(|_| {
            ScratchpadError::Deserialization(format!("negative dimension {} in shape", dim))
        })?;
        shape.push(dim);
    }
    Err(ScratchpadError::Deserialization(
        "shape descriptor has no sentinel".to_string(),
    ))
}

/// Number of elements an array of `shape` holds
pub fn element_count(shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim)
            .ok_or_else(|| ScratchpadError::Value(format!("shape {:?} overflows", shape)))
    })
}

/// Bytes an array of `shape` with `element_size`-byte elements occupies
pub fn byte_count(shape: &[usize], element_size: usize) -> Result<usize> {
    element_count(shape)?
        .checked_mul(element_size)
        .ok_or_else(|| ScratchpadError::Value(format!("shape {:?} overflows", shape)))
}
