//! Python-style index and slice resolution

use crate::{Result, ScratchpadError};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// Resolve a possibly negative index against `len`
pub fn normalize_index(index: isize, len: usize) -> Result<usize> {
    let resolved = if index < 0 {
        index.checked_add(len as isize)
    } else {
        Some(index)
    };
    match resolved {
        Some(i) if i >= 0 && (i as usize) < len => Ok(i as usize),
        _ => Err(ScratchpadError::Index { index, len }),
    }
}

/// An unresolved `start:stop:step` triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: Option<isize>,
}

impl SliceSpec {
    pub fn new(start: Option<isize>, stop: Option<isize>, step: Option<isize>) -> Self {
        Self { start, stop, step }
    }

    /// The whole sequence
    pub fn full() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: isize) -> Self {
        self.step = Some(step);
        self
    }

    /// Clamp against a sequence of `len` elements
    pub fn indices(&self, len: usize) -> Result<SliceIndices> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(ScratchpadError::Value("slice step cannot be zero".to_string()));
        }
        let len = len as isize;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |bound: isize| {
            if bound < 0 {
                (bound + len).max(lower)
            } else {
                bound.min(upper)
            }
        };
        let start = match self.start {
            Some(s) => clamp(s),
            None if step < 0 => upper,
            None => lower,
        };
        let stop = match self.stop {
            Some(s) => clamp(s),
            None if step < 0 => lower,
            None => upper,
        };
        Ok(SliceIndices { start, stop, step })
    }
}

impl From<Range<isize>> for SliceSpec {
    fn from(range: Range<isize>) -> Self {
        Self::new(Some(range.start), Some(range.end), None)
    }
}

impl From<RangeFrom<isize>> for SliceSpec {
    fn from(range: RangeFrom<isize>) -> Self {
        Self::new(Some(range.start), None, None)
    }
}

impl From<RangeTo<isize>> for SliceSpec {
    fn from(range: RangeTo<isize>) -> Self {
        Self::new(None, Some(range.end), None)
    }
}

impl From<RangeFull> for SliceSpec {
    fn from(_: RangeFull) -> Self {
        Self::full()
    }
}

/// A slice resolved against a concrete length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceIndices {
    pub start: isize,
    pub stop: isize,
    pub step: isize,
}

impl SliceIndices {
    /// Number of positions the slice selects
    pub fn len(&self) -> usize {
        if self.step > 0 && self.stop > self.start {
            (self.stop - self.start - 1) as usize / self.step.unsigned_abs() + 1
        } else if self.step < 0 && self.start > self.stop {
            (self.start - self.stop - 1) as usize / self.step.unsigned_abs() + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selected positions in slice order
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let SliceIndices { start, step, .. } = *self;
        (0..self.len()).map(move |k| (start + k as isize * step) as usize)
    }
}
