//! Typed vector
//!
//! A growable sequence of one [`ElementType`]. The header extension records
//! the element key and the growth ratio; both are fixed at creation.

use crate::base::{delegate_to_base, CreateOptions, Session, SharedBase};
use crate::header::{slot, ContainerKind};
use crate::SegmentManager;
use scratchpad_core::{
    normalize_index, Element, ElementType, Result, Scalar, ScratchpadError, SliceSpec,
};
use std::sync::Arc;
use tracing::instrument;

const ELEMENT_KEY: usize = slot::EXTENSION;
const ELEMENT_KEY_WIDTH: usize = 16;
const GROWTH_RATIO: usize = slot::EXTENSION + ELEMENT_KEY_WIDTH;

/// A vector of fixed-width elements shared between processes
pub struct SharedVec {
    base: SharedBase,
    element: ElementType,
    growth_ratio: f64,
}

delegate_to_base!(SharedVec);

impl SharedVec {
    /// Create an empty vector
    #[instrument(skip(manager, options))]
    pub fn create(manager: Arc<SegmentManager>, element: ElementType, options: &CreateOptions) -> Result<Self> {
        let growth_ratio = options.growth_ratio.unwrap_or(manager.config().growth_ratio);
        if !(growth_ratio > 1.0 && growth_ratio.is_finite()) {
            return Err(ScratchpadError::Value(format!(
                "growth ratio must be a finite number above 1, got {}",
                growth_ratio
            )));
        }
        let minimum = manager.config().min_elements.max(growth_ratio.ceil() as usize);
        let elements = options.initial_capacity.unwrap_or(0).max(minimum);
        let capacity = elements.checked_mul(element.size()).ok_or_else(|| {
            ScratchpadError::Value(format!("capacity of {} elements overflows", elements))
        })?;

        let base = SharedBase::create(
            manager,
            ContainerKind::Vector,
            0,
            capacity,
            options.lock_name.as_deref(),
            |header| {
                header.write_str(ELEMENT_KEY, ELEMENT_KEY_WIDTH, element.key())?;
                header.write_f64(GROWTH_RATIO, growth_ratio)
            },
        )?;
        Ok(Self {
            base,
            element,
            growth_ratio,
        })
    }

    /// Attach to the vector published under `name`
    #[instrument(skip(manager))]
    pub fn attach(manager: Arc<SegmentManager>, name: &str) -> Result<Self> {
        let base = SharedBase::attach(manager, name, ContainerKind::Vector)?;
        let (element, growth_ratio) = {
            let session = base.session()?;
            let header = session.header();
            let key = header.read_str(ELEMENT_KEY, ELEMENT_KEY_WIDTH)?;
            (ElementType::from_key(&key)?, header.read_f64(GROWTH_RATIO)?)
        };
        Ok(Self {
            base,
            element,
            growth_ratio,
        })
    }

    pub fn element_type(&self) -> ElementType {
        self.element
    }

    pub fn growth_ratio(&self) -> f64 {
        self.growth_ratio
    }

    /// Number of elements
    pub fn len(&self) -> Result<usize> {
        let session = self.base.session()?;
        self.length(&session)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of elements that fit before the next relocation
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.base.session()?.capacity()? / self.element.size())
    }

    /// Append one element, growing by the ratio when full
    pub fn push_back(&self, value: impl Into<Scalar>) -> Result<()> {
        let packed = self.element.pack(value.into())?;
        let mut session = self.base.session()?;
        let used = session.logical_size()?;
        self.ensure_capacity(&mut session, used + packed.len())?;
        session.data_mut()?[used..used + packed.len()].copy_from_slice(&packed);
        session.set_logical_size(used + packed.len())
    }

    /// Append a native value
    pub fn push_value<T: Element>(&self, value: T) -> Result<()> {
        self.push_back(value.to_scalar())
    }

    /// Append every value, growing at most once
    pub fn extend<I, S>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        let packed = self.pack_all(values)?;
        if packed.is_empty() {
            return Ok(());
        }
        let mut session = self.base.session()?;
        let used = session.logical_size()?;
        self.ensure_capacity(&mut session, used + packed.len())?;
        session.data_mut()?[used..used + packed.len()].copy_from_slice(&packed);
        session.set_logical_size(used + packed.len())
    }

    /// Element at `index`; negative indices count from the end
    pub fn get(&self, index: isize) -> Result<Scalar> {
        let session = self.base.session()?;
        let position = normalize_index(index, self.length(&session)?)?;
        self.unpack_at(&session, position)
    }

    /// Element at `index` as a native value
    pub fn get_as<T: Element>(&self, index: isize) -> Result<T> {
        T::from_scalar(self.get(index)?)
    }

    /// Elements selected by a `start:stop:step` slice
    pub fn get_slice(&self, slice: impl Into<SliceSpec>) -> Result<Vec<Scalar>> {
        let session = self.base.session()?;
        let indices = slice.into().indices(self.length(&session)?)?;
        indices
            .iter()
            .map(|position| self.unpack_at(&session, position))
            .collect()
    }

    pub fn set(&self, index: isize, value: impl Into<Scalar>) -> Result<()> {
        let packed = self.element.pack(value.into())?;
        let mut session = self.base.session()?;
        let position = normalize_index(index, self.length(&session)?)?;
        let offset = position * packed.len();
        session.data_mut()?[offset..offset + packed.len()].copy_from_slice(&packed);
        Ok(())
    }

    /// Overwrite the elements a slice selects
    ///
    /// `values` must yield exactly one value per selected position.
    pub fn set_slice<I, S>(&self, slice: impl Into<SliceSpec>, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        let slice = slice.into();
        let packed = self.pack_all(values)?;
        let size = self.element.size();
        let mut session = self.base.session()?;
        let indices = slice.indices(self.length(&session)?)?;
        if packed.len() != indices.len() * size {
            return Err(ScratchpadError::Value(format!(
                "slice selects {} elements but {} values were given",
                indices.len(),
                packed.len() / size
            )));
        }
        let data = session.data_mut()?;
        for (chunk, position) in packed.chunks_exact(size).zip(indices.iter()) {
            data[position * size..(position + 1) * size].copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Remove and return the last element
    pub fn pop(&self) -> Result<Option<Scalar>> {
        let mut session = self.base.session()?;
        let len = self.length(&session)?;
        if len == 0 {
            return Ok(None);
        }
        let value = self.unpack_at(&session, len - 1)?;
        session.set_logical_size((len - 1) * self.element.size())?;
        Ok(Some(value))
    }

    /// Drop every element, keeping the capacity
    pub fn clear(&self) -> Result<()> {
        self.base.session()?.set_logical_size(0)
    }

    /// Make room for at least `additional` more elements
    pub fn reserve(&self, additional: usize) -> Result<()> {
        let mut session = self.base.session()?;
        let used = session.logical_size()?;
        let wanted = additional
            .checked_mul(self.element.size())
            .and_then(|bytes| bytes.checked_add(used))
            .ok_or_else(|| ScratchpadError::Value(format!("cannot reserve {} elements", additional)))?;
        self.ensure_capacity(&mut session, wanted)
    }

    /// Snapshot of every element
    pub fn to_vec(&self) -> Result<Vec<Scalar>> {
        self.get_slice(SliceSpec::full())
    }

    fn length(&self, session: &Session<'_>) -> Result<usize> {
        Ok(session.logical_size()? / self.element.size())
    }

    fn unpack_at(&self, session: &Session<'_>, position: usize) -> Result<Scalar> {
        let size = self.element.size();
        let data = session.data()?;
        self.element.unpack(&data[position * size..(position + 1) * size])
    }

    fn pack_all<I, S>(&self, values: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        let size = self.element.size();
        let mut packed = Vec::new();
        for value in values {
            let start = packed.len();
            packed.resize(start + size, 0);
            self.element.pack_into(value.into(), &mut packed[start..])?;
        }
        Ok(packed)
    }

    /// Grow geometrically until `needed` bytes fit
    fn ensure_capacity(&self, session: &mut Session<'_>, needed: usize) -> Result<()> {
        let size = self.element.size();
        let mut elements = session.capacity()? / size;
        let mut bytes = elements * size;
        if needed <= bytes {
            return Ok(());
        }
        let limit = self.base.manager().config().max_segment_size;
        let too_large = || {
            ScratchpadError::Value(format!(
                "{} bytes exceeds the segment limit of {} bytes",
                needed, limit
            ))
        };
        if needed > limit {
            return Err(too_large());
        }
        while bytes < needed {
            elements = grown_capacity(elements, self.growth_ratio);
            bytes = elements.checked_mul(size).ok_or_else(too_large)?;
        }
        // clamp an overshooting step to the segment limit
        session.recap(bytes.min(limit / size * size).max(needed))?;
        Ok(())
    }
}

/// Next capacity in elements: the smallest `ceil(ratio^k)` above `elements`
///
/// Snapping to the geometric series keeps rounding from compounding across
/// successive growths.
fn grown_capacity(elements: usize, ratio: f64) -> usize {
    let mut k = ((elements.max(1) as f64).ln() / ratio.ln()).floor().max(0.0) as i32;
    loop {
        let next = ratio.powi(k).ceil();
        if next >= usize::MAX as f64 {
            return usize::MAX;
        }
        if next as usize > elements {
            return next as usize;
        }
        k += 1;
    }
}

impl std::fmt::Debug for SharedVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedVec")
            .field("name", &self.name())
            .field("element", &self.element)
            .field("growth_ratio", &self.growth_ratio)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scratchpad_core::ScratchpadConfig;

    fn manager() -> Arc<SegmentManager> {
        Arc::new(SegmentManager::new(ScratchpadConfig::default()))
    }

    fn int32_vec(manager: &Arc<SegmentManager>) -> SharedVec {
        SharedVec::create(Arc::clone(manager), ElementType::Int32, &CreateOptions::default()).unwrap()
    }

    #[test]
    fn test_growth_sequence() {
        let manager = manager();
        let v = int32_vec(&manager);
        assert_eq!(v.capacity().unwrap(), 2);

        let mut seen = vec![];
        for i in 0..20 {
            v.push_back(i).unwrap();
            let capacity = v.capacity().unwrap();
            if seen.last() != Some(&capacity) {
                seen.push(capacity);
            }
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32]);
        assert_eq!(v.len().unwrap(), 20);
        assert_eq!(v.get(0).unwrap(), Scalar::Int(0));
        assert_eq!(v.get(-1).unwrap(), Scalar::Int(19));
    }

    #[test]
    fn test_reserve_beyond_segment_limit() {
        let manager = manager();
        let v = SharedVec::create(Arc::clone(&manager), ElementType::Int64, &CreateOptions::default()).unwrap();
        assert!(matches!(v.reserve(usize::MAX / 8), Err(ScratchpadError::Value(_))));
        assert!(matches!(v.reserve(usize::MAX), Err(ScratchpadError::Value(_))));
        assert_eq!(v.capacity().unwrap(), 2);

        let mut config = ScratchpadConfig::default();
        config.max_segment_size = 4096;
        let small = Arc::new(SegmentManager::new(config));
        let v = SharedVec::create(Arc::clone(&small), ElementType::Int64, &CreateOptions::default()).unwrap();
        assert!(matches!(v.reserve(513), Err(ScratchpadError::Value(_))));
        v.reserve(300).unwrap();
        let capacity = v.capacity().unwrap();
        assert!((300..=512).contains(&capacity), "capacity {}", capacity);
        v.push_back(1i64).unwrap();
        assert_eq!(v.len().unwrap(), 1);
    }

    #[test]
    fn test_fractional_ratio_always_grows() {
        assert_eq!(grown_capacity(2, 1.1), 3);
        assert_eq!(grown_capacity(10, 1.5), 12);
        assert_eq!(grown_capacity(0, 2.0), 1);
        assert_eq!(grown_capacity(3, 3.0), 9);
        assert_eq!(grown_capacity(usize::MAX, 2.0), usize::MAX);
    }

    #[test]
    fn test_index_errors() {
        let manager = manager();
        let v = int32_vec(&manager);
        v.extend([1, 2, 3]).unwrap();
        assert!(matches!(v.get(3), Err(ScratchpadError::Index { index: 3, len: 3 })));
        assert!(matches!(v.get(-4), Err(ScratchpadError::Index { .. })));
        assert!(matches!(v.set(5, 0), Err(ScratchpadError::Index { .. })));
        assert_eq!(v.get(-3).unwrap(), Scalar::Int(1));
    }

    #[test]
    fn test_slices() {
        let manager = manager();
        let v = int32_vec(&manager);
        v.extend(0..10).unwrap();

        assert_eq!(v.get_slice(2isize..5).unwrap(), vec![Scalar::Int(2), Scalar::Int(3), Scalar::Int(4)]);
        assert_eq!(
            v.get_slice(SliceSpec::new(None, None, Some(-3))).unwrap(),
            vec![Scalar::Int(9), Scalar::Int(6), Scalar::Int(3), Scalar::Int(0)]
        );
        assert!(v.get_slice(5isize..2).unwrap().is_empty());
        assert_eq!(v.get_slice(-2isize..).unwrap(), vec![Scalar::Int(8), Scalar::Int(9)]);

        v.set_slice(SliceSpec::new(Some(0), Some(6), Some(2)), [10, 20, 30]).unwrap();
        assert_eq!(v.get_as::<i32>(0).unwrap(), 10);
        assert_eq!(v.get_as::<i32>(1).unwrap(), 1);
        assert_eq!(v.get_as::<i32>(4).unwrap(), 30);

        assert!(matches!(v.set_slice(0isize..3, [1, 2]), Err(ScratchpadError::Value(_))));
        assert!(matches!(
            v.set_slice(0isize..3, [1, 2, 3, 4]),
            Err(ScratchpadError::Value(_))
        ));
        assert_eq!(v.get_as::<i32>(0).unwrap(), 10);
    }

    #[test]
    fn test_pack_overflow_leaves_vector_unchanged() {
        let manager = manager();
        let v = SharedVec::create(Arc::clone(&manager), ElementType::Int8, &CreateOptions::default()).unwrap();
        v.push_back(1).unwrap();
        assert!(matches!(v.push_back(300), Err(ScratchpadError::ValueOutOfRange { .. })));
        assert!(matches!(v.push_back(f64::NAN), Err(ScratchpadError::ValueOutOfRange { .. })));
        assert_eq!(v.len().unwrap(), 1);
    }

    #[test]
    fn test_pop_clear_reserve() {
        let manager = manager();
        let v = SharedVec::create(Arc::clone(&manager), ElementType::Float64, &CreateOptions::default()).unwrap();
        assert_eq!(v.pop().unwrap(), None);
        v.extend([1.5, 2.5]).unwrap();
        assert_eq!(v.pop().unwrap(), Some(Scalar::Float(2.5)));
        assert_eq!(v.to_vec().unwrap(), vec![Scalar::Float(1.5)]);

        v.reserve(100).unwrap();
        assert!(v.capacity().unwrap() >= 101);
        v.clear().unwrap();
        assert!(v.is_empty().unwrap());
        assert!(v.capacity().unwrap() >= 101);
    }

    #[test]
    fn test_attach_sees_pushes_and_growth() {
        let manager = manager();
        let v = int32_vec(&manager);
        let attached = SharedVec::attach(Arc::clone(&manager), v.name()).unwrap();
        assert_eq!(attached.element_type(), ElementType::Int32);
        assert_eq!(attached.growth_ratio(), 2.0);

        for i in 0..50 {
            v.push_back(i).unwrap();
        }
        assert_eq!(attached.len().unwrap(), 50);
        assert_eq!(attached.get(-1).unwrap(), Scalar::Int(49));
        attached.set(0, 7).unwrap();
        assert_eq!(v.get(0).unwrap(), Scalar::Int(7));
    }

    #[test]
    fn test_bool_vector() {
        let manager = manager();
        let v = SharedVec::create(Arc::clone(&manager), ElementType::Bool, &CreateOptions::default()).unwrap();
        v.extend([true, false]).unwrap();
        v.push_back(2).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)]);
    }

    #[test]
    fn test_custom_ratio_and_capacity() {
        let manager = manager();
        let options = CreateOptions::new().with_capacity(10).with_growth_ratio(1.5);
        let v = SharedVec::create(Arc::clone(&manager), ElementType::UInt16, &options).unwrap();
        assert_eq!(v.capacity().unwrap(), 10);
        v.extend(0u16..11).unwrap();
        assert_eq!(v.capacity().unwrap(), 12);

        let bad = CreateOptions::new().with_growth_ratio(1.0);
        assert!(matches!(
            SharedVec::create(Arc::clone(&manager), ElementType::UInt16, &bad),
            Err(ScratchpadError::Value(_))
        ));
    }

    #[test]
    fn test_attach_wrong_kind_is_type_error() {
        let manager = manager();
        let base = SharedBase::create(Arc::clone(&manager), ContainerKind::Dict, 0, 64, None, |_| Ok(())).unwrap();
        assert!(matches!(
            SharedVec::attach(Arc::clone(&manager), base.name()),
            Err(ScratchpadError::Type(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_round_trip_i16(values in prop::collection::vec(any::<i16>(), 0..64)) {
            let manager = manager();
            let v = SharedVec::create(Arc::clone(&manager), ElementType::Int16, &CreateOptions::default()).unwrap();
            for &x in &values {
                v.push_back(x).unwrap();
            }
            let back: Vec<i16> = (0..values.len() as isize).map(|i| v.get_as(i).unwrap()).collect();
            prop_assert_eq!(back, values);
        }

        #[test]
        fn prop_round_trip_u64(values in prop::collection::vec(any::<u64>(), 0..64)) {
            let manager = manager();
            let v = SharedVec::create(Arc::clone(&manager), ElementType::UInt64, &CreateOptions::default()).unwrap();
            for &x in &values {
                v.push_value(x).unwrap();
            }
            let back: Vec<u64> = (0..values.len() as isize).map(|i| v.get_as(i).unwrap()).collect();
            prop_assert_eq!(back, values);
        }

        #[test]
        fn prop_round_trip_f32(values in prop::collection::vec(-1.0e30f32..1.0e30, 0..64)) {
            let manager = manager();
            let v = SharedVec::create(Arc::clone(&manager), ElementType::Float32, &CreateOptions::default()).unwrap();
            for &x in &values {
                v.push_back(x).unwrap();
            }
            let back: Vec<f32> = (0..values.len() as isize).map(|i| v.get_as(i).unwrap()).collect();
            prop_assert_eq!(back, values);
        }

        #[test]
        fn prop_growth_bound(n in 1usize..300) {
            let manager = manager();
            let v = SharedVec::create(Arc::clone(&manager), ElementType::UInt8, &CreateOptions::default()).unwrap();
            for i in 0..n {
                v.push_back(i as u8).unwrap();
            }
            let bound = n.next_power_of_two().max(2);
            prop_assert!(v.capacity().unwrap() <= bound);
            prop_assert!(v.capacity().unwrap() >= n);
        }

        #[test]
        fn prop_growth_bound_fractional(n in 2usize..300, ratio in prop::sample::select(vec![1.5f64, 3.0])) {
            let manager = manager();
            let options = CreateOptions::new().with_growth_ratio(ratio);
            let v = SharedVec::create(Arc::clone(&manager), ElementType::UInt8, &options).unwrap();
            for i in 0..n {
                v.push_back(i as u8).unwrap();
            }
            let exponent = ((n as f64).ln() / ratio.ln()).ceil() as i32;
            let bound = ratio.powi(exponent).ceil().max(2.0);
            let capacity = v.capacity().unwrap();
            prop_assert!(capacity as f64 <= bound, "capacity {} above {} for n={} r={}", capacity, bound, n, ratio);
            prop_assert!(capacity >= n);
        }
    }
}
