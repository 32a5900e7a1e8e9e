//! Typed N-dimensional array
//!
//! The buffer holds `product(shape)` row-major elements of one dtype. Shape
//! and dtype live in the header and are re-read on every access, since any
//! attached process may reshape or retype the array.

use crate::base::{delegate_to_base, CreateOptions, Session, SharedBase};
use crate::header::{slot, ContainerKind};
use crate::SegmentManager;
use ndarray::{ArrayBase, ArrayD, ArrayViewD, ArrayViewMutD, Data, Dimension, IxDyn};
use scratchpad_core::shape::SHAPE_SLOT_WIDTH;
use scratchpad_core::{
    byte_count, decode_shape, element_count, encode_shape, normalize_index, Element, ElementType,
    NumericElement, Result, Scalar, ScratchpadError,
};
use std::sync::Arc;
use tracing::{debug, instrument};

const SHAPE: usize = slot::EXTENSION;
const DTYPE: usize = slot::EXTENSION + SHAPE_SLOT_WIDTH;

/// An N-dimensional array shared between processes
pub struct SharedArray {
    base: SharedBase,
}

delegate_to_base!(SharedArray);

struct Layout {
    shape: Vec<usize>,
    dtype: ElementType,
}

impl Layout {
    fn read(session: &Session<'_>) -> Result<Self> {
        let header = session.header();
        let mut raw = [0u8; SHAPE_SLOT_WIDTH];
        header.read_bytes(SHAPE, &mut raw)?;
        let shape = decode_shape(&raw)?;
        let dtype = ElementType::from_dtype_char(header.read_u8(DTYPE)? as char)?;
        Ok(Self { shape, dtype })
    }

    fn nbytes(&self) -> Result<usize> {
        byte_count(&self.shape, self.dtype.size())
    }

    fn flat_index(&self, index: &[isize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(ScratchpadError::Value(format!(
                "index has {} dimensions but the array has {}",
                index.len(),
                self.shape.len()
            )));
        }
        let mut flat = 0;
        for (&dim, &i) in self.shape.iter().zip(index) {
            flat = flat * dim + normalize_index(i, dim)?;
        }
        Ok(flat)
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype == T::TYPE {
            Ok(())
        } else {
            Err(ScratchpadError::Type(format!(
                "array holds {} but {} was requested",
                self.dtype,
                T::TYPE
            )))
        }
    }
}

impl SharedArray {
    /// Create a zero-filled array
    #[instrument(skip(manager, options))]
    pub fn create(
        manager: Arc<SegmentManager>,
        shape: &[usize],
        dtype: ElementType,
        options: &CreateOptions,
    ) -> Result<Self> {
        let encoded = encode_shape(shape)?;
        let nbytes = byte_count(shape, dtype.size())?;
        let reserved = options
            .initial_capacity
            .unwrap_or(0)
            .max(manager.config().min_elements)
            .saturating_mul(dtype.size());
        let capacity = nbytes.max(reserved);

        let base = SharedBase::create(
            manager,
            ContainerKind::Array,
            nbytes,
            capacity,
            options.lock_name.as_deref(),
            |header| {
                header.write_bytes(SHAPE, &encoded)?;
                header.write_u8(DTYPE, dtype.dtype_char() as u8)
            },
        )?;
        Ok(Self { base })
    }

    /// Attach to the array published under `name`
    #[instrument(skip(manager))]
    pub fn attach(manager: Arc<SegmentManager>, name: &str) -> Result<Self> {
        let array = Self {
            base: SharedBase::attach(manager, name, ContainerKind::Array)?,
        };
        Layout::read(&array.base.session()?)?;
        Ok(array)
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        Ok(Layout::read(&self.base.session()?)?.shape)
    }

    pub fn dtype(&self) -> Result<ElementType> {
        Ok(Layout::read(&self.base.session()?)?.dtype)
    }

    pub fn ndim(&self) -> Result<usize> {
        Ok(self.shape()?.len())
    }

    /// Number of elements
    pub fn len(&self) -> Result<usize> {
        element_count(&self.shape()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes occupied by the elements
    pub fn nbytes(&self) -> Result<usize> {
        self.base.session()?.logical_size()
    }

    /// Bytes available before the next relocation
    pub fn capacity(&self) -> Result<usize> {
        self.base.session()?.capacity()
    }

    /// Element at an N-D index; negative components count from the end
    pub fn get(&self, index: &[isize]) -> Result<Scalar> {
        let session = self.base.session()?;
        let layout = Layout::read(&session)?;
        let offset = layout.flat_index(index)? * layout.dtype.size();
        layout.dtype.unpack(&session.data()?[offset..])
    }

    pub fn get_as<T: Element>(&self, index: &[isize]) -> Result<T> {
        T::from_scalar(self.get(index)?)
    }

    pub fn set(&self, index: &[isize], value: impl Into<Scalar>) -> Result<()> {
        let mut session = self.base.session()?;
        let layout = Layout::read(&session)?;
        let size = layout.dtype.size();
        let offset = layout.flat_index(index)? * size;
        layout
            .dtype
            .pack_into(value.into(), &mut session.data_mut()?[offset..offset + size])
    }

    /// Set every element to `value`
    pub fn fill(&self, value: impl Into<Scalar>) -> Result<()> {
        let mut session = self.base.session()?;
        let layout = Layout::read(&session)?;
        let packed = layout.dtype.pack(value.into())?;
        let nbytes = layout.nbytes()?;
        for chunk in session.data_mut()?[..nbytes].chunks_exact_mut(packed.len()) {
            chunk.copy_from_slice(&packed);
        }
        Ok(())
    }

    /// Run `f` on a view of the current buffer
    ///
    /// The view reflects the latest shape and dtype and is only valid inside
    /// `f`, which runs with the lock held and must not call back into this
    /// array.
    pub fn with_view<T, R, F>(&self, f: F) -> Result<R>
    where
        T: NumericElement,
        F: FnOnce(ArrayViewD<'_, T>) -> R,
    {
        let session = self.base.session()?;
        let layout = Layout::read(&session)?;
        layout.check_dtype::<T>()?;
        let bytes = &session.data()?[..layout.nbytes()?];
        let elements: &[T] = bytemuck::try_cast_slice(bytes)
            .map_err(|e| ScratchpadError::Platform(format!("cannot view buffer: {:?}", e)))?;
        let view = ArrayViewD::from_shape(IxDyn(&layout.shape), elements)
            .map_err(|e| ScratchpadError::Value(e.to_string()))?;
        Ok(f(view))
    }

    /// Run `f` on a mutable view of the current buffer
    pub fn with_view_mut<T, R, F>(&self, f: F) -> Result<R>
    where
        T: NumericElement,
        F: FnOnce(ArrayViewMutD<'_, T>) -> R,
    {
        let mut session = self.base.session()?;
        let layout = Layout::read(&session)?;
        layout.check_dtype::<T>()?;
        let nbytes = layout.nbytes()?;
        let bytes = &mut session.data_mut()?[..nbytes];
        let elements: &mut [T] = bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| ScratchpadError::Platform(format!("cannot view buffer: {:?}", e)))?;
        let view = ArrayViewMutD::from_shape(IxDyn(&layout.shape), elements)
            .map_err(|e| ScratchpadError::Value(e.to_string()))?;
        Ok(f(view))
    }

    /// Owned snapshot of the array
    pub fn to_ndarray<T: NumericElement>(&self) -> Result<ArrayD<T>> {
        self.with_view(|view: ArrayViewD<'_, T>| view.to_owned())
    }

    /// Change the element type in place
    ///
    /// Bytes are reinterpreted, not converted. When the new type needs more
    /// room than the buffer has, `resize` must be set.
    #[instrument(skip(self), fields(name = %self.name()))]
    pub fn set_dtype(&self, dtype: ElementType, resize: bool) -> Result<()> {
        let mut session = self.base.session()?;
        let layout = Layout::read(&session)?;
        if layout.dtype == dtype {
            return Ok(());
        }
        let nbytes = byte_count(&layout.shape, dtype.size())?;
        if nbytes > session.capacity()? {
            if !resize {
                return Err(ScratchpadError::Value(format!(
                    "new dtype {} overflows buffer of {} bytes",
                    dtype,
                    session.capacity()?
                )));
            }
            session.recap(nbytes)?;
        }
        session.header().write_u8(DTYPE, dtype.dtype_char() as u8)?;
        session.set_logical_size(nbytes)?;
        session.bump_epoch()?;
        debug!("dtype {} -> {}", layout.dtype, dtype);
        Ok(())
    }

    /// Change the shape
    ///
    /// A shape with a different element count needs `resize`.
    #[instrument(skip(self), fields(name = %self.name()))]
    pub fn reshape(&self, shape: &[usize], resize: bool) -> Result<()> {
        let encoded = encode_shape(shape)?;
        let mut session = self.base.session()?;
        let layout = Layout::read(&session)?;
        if layout.shape == shape {
            return Ok(());
        }
        if element_count(shape)? != element_count(&layout.shape)? && !resize {
            return Err(ScratchpadError::Value(format!(
                "new shape {:?} would change size of {:?}",
                shape, layout.shape
            )));
        }
        let nbytes = byte_count(shape, layout.dtype.size())?;
        session.recap(nbytes)?;
        session.header().write_bytes(SHAPE, &encoded)?;
        session.set_logical_size(nbytes)?;
        session.bump_epoch()?;
        debug!("shape {:?} -> {:?}", layout.shape, shape);
        Ok(())
    }

    /// Copy `source` element-wise; shape and dtype must already match
    pub fn copy_from<T, S, D>(&self, source: &ArrayBase<S, D>) -> Result<()>
    where
        T: NumericElement,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let _lock = self.base.lock()?;
        let shape = self.shape()?;
        if source.shape() != shape.as_slice() {
            return Err(ScratchpadError::Value(format!(
                "source shape {:?} does not match {:?}",
                source.shape(),
                shape
            )));
        }
        let dtype = self.dtype()?;
        if dtype != T::TYPE {
            return Err(ScratchpadError::Value(format!(
                "source dtype {} does not match {}",
                T::TYPE,
                dtype
            )));
        }
        self.with_view_mut(|mut view: ArrayViewMutD<'_, T>| view.assign(source))
    }

    /// Replace the contents with `source`, adopting its shape and dtype
    ///
    /// The new layout is validated and the buffer grown before any header slot
    /// changes, so a failure leaves the array as it was.
    pub fn assign_from<T, S, D>(&self, source: &ArrayBase<S, D>) -> Result<()>
    where
        T: NumericElement,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let encoded = encode_shape(source.shape())?;
        let nbytes = byte_count(source.shape(), T::TYPE.size())?;
        let _lock = self.base.lock()?;
        {
            let mut session = self.base.session()?;
            let layout = Layout::read(&session)?;
            if layout.shape != source.shape() || layout.dtype != T::TYPE {
                session.recap(nbytes)?;
                session.header().write_bytes(SHAPE, &encoded)?;
                session.header().write_u8(DTYPE, T::TYPE.dtype_char() as u8)?;
                session.set_logical_size(nbytes)?;
                session.bump_epoch()?;
                debug!(
                    "layout {:?} {} -> {:?} {}",
                    layout.shape,
                    layout.dtype,
                    source.shape(),
                    T::TYPE
                );
            }
        }
        self.with_view_mut(|mut view: ArrayViewMutD<'_, T>| view.assign(source))
    }
}

impl std::fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArray").field("name", &self.name()).finish()
    }
}
