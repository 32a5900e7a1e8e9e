//! Element type registry
//!
//! The closed set of fixed-width kinds a vector or array may hold. Each kind
//! knows its byte width, the key stored in vector headers, the one-character
//! dtype code stored in array headers, and how to pack and unpack a
//! [`Scalar`] using little-endian, two's-complement and IEEE-754 encodings.

use crate::{Result, ScratchpadError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-width element kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Bool,
}

impl ElementType {
    /// Every registered element type
    pub const ALL: [ElementType; 11] = [
        ElementType::Int8,
        ElementType::UInt8,
        ElementType::Int16,
        ElementType::UInt16,
        ElementType::Int32,
        ElementType::UInt32,
        ElementType::Int64,
        ElementType::UInt64,
        ElementType::Float32,
        ElementType::Float64,
        ElementType::Bool,
    ];

    /// Width of one packed element in bytes
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 | ElementType::Bool => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }

    /// Short key stored in vector headers
    pub const fn key(self) -> &'static str {
        match self {
            ElementType::Int8 => "int8_t",
            ElementType::UInt8 => "uint8_t",
            ElementType::Int16 => "short_t",
            ElementType::UInt16 => "ushort_t",
            ElementType::Int32 => "int_t",
            ElementType::UInt32 => "uint_t",
            ElementType::Int64 => "long_t",
            ElementType::UInt64 => "ulong_t",
            ElementType::Float32 => "float_t",
            ElementType::Float64 => "double_t",
            ElementType::Bool => "bool_t",
        }
    }

    /// One-character dtype code stored in array headers
    pub const fn dtype_char(self) -> char {
        match self {
            ElementType::Int8 => 'b',
            ElementType::UInt8 => 'B',
            ElementType::Int16 => 'h',
            ElementType::UInt16 => 'H',
            ElementType::Int32 => 'i',
            ElementType::UInt32 => 'I',
            ElementType::Int64 => 'q',
            ElementType::UInt64 => 'Q',
            ElementType::Float32 => 'f',
            ElementType::Float64 => 'd',
            ElementType::Bool => '?',
        }
    }

    /// Look up an element type by its header key
    pub fn from_key(key: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.key() == key)
            .ok_or_else(|| ScratchpadError::UnknownType(format!("key {:?}", key)))
    }

    /// Look up an element type by its dtype character
    pub fn from_dtype_char(ch: char) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.dtype_char() == ch)
            .ok_or_else(|| ScratchpadError::UnknownType(format!("dtype character {:?}", ch)))
    }

    /// Pack `value` into the first `size()` bytes of `out`
    pub fn pack_into(self, value: Scalar, out: &mut [u8]) -> Result<()> {
        let width = self.size();
        if out.len() < width {
            return Err(ScratchpadError::Value(format!(
                "pack target of {} bytes is smaller than {} ({} bytes)",
                out.len(),
                self,
                width
            )));
        }
        let out = &mut out[..width];
        match self {
            ElementType::Int8 => out.copy_from_slice(&self.narrow::<i8>(value)?.to_le_bytes()),
            ElementType::UInt8 => out.copy_from_slice(&self.narrow::<u8>(value)?.to_le_bytes()),
            ElementType::Int16 => out.copy_from_slice(&self.narrow::<i16>(value)?.to_le_bytes()),
            ElementType::UInt16 => out.copy_from_slice(&self.narrow::<u16>(value)?.to_le_bytes()),
            ElementType::Int32 => out.copy_from_slice(&self.narrow::<i32>(value)?.to_le_bytes()),
            ElementType::UInt32 => out.copy_from_slice(&self.narrow::<u32>(value)?.to_le_bytes()),
            ElementType::Int64 => out.copy_from_slice(&self.narrow::<i64>(value)?.to_le_bytes()),
            ElementType::UInt64 => out.copy_from_slice(&self.narrow::<u64>(value)?.to_le_bytes()),
            ElementType::Float32 => {
                let wide = value.to_f64();
                if wide.is_finite() && wide.abs() > f32::MAX as f64 {
                    return Err(self.out_of_range(value));
                }
                out.copy_from_slice(&(wide as f32).to_le_bytes())
            }
            ElementType::Float64 => out.copy_from_slice(&value.to_f64().to_le_bytes()),
            ElementType::Bool => out[0] = value.is_truthy() as u8,
        }
        Ok(())
    }

    /// Pack `value` into a freshly allocated buffer of `size()` bytes
    pub fn pack(self, value: Scalar) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size()];
        self.pack_into(value, &mut out)?;
        Ok(out)
    }

    /// Unpack one element from the first `size()` bytes of `bytes`
    pub fn unpack(self, bytes: &[u8]) -> Result<Scalar> {
        let width = self.size();
        let raw = bytes.get(..width).ok_or_else(|| {
            ScratchpadError::Deserialization(format!(
                "{} needs {} bytes, got {}",
                self,
                width,
                bytes.len()
            ))
        })?;
        let mut wide = [0u8; 8];
        wide[..width].copy_from_slice(raw);
        let scalar = match self {
            ElementType::Int8 => Scalar::Int(i8::from_le_bytes([wide[0]]) as i64),
            ElementType::UInt8 => Scalar::UInt(wide[0] as u64),
            ElementType::Int16 => Scalar::Int(i16::from_le_bytes([wide[0], wide[1]]) as i64),
            ElementType::UInt16 => Scalar::UInt(u16::from_le_bytes([wide[0], wide[1]]) as u64),
            ElementType::Int32 => {
                Scalar::Int(i32::from_le_bytes([wide[0], wide[1], wide[2], wide[3]]) as i64)
            }
            ElementType::UInt32 => {
                Scalar::UInt(u32::from_le_bytes([wide[0], wide[1], wide[2], wide[3]]) as u64)
            }
            ElementType::Int64 => Scalar::Int(i64::from_le_bytes(wide)),
            ElementType::UInt64 => Scalar::UInt(u64::from_le_bytes(wide)),
            ElementType::Float32 => {
                Scalar::Float(f32::from_le_bytes([wide[0], wide[1], wide[2], wide[3]]) as f64)
            }
            ElementType::Float64 => Scalar::Float(f64::from_le_bytes(wide)),
            ElementType::Bool => Scalar::Bool(wide[0] != 0),
        };
        Ok(scalar)
    }

    fn narrow<T: TryFrom<i128>>(self, value: Scalar) -> Result<T> {
        let wide = match value {
            Scalar::Int(v) => v as i128,
            Scalar::UInt(v) => v as i128,
            Scalar::Bool(b) => b as i128,
            Scalar::Float(f) => {
                // only integral, finite floats convert; NaN and fractions do not
                if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 2f64.powi(64) {
                    return Err(self.out_of_range(value));
                }
                f as i128
            }
        };
        T::try_from(wide).map_err(|_| self.out_of_range(value))
    }

    fn out_of_range(self, value: Scalar) -> ScratchpadError {
        ScratchpadError::ValueOutOfRange {
            value: value.to_string(),
            element: self,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A dynamically typed element value
#[derive(Debug, Clone, Copy)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    /// Integer view, if the value is an integer that fits `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Scalar::Int(v) => Some(v),
            Scalar::UInt(v) => i64::try_from(v).ok(),
            Scalar::Bool(b) => Some(b as i64),
            Scalar::Float(_) => None,
        }
    }

    /// Lossy floating point view
    pub fn to_f64(&self) -> f64 {
        match *self {
            Scalar::Int(v) => v as f64,
            Scalar::UInt(v) => v as f64,
            Scalar::Float(v) => v,
            Scalar::Bool(b) => b as u8 as f64,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match *self {
            Scalar::Int(v) => v != 0,
            Scalar::UInt(v) => v != 0,
            Scalar::Float(v) => v != 0.0,
            Scalar::Bool(b) => b,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Scalar::Int(v) => Some(v as i128),
            Scalar::UInt(v) => Some(v as i128),
            _ => None,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Bool(_), _) | (_, Scalar::Bool(_)) => false,
            (Scalar::Float(a), Scalar::Float(b)) => a == b,
            (Scalar::Float(f), int) | (int, Scalar::Float(f)) => match int.as_i128() {
                Some(i) => f.fract() == 0.0 && f == i as f64 && f as i128 == i,
                None => false,
            },
            (a, b) => a.as_i128() == b.as_i128(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::UInt(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Bool(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! scalar_from {
    ($variant:ident as $wide:ty: $($t:ty),*) => {
        $(
            impl From<$t> for Scalar {
                fn from(value: $t) -> Self {
                    Scalar::$variant(value as $wide)
                }
            }
        )*
    };
}

scalar_from!(Int as i64: i8, i16, i32, i64, isize);
scalar_from!(UInt as u64: u8, u16, u32, u64, usize);
scalar_from!(Float as f64: f32, f64);

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Native Rust types that correspond to an [`ElementType`]
pub trait Element: Copy + Send + Sync + 'static {
    /// Registry entry for this type
    const TYPE: ElementType;

    fn to_scalar(self) -> Scalar;

    /// Convert with the same range rules as packing
    fn from_scalar(value: Scalar) -> Result<Self>;
}

/// Elements whose every bit pattern is valid, so buffers may be viewed in place
pub trait NumericElement: Element + bytemuck::Pod {}

macro_rules! numeric_element {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl Element for $t {
                const TYPE: ElementType = ElementType::$variant;

                fn to_scalar(self) -> Scalar {
                    Scalar::from(self)
                }

                fn from_scalar(value: Scalar) -> Result<Self> {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    Self::TYPE.pack_into(value, &mut raw)?;
                    Ok(<$t>::from_le_bytes(raw))
                }
            }

            impl NumericElement for $t {}
        )*
    };
}

numeric_element!(
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64
);

impl Element for bool {
    const TYPE: ElementType = ElementType::Bool;

    fn to_scalar(self) -> Scalar {
        Scalar::Bool(self)
    }

    fn from_scalar(value: Scalar) -> Result<Self> {
        Ok(value.is_truthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_registry_lookup() {
        for t in ElementType::ALL {
            assert_eq!(ElementType::from_key(t.key()).unwrap(), t);
            assert_eq!(ElementType::from_dtype_char(t.dtype_char()).unwrap(), t);
        }
        assert!(matches!(
            ElementType::from_key("complex_t"),
            Err(ScratchpadError::UnknownType(_))
        ));
        assert!(matches!(
            ElementType::from_dtype_char('z'),
            Err(ScratchpadError::UnknownType(_))
        ));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(ElementType::Int8.size(), 1);
        assert_eq!(ElementType::UInt16.size(), 2);
        assert_eq!(ElementType::Float32.size(), 4);
        assert_eq!(ElementType::Int64.size(), 8);
        assert_eq!(ElementType::Bool.size(), 1);
    }

    #[test]
    fn test_little_endian_packing() {
        assert_eq!(ElementType::Int32.pack(Scalar::Int(1)).unwrap(), vec![1, 0, 0, 0]);
        assert_eq!(ElementType::Int16.pack(Scalar::Int(-2)).unwrap(), vec![0xfe, 0xff]);
        assert_eq!(
            ElementType::Float32.pack(Scalar::Float(1.0)).unwrap(),
            1.0f32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_pack_overflow() {
        let err = ElementType::UInt8.pack(Scalar::Int(256)).unwrap_err();
        assert!(matches!(err, ScratchpadError::ValueOutOfRange { .. }));
        assert!(ElementType::UInt32.pack(Scalar::Int(-1)).is_err());
        assert!(ElementType::Int64.pack(Scalar::UInt(u64::MAX)).is_err());
        assert!(ElementType::Int32.pack(Scalar::Float(f64::NAN)).is_err());
        assert!(ElementType::Int32.pack(Scalar::Float(1.5)).is_err());
        assert!(ElementType::Float32.pack(Scalar::Float(1e300)).is_err());
    }

    #[test]
    fn test_pack_conversions() {
        assert_eq!(
            ElementType::Int16.unpack(&ElementType::Int16.pack(Scalar::Float(12.0)).unwrap()).unwrap(),
            Scalar::Int(12)
        );
        assert_eq!(
            ElementType::Float64.unpack(&ElementType::Float64.pack(Scalar::Int(3)).unwrap()).unwrap(),
            Scalar::Float(3.0)
        );
        assert_eq!(ElementType::Bool.pack(Scalar::Int(7)).unwrap(), vec![1]);
        assert_eq!(ElementType::Bool.unpack(&[2]).unwrap(), Scalar::Bool(true));
        assert!(ElementType::Float32.pack(Scalar::Float(f64::INFINITY)).is_ok());
    }

    #[test]
    fn test_unpack_short_input() {
        assert!(matches!(
            ElementType::Int64.unpack(&[0, 1, 2]),
            Err(ScratchpadError::Deserialization(_))
        ));
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Scalar::Int(5), Scalar::UInt(5));
        assert_eq!(Scalar::Float(5.0), Scalar::Int(5));
        assert_ne!(Scalar::Float(5.5), Scalar::Int(5));
        assert_ne!(Scalar::Int(-1), Scalar::UInt(u64::MAX));
        assert_ne!(Scalar::Bool(true), Scalar::Int(1));
    }

    #[test]
    fn test_native_elements() {
        assert_eq!(i16::from_scalar(Scalar::Int(-300)).unwrap(), -300);
        assert!(u8::from_scalar(Scalar::Int(-1)).is_err());
        assert_eq!(f32::from_scalar(Scalar::Int(2)).unwrap(), 2.0);
        assert!(bool::from_scalar(Scalar::UInt(1)).unwrap());
        assert_eq!(<u64 as Element>::TYPE, ElementType::UInt64);
    }

    proptest! {
        #[test]
        fn int32_round_trip(v in any::<i32>()) {
            let bytes = ElementType::Int32.pack(Scalar::from(v)).unwrap();
            prop_assert_eq!(bytes.clone(), v.to_le_bytes().to_vec());
            prop_assert_eq!(ElementType::Int32.unpack(&bytes).unwrap(), Scalar::from(v));
        }

        #[test]
        fn float64_bits_survive(v in any::<f64>().prop_filter("not nan", |f| !f.is_nan())) {
            let bytes = ElementType::Float64.pack(Scalar::Float(v)).unwrap();
            prop_assert_eq!(ElementType::Float64.unpack(&bytes).unwrap(), Scalar::Float(v));
        }

        #[test]
        fn narrowing_matches_try_from(v in any::<i64>()) {
            let packed = ElementType::Int16.pack(Scalar::Int(v));
            prop_assert_eq!(packed.is_ok(), i16::try_from(v).is_ok());
        }
    }
}
