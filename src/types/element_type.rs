//! Element types of stored variables.

use crate::error::DmrppError;
use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::Display;

/// A numeric scalar type with a fixed-width byte representation.
trait Scalar: FromStr + std::fmt::Display + Copy {
    fn to_ordered_bytes(self, order: ByteOrder) -> Vec<u8>;
    fn from_ordered_bytes(bytes: &[u8], order: ByteOrder) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                fn to_ordered_bytes(self, order: ByteOrder) -> Vec<u8> {
                    match order {
                        ByteOrder::Big => self.to_be_bytes().to_vec(),
                        ByteOrder::Little => self.to_le_bytes().to_vec(),
                    }
                }

                fn from_ordered_bytes(bytes: &[u8], order: ByteOrder) -> Option<Self> {
                    let array: [u8; std::mem::size_of::<$t>()] = bytes.try_into().ok()?;
                    Some(match order {
                        ByteOrder::Big => <$t>::from_be_bytes(array),
                        ByteOrder::Little => <$t>::from_le_bytes(array),
                    })
                }
            }
        )*
    };
}

impl_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Dispatch a generic scalar function on a numeric [ElementType].
macro_rules! with_scalar {
    ($element_type:expr, $func:ident ( $($arg:expr),* ), $otherwise:expr) => {
        match $element_type {
            ElementType::Int8 => $func::<i8>($($arg),*),
            ElementType::Uint8 => $func::<u8>($($arg),*),
            ElementType::Int16 => $func::<i16>($($arg),*),
            ElementType::Uint16 => $func::<u16>($($arg),*),
            ElementType::Int32 => $func::<i32>($($arg),*),
            ElementType::Uint32 => $func::<u32>($($arg),*),
            ElementType::Int64 => $func::<i64>($($arg),*),
            ElementType::Uint64 => $func::<u64>($($arg),*),
            ElementType::Float32 => $func::<f32>($($arg),*),
            ElementType::Float64 => $func::<f64>($($arg),*),
            ElementType::String { .. } | ElementType::Opaque { .. } => $otherwise,
        }
    };
}

/// Element type of a variable.
///
/// A closed set of primitive kinds. Fixed-width strings and opaque data carry their width.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ElementType {
    /// [i8]
    Int8,
    /// [u8]
    Uint8,
    /// [i16]
    Int16,
    /// [u16]
    Uint16,
    /// [i32]
    Int32,
    /// [u32]
    Uint32,
    /// [i64]
    Int64,
    /// [u64]
    Uint64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
    /// Fixed-width string of `size` bytes, NUL padded
    String { size: usize },
    /// Uninterpreted data of `size` bytes
    Opaque { size: usize },
}

impl ElementType {
    /// Returns the size of an element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
            Self::String { size } | Self::Opaque { size } => size,
        }
    }

    /// Returns whether this is an integer or floating point type.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::String { .. } | Self::Opaque { .. })
    }

    /// Returns whether elements of this type are affected by byte order.
    pub fn is_byte_order_sensitive(self) -> bool {
        self.is_numeric() && self.size_of() > 1
    }

    /// Render a fill value given as text in canonical form.
    ///
    /// Canonical form is the value's Rust [Display] rendering, which parses back to the same
    /// value.
    ///
    /// # Arguments
    ///
    /// * `value`: Fill value as text
    pub fn canonical_fill(self, value: &str) -> Result<String, DmrppError> {
        match self {
            Self::String { .. } => Ok(value.trim_end_matches('\0').to_string()),
            Self::Opaque { .. } => {
                self.encode_scalar(value, ByteOrder::Little)?;
                Ok(value.to_ascii_lowercase())
            }
            _ => with_scalar!(self, canonical_text(value), Err(()))
                .map_err(|()| self.invalid_fill(value)),
        }
    }

    /// Render a fill value given as native bytes in canonical form.
    ///
    /// # Arguments
    ///
    /// * `bytes`: One element in the source's representation
    /// * `order`: Byte order of `bytes`, if the type has one
    pub fn canonical_from_native(
        self,
        bytes: &[u8],
        order: Option<ByteOrder>,
    ) -> Result<String, DmrppError> {
        let order = order.unwrap_or(ByteOrder::Little);
        match self {
            Self::String { .. } => Ok(String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .to_string()),
            Self::Opaque { size } if bytes.len() == size => Ok(hex::encode(bytes)),
            Self::Opaque { .. } => Err(self.invalid_fill(&hex::encode(bytes))),
            _ => with_scalar!(self, canonical_native(bytes, order), Err(()))
                .map_err(|()| self.invalid_fill(&hex::encode(bytes))),
        }
    }

    /// Encode a canonical scalar as one element of bytes in the requested order.
    ///
    /// # Arguments
    ///
    /// * `canonical`: Scalar in canonical text form
    /// * `order`: Byte order of the returned element
    pub fn encode_scalar(self, canonical: &str, order: ByteOrder) -> Result<Vec<u8>, DmrppError> {
        match self {
            Self::String { size } => {
                let mut bytes = canonical.as_bytes().to_vec();
                if bytes.len() > size {
                    return Err(self.invalid_fill(canonical));
                }
                bytes.resize(size, 0);
                Ok(bytes)
            }
            Self::Opaque { size } => match hex::decode(canonical) {
                Ok(bytes) if bytes.len() == size => Ok(bytes),
                _ => Err(self.invalid_fill(canonical)),
            },
            _ => with_scalar!(self, encode_text(canonical, order), Err(()))
                .map_err(|()| self.invalid_fill(canonical)),
        }
    }

    fn invalid_fill(self, value: &str) -> DmrppError {
        DmrppError::InvalidFillValue {
            value: value.to_string(),
            type_name: self.to_string(),
        }
    }
}

fn canonical_text<T: Scalar>(value: &str) -> Result<String, ()> {
    let parsed: T = value.trim().parse().map_err(|_| ())?;
    Ok(parsed.to_string())
}

fn canonical_native<T: Scalar>(bytes: &[u8], order: ByteOrder) -> Result<String, ()> {
    T::from_ordered_bytes(bytes, order)
        .map(|value| value.to_string())
        .ok_or(())
}

fn encode_text<T: Scalar>(value: &str, order: ByteOrder) -> Result<Vec<u8>, ()> {
    let parsed: T = value.trim().parse().map_err(|_| ())?;
    Ok(parsed.to_ordered_bytes(order))
}
