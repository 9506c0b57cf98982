//! Core scalar types shared by grids, quantization and the wire encoder

use crate::error::VolsegError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar types a grid or an encoded column may hold.
///
/// The discriminants are the BinaryCIF type codes, so the same value is
/// written into `ByteArray` / `srcType` encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DataType {
    /// Signed 8-bit integer
    Int8 = 1,
    /// Signed 16-bit integer
    Int16 = 2,
    /// Signed 32-bit integer
    Int32 = 3,
    /// Unsigned 8-bit integer
    Uint8 = 4,
    /// Unsigned 16-bit integer
    Uint16 = 5,
    /// Unsigned 32-bit integer
    Uint32 = 6,
    /// 32-bit floating point
    Float32 = 32,
    /// 64-bit floating point
    Float64 = 33,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, DataType::Uint8 | DataType::Uint16 | DataType::Uint32)
    }

    /// Inclusive range of values representable by an integer type.
    ///
    /// Float types report their finite range.
    pub fn value_bounds(&self) -> (f64, f64) {
        match self {
            DataType::Int8 => (i8::MIN as f64, i8::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::Uint8 => (0.0, u8::MAX as f64),
            DataType::Uint16 => (0.0, u16::MAX as f64),
            DataType::Uint32 => (0.0, u32::MAX as f64),
            DataType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            DataType::Float64 => (f64::MIN, f64::MAX),
        }
    }

    /// Get the type from its BinaryCIF code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DataType::Int8),
            2 => Some(DataType::Int16),
            3 => Some(DataType::Int32),
            4 => Some(DataType::Uint8),
            5 => Some(DataType::Uint16),
            6 => Some(DataType::Uint32),
            32 => Some(DataType::Float32),
            33 => Some(DataType::Float64),
            _ => None,
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for DataType {
    type Error = VolsegError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        DataType::from_code(value)
            .ok_or_else(|| VolsegError::InvalidDataType(format!("unknown type code {value}")))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Point or vector in world space (Angstrom), ordered x, y, z.
pub type Vec3 = [f64; 3];

/// Axis-aligned box in world space.
///
/// Corners are normalized on construction and on deserialization, so
/// `min <= max` holds on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "WorldBoxCorners")]
pub struct WorldBox {
    min: Vec3,
    max: Vec3,
}

#[derive(Deserialize)]
struct WorldBoxCorners {
    min: Vec3,
    max: Vec3,
}

impl From<WorldBoxCorners> for WorldBox {
    fn from(corners: WorldBoxCorners) -> Self {
        WorldBox::new(corners.min, corners.max)
    }
}

impl WorldBox {
    /// Create a box, normalizing the corners so `min <= max` on every axis.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = a[axis].min(b[axis]);
            max[axis] = a[axis].max(b[axis]);
        }
        Self { min, max }
    }

    pub fn min(&self) -> Vec3 {
        self.min
    }

    pub fn max(&self) -> Vec3 {
        self.max
    }
}
