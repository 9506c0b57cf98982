//! Typed column arrays passed between encoding steps

use crate::error::{Result, VolsegError};
use crate::types::DataType;
use num_traits::NumCast;

/// A column's values in one of the BinaryCIF array types.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! with_values {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::Uint8($v) => $body,
            ColumnData::Uint16($v) => $body,
            ColumnData::Uint32($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
        }
    };
}

fn checked_cast<S, T>(values: &[S], target: DataType) -> Result<Vec<T>>
where
    S: NumCast + Copy + std::fmt::Display,
    T: NumCast,
{
    values
        .iter()
        .map(|&v| {
            T::from(v).ok_or_else(|| {
                VolsegError::EncoderRange(format!("value {v} cannot be represented as {target}"))
            })
        })
        .collect()
}

impl ColumnData {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnData::Int8(_) => DataType::Int8,
            ColumnData::Int16(_) => DataType::Int16,
            ColumnData::Int32(_) => DataType::Int32,
            ColumnData::Uint8(_) => DataType::Uint8,
            ColumnData::Uint16(_) => DataType::Uint16,
            ColumnData::Uint32(_) => DataType::Uint32,
            ColumnData::Float32(_) => DataType::Float32,
            ColumnData::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_values!(self, v => v.iter().map(|&x| x as f64).collect())
    }

    /// Values of an integer column widened to `i64`
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self {
            ColumnData::Float32(_) | ColumnData::Float64(_) => Err(VolsegError::EncoderRange(
                format!("{} column used where integers are required", self.data_type()),
            )),
            other => Ok(with_values!(other, v => v.iter().map(|&x| x as i64).collect())),
        }
    }

    /// Convert to `target`, failing when any value does not fit.
    ///
    /// Float to integer conversion is only allowed for integral values.
    pub fn cast(&self, target: DataType) -> Result<ColumnData> {
        if self.data_type().is_float() && target.is_integer() {
            if let Some(v) = self.to_f64_vec().into_iter().find(|v| v.fract() != 0.0) {
                return Err(VolsegError::EncoderRange(format!(
                    "non-integral value {v} cannot be represented as {target}"
                )));
            }
        }
        with_values!(self, v => Ok(match target {
            DataType::Int8 => ColumnData::Int8(checked_cast(v, target)?),
            DataType::Int16 => ColumnData::Int16(checked_cast(v, target)?),
            DataType::Int32 => ColumnData::Int32(checked_cast(v, target)?),
            DataType::Uint8 => ColumnData::Uint8(checked_cast(v, target)?),
            DataType::Uint16 => ColumnData::Uint16(checked_cast(v, target)?),
            DataType::Uint32 => ColumnData::Uint32(checked_cast(v, target)?),
            DataType::Float32 => ColumnData::Float32(checked_cast(v, target)?),
            DataType::Float64 => ColumnData::Float64(checked_cast(v, target)?),
        }))
    }

    /// Integer column of type `target` from `i64` values.
    pub fn from_i64(values: &[i64], target: DataType) -> Result<ColumnData> {
        Ok(match target {
            DataType::Int8 => ColumnData::Int8(checked_cast(values, target)?),
            DataType::Int16 => ColumnData::Int16(checked_cast(values, target)?),
            DataType::Int32 => ColumnData::Int32(checked_cast(values, target)?),
            DataType::Uint8 => ColumnData::Uint8(checked_cast(values, target)?),
            DataType::Uint16 => ColumnData::Uint16(checked_cast(values, target)?),
            DataType::Uint32 => ColumnData::Uint32(checked_cast(values, target)?),
            DataType::Float32 | DataType::Float64 => {
                return Err(VolsegError::EncoderRange(format!(
                    "{target} is not an integer type"
                )))
            }
        })
    }

    /// Little-endian bytes of the values
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.data_type().size_in_bytes());
        with_values!(self, v => {
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        });
        out
    }

    /// Parse little-endian bytes as an array of `data_type`.
    pub fn from_le_bytes(bytes: &[u8], data_type: DataType) -> Result<ColumnData> {
        let size = data_type.size_in_bytes();
        if bytes.len() % size != 0 {
            return Err(VolsegError::Decode(format!(
                "{} bytes is not a whole number of {} values",
                bytes.len(),
                data_type
            )));
        }

        macro_rules! parse {
            ($variant:ident, $ty:ty) => {
                ColumnData::$variant(
                    bytes
                        .chunks_exact(size)
                        .map(|c| {
                            let mut buf = [0u8; std::mem::size_of::<$ty>()];
                            buf.copy_from_slice(c);
                            <$ty>::from_le_bytes(buf)
                        })
                        .collect(),
                )
            };
        }

        Ok(match data_type {
            DataType::Int8 => parse!(Int8, i8),
            DataType::Int16 => parse!(Int16, i16),
            DataType::Int32 => parse!(Int32, i32),
            DataType::Uint8 => parse!(Uint8, u8),
            DataType::Uint16 => parse!(Uint16, u16),
            DataType::Uint32 => parse!(Uint32, u32),
            DataType::Float32 => parse!(Float32, f32),
            DataType::Float64 => parse!(Float64, f64),
        })
    }
}

macro_rules! impl_from_vec {
    ($($variant:ident => $ty:ty),*) => {
        $(
            impl From<Vec<$ty>> for ColumnData {
                fn from(values: Vec<$ty>) -> Self {
                    ColumnData::$variant(values)
                }
            }
        )*
    };
}

impl_from_vec!(
    Int8 => i8,
    Int16 => i16,
    Int32 => i32,
    Uint8 => u8,
    Uint16 => u16,
    Uint32 => u32,
    Float32 => f32,
    Float64 => f64
);
