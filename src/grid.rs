//! Dense 3-D grids held at one pyramid level
//!
//! Grids are indexed `[x, y, z]`. A [`GridData`] carries one of the scalar
//! types a level may be stored in; continuous volumes are usually
//! `Float32` (or a quantized `Uint8`/`Uint16`), segmentation lattices are
//! `Uint32` category ids.

use crate::error::{Result, VolsegError};
use crate::metadata::DescriptiveStatistics;
use crate::slice_box::SliceBox;
use crate::types::DataType;
use ndarray::{s, Array3};
use num_traits::{Float, NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Grid shape, `[nx, ny, nz]`.
pub type GridShape = [usize; 3];

/// A typed dense grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridData {
    Int8(Array3<i8>),
    Int16(Array3<i16>),
    Uint8(Array3<u8>),
    Uint16(Array3<u16>),
    Uint32(Array3<u32>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

macro_rules! with_array {
    ($grid:expr, $arr:ident => $body:expr) => {
        match $grid {
            GridData::Int8($arr) => $body,
            GridData::Int16($arr) => $body,
            GridData::Uint8($arr) => $body,
            GridData::Uint16($arr) => $body,
            GridData::Uint32($arr) => $body,
            GridData::Float32($arr) => $body,
            GridData::Float64($arr) => $body,
        }
    };
}

impl GridData {
    pub fn data_type(&self) -> DataType {
        match self {
            GridData::Int8(_) => DataType::Int8,
            GridData::Int16(_) => DataType::Int16,
            GridData::Uint8(_) => DataType::Uint8,
            GridData::Uint16(_) => DataType::Uint16,
            GridData::Uint32(_) => DataType::Uint32,
            GridData::Float32(_) => DataType::Float32,
            GridData::Float64(_) => DataType::Float64,
        }
    }

    pub fn shape(&self) -> GridShape {
        with_array!(self, arr => shape_of(arr))
    }

    /// Number of voxels
    pub fn len(&self) -> usize {
        with_array!(self, arr => arr.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncompressed size in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.data_type().size_in_bytes()
    }

    /// Copy of the grid widened to `f32`
    pub fn to_f32(&self) -> Array3<f32> {
        with_array!(self, arr => arr.mapv(|v| v as f32))
    }

    /// Copy of the grid widened to `f64`
    pub fn to_f64(&self) -> Array3<f64> {
        with_array!(self, arr => arr.mapv(|v| v as f64))
    }

    /// Copy of the grid in the working float type `F`
    pub fn to_float<F: Float>(&self) -> Array3<F> {
        with_array!(self, arr => arr.mapv(|v| F::from(v).unwrap_or_else(F::nan)))
    }

    /// Category ids of a segmentation lattice.
    pub fn as_categories(&self) -> Result<&Array3<u32>> {
        match self {
            GridData::Uint32(arr) => Ok(arr),
            other => Err(VolsegError::InvalidDataType(format!(
                "segmentation lattice must hold Uint32 category ids, got {}",
                other.data_type()
            ))),
        }
    }

    /// Cut the inclusive voxel range of `slice_box` out of the grid.
    pub fn cut(&self, slice_box: &SliceBox) -> Result<GridData> {
        let shape = self.shape();
        let (bl, tr) = (slice_box.bottom_left, slice_box.top_right);
        for axis in 0..3 {
            if bl[axis] > tr[axis] || tr[axis] >= shape[axis] {
                return Err(VolsegError::InvalidDimensions(format!(
                    "slice box {:?}..={:?} does not fit grid {:?}",
                    bl, tr, shape
                )));
            }
        }
        let cut = with_array!(self, arr => {
            let view = arr.slice(s![bl[0]..=tr[0], bl[1]..=tr[1], bl[2]..=tr[2]]);
            GridData::from(view.to_owned())
        });
        Ok(cut)
    }

    /// Cast a float grid into the storage type of a level.
    ///
    /// Integer targets are rounded; values the target cannot hold are an error.
    pub fn from_float_grid<F>(grid: &Array3<F>, target: DataType) -> Result<GridData>
    where
        F: ToPrimitive + Copy,
    {
        Ok(match target {
            DataType::Int8 => GridData::Int8(cast_array(grid, target)?),
            DataType::Int16 => GridData::Int16(cast_array(grid, target)?),
            DataType::Uint8 => GridData::Uint8(cast_array(grid, target)?),
            DataType::Uint16 => GridData::Uint16(cast_array(grid, target)?),
            DataType::Uint32 => GridData::Uint32(cast_array(grid, target)?),
            DataType::Float32 => GridData::Float32(cast_array(grid, target)?),
            DataType::Float64 => GridData::Float64(cast_array(grid, target)?),
            DataType::Int32 => {
                return Err(VolsegError::InvalidDataType(
                    "Int32 is not a grid storage type".to_string(),
                ))
            }
        })
    }

    /// Mean, standard deviation, min and max over all voxels.
    pub fn statistics(&self) -> DescriptiveStatistics {
        statistics_of(&self.to_f64())
    }
}

macro_rules! impl_from_array {
    ($($variant:ident => $ty:ty),*) => {
        $(
            impl From<Array3<$ty>> for GridData {
                fn from(arr: Array3<$ty>) -> Self {
                    GridData::$variant(arr)
                }
            }
        )*
    };
}

impl_from_array!(
    Int8 => i8,
    Int16 => i16,
    Uint8 => u8,
    Uint16 => u16,
    Uint32 => u32,
    Float32 => f32,
    Float64 => f64
);

pub(crate) fn shape_of<T>(arr: &Array3<T>) -> GridShape {
    let dim = arr.dim();
    [dim.0, dim.1, dim.2]
}

fn cast_array<F, T>(grid: &Array3<F>, target: DataType) -> Result<Array3<T>>
where
    F: ToPrimitive + Copy,
    T: NumCast + Copy,
{
    let round = target.is_integer();
    let mut out = Vec::with_capacity(grid.len());
    for &v in grid.iter() {
        let v = v.to_f64().unwrap_or(f64::NAN);
        let v = if round { v.round() } else { v };
        let cast = T::from(v).ok_or_else(|| {
            VolsegError::InvalidDataType(format!("value {v} does not fit into {target}"))
        })?;
        out.push(cast);
    }
    Ok(Array3::from_shape_vec(grid.dim(), out)?)
}

/// Descriptive statistics of a float grid.
pub fn statistics_of(grid: &Array3<f64>) -> DescriptiveStatistics {
    if grid.is_empty() {
        return DescriptiveStatistics::default();
    }
    let n = grid.len() as f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for &v in grid.iter() {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    let mean = sum / n;
    let variance = grid.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
    DescriptiveStatistics {
        mean,
        std: variance.sqrt(),
        min,
        max,
    }
}
