//! Log-domain quantization of continuous volumes
//!
//! Samples are shifted to be non-negative, mapped through `ln(1 + x)` and
//! spread linearly over the integer range of the target type:
//!
//! ```text
//! offset = max(-min(grid), 0)
//! l      = ln(x + offset + 1)
//! delta  = (l_max - l_min) / (2^bits - 2)
//! q      = round((l - l_min) / delta)
//! x'     = exp(q * delta + l_min) - 1 - offset
//! ```
//!
//! The log mapping spends more integer steps on the low-density range, where
//! most of a map's samples live.

use crate::error::{Result, VolsegError};
use crate::grid::GridData;
use crate::types::DataType;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Integer type a quantized level is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationDtype {
    U8,
    U16,
}

impl QuantizationDtype {
    pub fn bits(&self) -> u32 {
        match self {
            QuantizationDtype::U8 => 8,
            QuantizationDtype::U16 => 16,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            QuantizationDtype::U8 => DataType::Uint8,
            QuantizationDtype::U16 => DataType::Uint16,
        }
    }

    /// Number of quantization steps, `2^bits - 1`.
    pub fn num_steps(&self) -> u32 {
        (1u32 << self.bits()) - 1
    }
}

/// Parameters needed to decode a quantized array; stored next to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationDescriptor {
    /// Log-domain minimum
    pub min: f64,
    /// Log-domain maximum
    pub max: f64,
    pub num_steps: u32,
    pub source_dtype: DataType,
    pub offset_to_remove_negatives: f64,
}

impl QuantizationDescriptor {
    /// Width of one quantization step in the log domain.
    pub fn delta(&self) -> f64 {
        if self.num_steps < 2 {
            return 0.0;
        }
        (self.max - self.min) / (self.num_steps - 1) as f64
    }

    /// Decode a single quantized value.
    pub fn decode(&self, q: f64) -> f64 {
        (q * self.delta() + self.min).exp_m1() - self.offset_to_remove_negatives
    }
}

/// Whether storing `source` as `target` saves space at all.
pub fn should_quantize(source: DataType, target: QuantizationDtype) -> bool {
    target.data_type().size_in_bytes() < source.size_in_bytes()
}

/// Quantize a grid into `target`.
pub fn quantize(
    grid: &GridData,
    target: QuantizationDtype,
) -> Result<(GridData, QuantizationDescriptor)> {
    if grid.is_empty() {
        return Err(VolsegError::InvalidDimensions(
            "cannot quantize an empty grid".to_string(),
        ));
    }
    let values = grid.to_f64();
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(VolsegError::InvalidDataType(format!(
            "cannot quantize non-finite sample {bad}"
        )));
    }

    let src_min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let offset = if src_min < 0.0 { -src_min } else { 0.0 };

    // x + offset is >= 0 up to rounding; clamp so ln never sees a value below 1.
    let logs = values.mapv(|x| (x + offset).max(0.0).ln_1p());
    let log_min = logs.iter().copied().fold(f64::INFINITY, f64::min);
    let log_max = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let descriptor = QuantizationDescriptor {
        min: log_min,
        max: log_max,
        num_steps: target.num_steps(),
        source_dtype: grid.data_type(),
        offset_to_remove_negatives: offset,
    };
    let delta = descriptor.delta();
    let upper = target.num_steps() as f64;

    let steps = logs.mapv(|l| {
        if delta > 0.0 {
            ((l - log_min) / delta).round().clamp(0.0, upper)
        } else {
            0.0
        }
    });
    let quantized = match target {
        QuantizationDtype::U8 => GridData::Uint8(steps.mapv(|q| q as u8)),
        QuantizationDtype::U16 => GridData::Uint16(steps.mapv(|q| q as u16)),
    };
    Ok((quantized, descriptor))
}

/// Invert [`quantize`].
pub fn dequantize(grid: &GridData, descriptor: &QuantizationDescriptor) -> Result<Array3<f32>> {
    match grid {
        GridData::Uint8(_) | GridData::Uint16(_) => {
            Ok(grid.to_f64().mapv(|q| descriptor.decode(q) as f32))
        }
        other => Err(VolsegError::InvalidDataType(format!(
            "quantized grids are Uint8 or Uint16, got {}",
            other.data_type()
        ))),
    }
}
