//! Individual column encodings
//!
//! An [`EncodingStep`] is what a caller asks for; applying it yields the
//! transformed column and the [`Encoding`] record (with every parameter the
//! inverse needs) written into the column header. Decoding walks the records
//! in reverse.

use super::data::ColumnData;
use crate::error::{Result, VolsegError};
use crate::types::DataType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Applied encoding as recorded in a BinaryCIF column header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Encoding {
    /// Little-endian array of `type`; always the last encoding applied
    ByteArray {
        #[serde(rename = "type")]
        data_type: DataType,
    },
    #[serde(rename_all = "camelCase")]
    FixedPoint { factor: f64, src_type: DataType },
    #[serde(rename_all = "camelCase")]
    IntervalQuantization {
        min: f64,
        max: f64,
        num_steps: u32,
        src_type: DataType,
    },
    #[serde(rename_all = "camelCase")]
    RunLength { src_type: DataType, src_size: usize },
    #[serde(rename_all = "camelCase")]
    Delta { origin: i64, src_type: DataType },
    #[serde(rename_all = "camelCase")]
    IntegerPacking {
        byte_count: u8,
        is_unsigned: bool,
        src_size: usize,
    },
    /// Unique strings concatenated into `string_data`; the column data holds
    /// indices into the unique list.
    #[serde(rename_all = "camelCase")]
    StringArray {
        data_encoding: Vec<Encoding>,
        string_data: String,
        offset_encoding: Vec<Encoding>,
        offsets: Bytes,
    },
}

/// Encoded payload of a column (or mask): applied encodings plus bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedData {
    pub encoding: Vec<Encoding>,
    pub data: Bytes,
}

/// A transformation to apply to a column before the terminal byte array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodingStep {
    /// Floats to `Int32` as `round(value * factor)`
    FixedPoint { factor: f64 },
    /// Floats to `num_steps` evenly spaced levels between `min` and `max`
    IntervalQuantization { min: f64, max: f64, num_steps: u32 },
    /// Integers to `Int32` `[value, count]` pairs
    RunLength,
    /// Integers to `Int32` successive differences
    Delta,
    /// `Int32` to 8 or 16-bit values with overflow sentinels
    IntegerPacking,
}

impl EncodingStep {
    /// Apply the step.
    ///
    /// Returns `None` as the record when the step left the data untouched,
    /// which only happens for integer packing that would not save space.
    pub fn encode(&self, data: ColumnData) -> Result<(ColumnData, Option<Encoding>)> {
        match *self {
            EncodingStep::FixedPoint { factor } => fixed_point(data, factor),
            EncodingStep::IntervalQuantization {
                min,
                max,
                num_steps,
            } => interval_quantization(data, min, max, num_steps),
            EncodingStep::RunLength => run_length(data),
            EncodingStep::Delta => delta(data),
            EncodingStep::IntegerPacking => integer_packing(data),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncodingStep::FixedPoint { .. } => "FixedPoint",
            EncodingStep::IntervalQuantization { .. } => "IntervalQuantization",
            EncodingStep::RunLength => "RunLength",
            EncodingStep::Delta => "Delta",
            EncodingStep::IntegerPacking => "IntegerPacking",
        }
    }
}

fn require_float(data: &ColumnData, step: &str) -> Result<()> {
    if data.data_type().is_float() {
        Ok(())
    } else {
        Err(VolsegError::EncoderRange(format!(
            "{step} expects a float column, got {}",
            data.data_type()
        )))
    }
}

fn to_i32(values: &[i64], step: &str) -> Result<Vec<i32>> {
    values
        .iter()
        .map(|&v| {
            i32::try_from(v).map_err(|_| {
                VolsegError::EncoderRange(format!("{step} output {v} does not fit in Int32"))
            })
        })
        .collect()
}

fn fixed_point(data: ColumnData, factor: f64) -> Result<(ColumnData, Option<Encoding>)> {
    require_float(&data, "FixedPoint")?;
    if !(factor.is_finite() && factor > 0.0) {
        return Err(VolsegError::EncoderRange(format!(
            "FixedPoint factor must be positive, got {factor}"
        )));
    }
    let (lo, hi) = DataType::Int32.value_bounds();
    let out = data
        .to_f64_vec()
        .into_iter()
        .map(|v| {
            let scaled = (v * factor).round();
            if scaled.is_finite() && scaled >= lo && scaled <= hi {
                Ok(scaled as i32)
            } else {
                Err(VolsegError::EncoderRange(format!(
                    "FixedPoint value {v} with factor {factor} does not fit in Int32"
                )))
            }
        })
        .collect::<Result<Vec<i32>>>()?;
    let record = Encoding::FixedPoint {
        factor,
        src_type: data.data_type(),
    };
    Ok((ColumnData::Int32(out), Some(record)))
}

/// Storage type holding `num_steps` quantization levels
fn quantized_type(num_steps: u32) -> DataType {
    if num_steps <= 1 << 8 {
        DataType::Uint8
    } else if num_steps <= 1 << 16 {
        DataType::Uint16
    } else {
        DataType::Int32
    }
}

fn interval_quantization(
    data: ColumnData,
    min: f64,
    max: f64,
    num_steps: u32,
) -> Result<(ColumnData, Option<Encoding>)> {
    require_float(&data, "IntervalQuantization")?;
    if num_steps < 2 || num_steps as i64 > i32::MAX as i64 {
        return Err(VolsegError::EncoderRange(format!(
            "IntervalQuantization needs between 2 and {} steps, got {num_steps}",
            i32::MAX
        )));
    }
    if !(min.is_finite() && max.is_finite() && min <= max) {
        return Err(VolsegError::EncoderRange(format!(
            "IntervalQuantization range [{min}, {max}] is invalid"
        )));
    }

    let top = (num_steps - 1) as i64;
    let delta = (max - min) / top as f64;
    let levels = data
        .to_f64_vec()
        .into_iter()
        .map(|v| {
            if v.is_nan() {
                Err(VolsegError::EncoderRange(
                    "IntervalQuantization cannot encode NaN".to_string(),
                ))
            } else if v <= min || delta == 0.0 {
                Ok(0)
            } else if v >= max {
                Ok(top)
            } else {
                Ok((((v - min) / delta).round() as i64).min(top))
            }
        })
        .collect::<Result<Vec<i64>>>()?;

    let out = ColumnData::from_i64(&levels, quantized_type(num_steps))?;
    let record = Encoding::IntervalQuantization {
        min,
        max,
        num_steps,
        src_type: data.data_type(),
    };
    Ok((out, Some(record)))
}

fn run_length(data: ColumnData) -> Result<(ColumnData, Option<Encoding>)> {
    let values = data.to_i64_vec()?;
    let mut pairs: Vec<i64> = Vec::new();
    let mut iter = values.iter().copied();
    if let Some(first) = iter.next() {
        let mut current = first;
        let mut count = 1i64;
        for v in iter {
            if v == current {
                count += 1;
            } else {
                pairs.push(current);
                pairs.push(count);
                current = v;
                count = 1;
            }
        }
        pairs.push(current);
        pairs.push(count);
    }
    let record = Encoding::RunLength {
        src_type: data.data_type(),
        src_size: values.len(),
    };
    Ok((ColumnData::Int32(to_i32(&pairs, "RunLength")?), Some(record)))
}

fn delta(data: ColumnData) -> Result<(ColumnData, Option<Encoding>)> {
    let values = data.to_i64_vec()?;
    let origin = values.first().copied().unwrap_or(0);
    let mut previous = origin;
    let diffs: Vec<i64> = values
        .iter()
        .map(|&v| {
            let d = v - previous;
            previous = v;
            d
        })
        .collect();
    let record = Encoding::Delta {
        origin,
        src_type: data.data_type(),
    };
    Ok((ColumnData::Int32(to_i32(&diffs, "Delta")?), Some(record)))
}

/// Number of packed elements needed for `values` with sentinel `upper`.
fn packing_size(values: &[i64], upper: i64) -> usize {
    let lower = -upper - 1;
    values
        .iter()
        .map(|&v| {
            let (limit, v) = if v >= 0 { (upper, v) } else { (lower, v) };
            if v == 0 {
                1
            } else {
                // both operands share a sign, so the quotient is positive
                let whole = (v / limit) as usize;
                whole + 1
            }
        })
        .sum()
}

fn integer_packing(data: ColumnData) -> Result<(ColumnData, Option<Encoding>)> {
    let values = data.to_i64_vec()?;
    let values: Vec<i64> = to_i32(&values, "IntegerPacking")?
        .into_iter()
        .map(i64::from)
        .collect();
    let is_unsigned = values.iter().all(|&v| v >= 0);
    let (upper8, upper16) = if is_unsigned {
        (u8::MAX as i64, u16::MAX as i64)
    } else {
        (i8::MAX as i64, i16::MAX as i64)
    };
    let size8 = packing_size(&values, upper8);
    let size16 = packing_size(&values, upper16);

    let (byte_count, upper) = if values.len() * 4 < size16 * 2 {
        return Ok((ColumnData::Int32(values.iter().map(|&v| v as i32).collect()), None));
    } else if size16 * 2 < size8 {
        (2u8, upper16)
    } else {
        (1u8, upper8)
    };

    let lower = -upper - 1;
    let mut packed = Vec::with_capacity(if byte_count == 1 { size8 } else { size16 });
    for &v in &values {
        let mut rest = v;
        if rest >= 0 {
            while rest >= upper {
                packed.push(upper);
                rest -= upper;
            }
        } else {
            while rest <= lower {
                packed.push(lower);
                rest -= lower;
            }
        }
        packed.push(rest);
    }

    let target = match (byte_count, is_unsigned) {
        (1, true) => DataType::Uint8,
        (1, false) => DataType::Int8,
        (_, true) => DataType::Uint16,
        (_, false) => DataType::Int16,
    };
    let record = Encoding::IntegerPacking {
        byte_count,
        is_unsigned,
        src_size: values.len(),
    };
    Ok((ColumnData::from_i64(&packed, target)?, Some(record)))
}

impl Encoding {
    pub fn kind(&self) -> &'static str {
        match self {
            Encoding::ByteArray { .. } => "ByteArray",
            Encoding::FixedPoint { .. } => "FixedPoint",
            Encoding::IntervalQuantization { .. } => "IntervalQuantization",
            Encoding::RunLength { .. } => "RunLength",
            Encoding::Delta { .. } => "Delta",
            Encoding::IntegerPacking { .. } => "IntegerPacking",
            Encoding::StringArray { .. } => "StringArray",
        }
    }

    /// Invert a non-terminal encoding.
    ///
    /// `ByteArray` and `StringArray` work on bytes and strings and are
    /// handled by the decoder directly.
    pub fn decode(&self, data: ColumnData) -> Result<ColumnData> {
        match self {
            Encoding::FixedPoint { factor, src_type } => {
                let values: Vec<f64> = data
                    .to_i64_vec()?
                    .into_iter()
                    .map(|v| v as f64 / factor)
                    .collect();
                ColumnData::Float64(values).cast(*src_type)
            }
            Encoding::IntervalQuantization {
                min,
                max,
                num_steps,
                src_type,
            } => {
                if *num_steps < 2 {
                    return Err(VolsegError::Decode(format!(
                        "IntervalQuantization with {num_steps} steps"
                    )));
                }
                let delta = (max - min) / (*num_steps - 1) as f64;
                let values: Vec<f64> = data
                    .to_i64_vec()?
                    .into_iter()
                    .map(|q| min + delta * q as f64)
                    .collect();
                ColumnData::Float64(values).cast(*src_type)
            }
            Encoding::RunLength { src_type, src_size } => {
                let pairs = data.to_i64_vec()?;
                if pairs.len() % 2 != 0 {
                    return Err(VolsegError::Decode(
                        "RunLength data has an odd number of elements".to_string(),
                    ));
                }
                let mut out = Vec::new();
                for pair in pairs.chunks_exact(2) {
                    if pair[1] < 0 || out.len() + pair[1] as usize > *src_size {
                        return Err(VolsegError::Decode(format!(
                            "RunLength runs exceed the declared size {src_size}"
                        )));
                    }
                    out.extend(std::iter::repeat(pair[0]).take(pair[1] as usize));
                }
                if out.len() != *src_size {
                    return Err(VolsegError::Decode(format!(
                        "RunLength decoded {} values, expected {src_size}",
                        out.len()
                    )));
                }
                ColumnData::from_i64(&out, *src_type).map_err(|e| VolsegError::Decode(e.to_string()))
            }
            Encoding::Delta { origin, src_type } => {
                let mut acc = *origin;
                let out: Vec<i64> = data
                    .to_i64_vec()?
                    .into_iter()
                    .map(|d| {
                        acc += d;
                        acc
                    })
                    .collect();
                ColumnData::from_i64(&out, *src_type).map_err(|e| VolsegError::Decode(e.to_string()))
            }
            Encoding::IntegerPacking {
                byte_count,
                is_unsigned,
                src_size,
            } => unpack(&data.to_i64_vec()?, *byte_count, *is_unsigned, *src_size),
            Encoding::ByteArray { .. } | Encoding::StringArray { .. } => Err(VolsegError::Decode(
                format!("{} cannot be applied to a typed column", self.kind()),
            )),
        }
    }
}

fn unpack(packed: &[i64], byte_count: u8, is_unsigned: bool, src_size: usize) -> Result<ColumnData> {
    let upper = match (byte_count, is_unsigned) {
        (1, true) => u8::MAX as i64,
        (1, false) => i8::MAX as i64,
        (2, true) => u16::MAX as i64,
        (2, false) => i16::MAX as i64,
        _ => {
            return Err(VolsegError::Decode(format!(
                "IntegerPacking byte count {byte_count} is not supported"
            )))
        }
    };
    let lower = if is_unsigned { i64::MIN } else { -upper - 1 };

    // Every output value consumes at least one packed element
    let mut out = Vec::with_capacity(src_size.min(packed.len()));
    let mut i = 0;
    while i < packed.len() {
        let mut value = 0i64;
        let mut t = packed[i];
        while t == upper || t == lower {
            value += t;
            i += 1;
            t = *packed.get(i).ok_or_else(|| {
                VolsegError::Decode("IntegerPacking data ends inside a value".to_string())
            })?;
        }
        value += t;
        out.push(value);
        i += 1;
    }
    if out.len() != src_size {
        return Err(VolsegError::Decode(format!(
            "IntegerPacking decoded {} values, expected {src_size}",
            out.len()
        )));
    }
    let out = to_i32(&out, "IntegerPacking").map_err(|e| VolsegError::Decode(e.to_string()))?;
    Ok(ColumnData::Int32(out))
}
