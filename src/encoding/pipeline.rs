//! Ordered encoding pipelines and the per-column selection policy

use super::data::ColumnData;
use super::encoders::{EncodedData, Encoding, EncodingStep};
use crate::error::Result;
use crate::types::DataType;
use bytes::Bytes;
use tracing::trace;

/// Fraction of non-decreasing neighbours above which delta coding pays off.
const MONOTONIC_FRACTION: f64 = 0.9;

/// Columns shorter than this are packed without run detection.
const SHORT_COLUMN: usize = 8;

/// Steps applied in order, always terminated by a byte array.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    steps: Vec<EncodingStep>,
}

impl Pipeline {
    /// Plain little-endian bytes.
    pub fn byte_array() -> Self {
        Self::default()
    }

    pub fn new(steps: Vec<EncodingStep>) -> Self {
        Self { steps }
    }

    /// Append a step.
    pub fn then(mut self, step: EncodingStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[EncodingStep] {
        &self.steps
    }

    /// Run every step, then write the result as a byte array.
    pub fn encode(&self, data: &ColumnData) -> Result<EncodedData> {
        let mut encoding: Vec<Encoding> = Vec::with_capacity(self.steps.len() + 1);
        let mut current = data.clone();
        for step in &self.steps {
            let (next, record) = step.encode(current)?;
            match record {
                Some(record) => encoding.push(record),
                None => trace!(step = step.name(), "step skipped"),
            }
            current = next;
        }
        encoding.push(Encoding::ByteArray {
            data_type: current.data_type(),
        });
        Ok(EncodedData {
            encoding,
            data: Bytes::from(current.to_le_bytes()),
        })
    }
}

/// How lossy the encoder may be.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EncodingPolicy {
    /// Quantize float columns into this many levels; `None` keeps them exact.
    pub lossy_float_steps: Option<u32>,
}

impl EncodingPolicy {
    pub fn lossless() -> Self {
        Self::default()
    }

    pub fn lossy(num_steps: u32) -> Self {
        Self {
            lossy_float_steps: Some(num_steps),
        }
    }
}

/// Summary of a column that drives pipeline selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    pub len: usize,
    pub min: f64,
    pub max: f64,
    /// Number of maximal runs of equal values
    pub runs: usize,
    /// Neighbour pairs with `next >= previous`
    pub non_decreasing: usize,
    /// Largest absolute difference between neighbours
    pub max_step: f64,
    /// Every value is finite
    pub finite: bool,
}

impl ColumnStats {
    pub fn of(data: &ColumnData) -> Self {
        let values = data.to_f64_vec();
        let mut stats = ColumnStats {
            len: values.len(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            runs: usize::from(!values.is_empty()),
            non_decreasing: 0,
            max_step: 0.0,
            finite: true,
        };
        for (i, &v) in values.iter().enumerate() {
            stats.finite &= v.is_finite();
            stats.min = stats.min.min(v);
            stats.max = stats.max.max(v);
            if i > 0 {
                let previous = values[i - 1];
                if v != previous {
                    stats.runs += 1;
                }
                if v >= previous {
                    stats.non_decreasing += 1;
                }
                stats.max_step = stats.max_step.max((v - previous).abs());
            }
        }
        stats
    }

    /// Most neighbours are non-decreasing and not every value is equal.
    pub fn is_mostly_increasing(&self) -> bool {
        self.len >= 2
            && self.runs > 1
            && self.non_decreasing as f64 >= MONOTONIC_FRACTION * (self.len - 1) as f64
    }

    /// Runs are on average at least two values long.
    pub fn has_long_runs(&self) -> bool {
        self.len > 0 && self.runs * 2 <= self.len
    }

    fn fits_int32(&self) -> bool {
        let (lo, hi) = DataType::Int32.value_bounds();
        self.len == 0 || (self.min >= lo && self.max <= hi)
    }

    /// Delta output is `Int32`, so every neighbour difference must fit it.
    fn deltas_fit_int32(&self) -> bool {
        let (lo, hi) = DataType::Int32.value_bounds();
        self.max_step <= hi.min(-lo)
    }
}

/// Pick the pipeline for a column of `data_type` summarized by `stats`.
pub fn choose_pipeline(data_type: DataType, stats: &ColumnStats, policy: &EncodingPolicy) -> Pipeline {
    if data_type.is_float() {
        return match policy.lossy_float_steps {
            Some(num_steps) if stats.len > 0 && stats.finite => {
                Pipeline::byte_array().then(EncodingStep::IntervalQuantization {
                    min: stats.min,
                    max: stats.max,
                    num_steps,
                })
            }
            _ => Pipeline::byte_array(),
        };
    }

    if stats.len == 0 || !stats.fits_int32() {
        return Pipeline::byte_array();
    }

    if stats.len >= SHORT_COLUMN && stats.has_long_runs() {
        return Pipeline::new(vec![EncodingStep::RunLength, EncodingStep::IntegerPacking]);
    }
    if stats.len >= SHORT_COLUMN && stats.is_mostly_increasing() && stats.deltas_fit_int32() {
        // Delta records the source type, so narrow columns keep it too
        return Pipeline::new(vec![
            EncodingStep::Delta,
            EncodingStep::RunLength,
            EncodingStep::IntegerPacking,
        ]);
    }

    match data_type {
        // Packing decodes to Int32, so only Int32 columns keep their type
        DataType::Int32 => Pipeline::new(vec![EncodingStep::IntegerPacking]),
        _ => Pipeline::byte_array(),
    }
}

/// Encode a column with the pipeline [`choose_pipeline`] picks for it.
pub fn encode_column(data: &ColumnData, policy: &EncodingPolicy) -> Result<EncodedData> {
    let pipeline = choose_pipeline(data.data_type(), &ColumnStats::of(data), policy);
    pipeline.encode(data)
}
