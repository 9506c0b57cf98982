//! Downsampling plan: how many halving steps to run and which ratios to keep
//!
//! A plan is computed once per lattice or volume from its level-1 shape and
//! element size, and passed explicitly to the pyramid builders.

use crate::category_downsampling::halved_shape;
use crate::config::DownsamplingParams;
use crate::error::{Result, VolsegError};
use crate::grid::GridShape;
use crate::metadata::DownsamplingLevelRecord;
use crate::utils::format_bytes;
use std::collections::BTreeSet;
use tracing::debug;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownsamplingPlan {
    /// Number of halving steps after the original level
    pub steps: u32,
    /// Ratios whose data is persisted
    pub ratios_to_keep: BTreeSet<u32>,
}

impl DownsamplingPlan {
    /// Compute the plan for a grid of `shape` with `element_size`-byte samples.
    pub fn compute(
        shape: GridShape,
        element_size: usize,
        params: &DownsamplingParams,
    ) -> Result<Self> {
        params.validate()?;
        if shape.iter().any(|&d| d == 0) {
            return Err(VolsegError::InvalidDimensions(format!(
                "cannot plan a pyramid for an empty grid {:?}",
                shape
            )));
        }

        let max_ratio = params.max_downsampling_level.unwrap_or(u32::MAX);
        let min_ratio = params.min_downsampling_level.unwrap_or(1);
        let bytes = |s: GridShape| s.iter().product::<usize>() * element_size;

        let mut shapes = vec![shape];
        let mut ratio = 1u32;
        loop {
            let current = shapes[shapes.len() - 1];
            if current == [1, 1, 1] || ratio.checked_mul(2).map_or(true, |r| r > max_ratio) {
                break;
            }
            let small_enough = current.iter().product::<usize>() <= params.min_grid_size
                || bytes(current) <= params.min_downsampled_file_size_bytes;
            // Keep halving past the size floor only to reach the requested minimum level.
            if small_enough && ratio >= min_ratio {
                break;
            }
            shapes.push(halved_shape(current));
            ratio *= 2;
        }
        let steps = (shapes.len() - 1) as u32;

        let ratios_to_keep: BTreeSet<u32> = shapes
            .iter()
            .enumerate()
            .map(|(i, &s)| (1u32 << i, s))
            .filter(|&(r, _)| r >= min_ratio && r <= max_ratio)
            .filter(|&(r, _)| !(r == 1 && params.remove_original_resolution))
            .filter(|&(_, s)| {
                params
                    .max_size_per_downsampling_lvl_mb
                    .map_or(true, |mb| bytes(s) as f64 / MIB <= mb)
            })
            .map(|(r, _)| r)
            .collect();

        if ratios_to_keep.is_empty() {
            return Err(VolsegError::Configuration(format!(
                "no downsampling level of a {:?} grid ({}) satisfies {:?}",
                shape,
                format_bytes(bytes(shape)),
                params
            )));
        }

        debug!(steps, ratios = ?ratios_to_keep, "computed downsampling plan");
        Ok(Self {
            steps,
            ratios_to_keep,
        })
    }

    /// All computed ratios, 1 included, in increasing order.
    pub fn ratios(&self) -> impl Iterator<Item = u32> {
        (0..=self.steps).map(|i| 1u32 << i)
    }

    pub fn keeps(&self, ratio: u32) -> bool {
        self.ratios_to_keep.contains(&ratio)
    }

    /// Level list as published in metadata; dropped levels stay listed.
    pub fn level_records(&self) -> Vec<DownsamplingLevelRecord> {
        self.ratios()
            .map(|level| DownsamplingLevelRecord {
                level,
                available: self.keeps(level),
            })
            .collect()
    }
}
