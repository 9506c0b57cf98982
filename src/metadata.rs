//! Entry metadata: per-level sampling boxes, availability and statistics

use crate::error::{Result, VolsegError};
use crate::grid::GridShape;
use crate::types::Vec3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// One entry of the level list a client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsamplingLevelRecord {
    /// Downsampling ratio
    pub level: u32,
    /// False once the level's data was removed
    pub available: bool,
}

/// Placement of a grid in world space at one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingBox {
    /// World position of voxel `[0, 0, 0]`
    pub origin: Vec3,
    pub voxel_size: Vec3,
    pub grid_dimensions: GridShape,
}

impl SamplingBox {
    /// Box of a level `factor` times coarser with the given shape.
    pub fn coarsened(&self, factor: u32, grid_dimensions: GridShape) -> Self {
        let f = factor as f64;
        Self {
            origin: self.origin,
            voxel_size: [
                self.voxel_size[0] * f,
                self.voxel_size[1] * f,
                self.voxel_size[2] * f,
            ],
            grid_dimensions,
        }
    }

    pub fn voxel_count(&self) -> usize {
        self.grid_dimensions.iter().product()
    }

    /// True when both boxes put the same voxels at the same world positions.
    pub fn is_aligned_with(&self, other: &SamplingBox) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0);
        self.grid_dimensions == other.grid_dimensions
            && (0..3).all(|axis| {
                close(self.origin[axis], other.origin[axis])
                    && close(self.voxel_size[axis], other.voxel_size[axis])
            })
    }
}

/// Mean, standard deviation and range of a grid's samples.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DescriptiveStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Inclusive range of time frame indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub start: u32,
    pub end: u32,
    pub units: String,
}

impl TimeInfo {
    pub fn single() -> Self {
        Self {
            start: 0,
            end: 0,
            units: "millisecond".to_string(),
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self::single()
    }
}

/// Levels of one grid family (the volume, or one segmentation lattice).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SamplingInfo {
    pub spatial_downsampling_levels: Vec<DownsamplingLevelRecord>,
    /// Sampling box per ratio
    pub boxes: BTreeMap<u32, SamplingBox>,
    pub time_info: TimeInfo,
}

impl SamplingInfo {
    pub fn is_available(&self, ratio: u32) -> bool {
        self.spatial_downsampling_levels
            .iter()
            .any(|r| r.level == ratio && r.available)
    }

    /// Available ratios in increasing order.
    pub fn available_ratios(&self) -> Vec<u32> {
        let mut ratios: Vec<u32> = self
            .spatial_downsampling_levels
            .iter()
            .filter(|r| r.available)
            .map(|r| r.level)
            .collect();
        ratios.sort_unstable();
        ratios
    }

    pub fn box_at(&self, ratio: u32) -> Option<&SamplingBox> {
        self.boxes.get(&ratio)
    }

    /// Keep a level listed but flag its data as gone.
    pub fn mark_unavailable(&mut self, ratio: u32) -> Result<()> {
        let record = self
            .spatial_downsampling_levels
            .iter_mut()
            .find(|r| r.level == ratio)
            .ok_or_else(|| VolsegError::NotFound(format!("downsampling level {ratio}")))?;
        record.available = false;
        Ok(())
    }
}

/// Statistics keyed by ratio, then time frame, then channel id.
pub type StatisticsTable = BTreeMap<u32, BTreeMap<u32, BTreeMap<String, DescriptiveStatistics>>>;

/// Continuous volume channels of an entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VolumesMetadata {
    pub channel_ids: Vec<String>,
    pub sampling: SamplingInfo,
    pub descriptive_statistics: StatisticsTable,
}

impl VolumesMetadata {
    pub fn statistics(
        &self,
        ratio: u32,
        time: u32,
        channel: &str,
    ) -> Option<&DescriptiveStatistics> {
        self.descriptive_statistics
            .get(&ratio)?
            .get(&time)?
            .get(channel)
    }
}

/// One segmentation lattice of an entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LatticeMetadata {
    pub sampling: SamplingInfo,
}

/// Complete metadata for one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub version: FormatVersion,
    pub entry_id: String,
    pub volumes: Option<VolumesMetadata>,
    pub segmentation_lattices: BTreeMap<String, LatticeMetadata>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl EntryMetadata {
    pub fn new(entry_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            entry_id: entry_id.into(),
            volumes: None,
            segmentation_lattices: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn volumes(&self) -> Result<&VolumesMetadata> {
        self.volumes
            .as_ref()
            .ok_or_else(|| VolsegError::NotFound(format!("volume data of entry {}", self.entry_id)))
    }

    pub fn lattice(&self, lattice_id: &str) -> Result<&LatticeMetadata> {
        self.segmentation_lattices.get(lattice_id).ok_or_else(|| {
            VolsegError::NotFound(format!(
                "segmentation lattice {lattice_id} of entry {}",
                self.entry_id
            ))
        })
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}
