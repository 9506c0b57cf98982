//! Query-time level and voxel range selection
//!
//! Levels are tried from the finest to the coarsest; the first one whose box
//! holds no more than the point budget wins. When none fits, the coarsest
//! level that produced a box is returned, since the budget is a preference
//! rather than a filter. A region lying wholly outside the data yields
//! `None`.

use crate::error::{Result, VolsegError};
use crate::metadata::{EntryMetadata, SamplingBox, SamplingInfo};
use crate::types::WorldBox;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Resolved answer to a region query: a level and an inclusive voxel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceBox {
    pub downsampling_rate: u32,
    /// Inclusive lower voxel corner
    pub bottom_left: [usize; 3],
    /// Inclusive upper voxel corner
    pub top_right: [usize; 3],
}

impl SliceBox {
    pub fn new(downsampling_rate: u32, bottom_left: [usize; 3], top_right: [usize; 3]) -> Self {
        Self {
            downsampling_rate,
            bottom_left,
            top_right,
        }
    }

    /// Whole grid of a level.
    pub fn full(downsampling_rate: u32, grid_dimensions: [usize; 3]) -> Self {
        Self::new(
            downsampling_rate,
            [0, 0, 0],
            [
                grid_dimensions[0].saturating_sub(1),
                grid_dimensions[1].saturating_sub(1),
                grid_dimensions[2].saturating_sub(1),
            ],
        )
    }

    /// Number of voxels along each axis; an inverted axis is empty.
    pub fn extent(&self) -> [usize; 3] {
        [0, 1, 2].map(|axis| (self.top_right[axis] + 1).saturating_sub(self.bottom_left[axis]))
    }

    /// Total number of voxels
    pub fn volume(&self) -> usize {
        self.extent().iter().product()
    }
}

/// Convert a world-space region to voxel bounds of one level.
///
/// Returns `None` when the region does not intersect the grid.
pub fn world_to_grid(region: &WorldBox, ratio: u32, sampling: &SamplingBox) -> Option<SliceBox> {
    let (min, max) = (region.min(), region.max());
    let mut bottom_left = [0usize; 3];
    let mut top_right = [0usize; 3];
    for axis in 0..3 {
        let dim = sampling.grid_dimensions[axis] as i64;
        let size = sampling.voxel_size[axis];
        let origin = sampling.origin[axis];
        let lo = ((min[axis] - origin) / size).floor() as i64;
        let hi = ((max[axis] - origin) / size).ceil() as i64;
        if dim == 0 || lo > hi || lo > dim - 1 || hi < 0 {
            return None;
        }
        bottom_left[axis] = lo.clamp(0, dim - 1) as usize;
        top_right[axis] = hi.clamp(0, dim - 1) as usize;
    }
    Some(SliceBox::new(ratio, bottom_left, top_right))
}

/// Pick the level and voxel range serving a request.
///
/// `region` absent means the whole entry, `max_points` absent means no
/// budget. Every lattice in `lattices` must have the returned level available
/// as well.
#[instrument(level = "debug", skip(metadata), fields(entry = %metadata.entry_id))]
pub fn resolve_slice_box(
    region: Option<&WorldBox>,
    max_points: Option<usize>,
    metadata: &EntryMetadata,
    lattices: &[&str],
) -> Result<Option<SliceBox>> {
    let primary: &SamplingInfo = match (&metadata.volumes, lattices.first()) {
        (Some(volumes), _) => &volumes.sampling,
        (None, Some(first)) => &metadata.lattice(first)?.sampling,
        (None, None) => {
            return Err(VolsegError::NotFound(format!(
                "entry {} has neither volume nor segmentation data",
                metadata.entry_id
            )))
        }
    };
    let co_grids = lattices
        .iter()
        .map(|id| metadata.lattice(id).map(|l| &l.sampling))
        .collect::<Result<Vec<_>>>()?;

    let mut fallback: Option<SliceBox> = None;
    for ratio in primary.available_ratios() {
        if let Some(id) = lattices
            .iter()
            .zip(&co_grids)
            .find(|(_, s)| !s.is_available(ratio))
            .map(|(id, _)| id)
        {
            debug!(ratio, lattice = *id, "level not available for every lattice");
            continue;
        }

        let sampling = primary.box_at(ratio).ok_or_else(|| {
            VolsegError::Integrity(format!(
                "level {ratio} of entry {} is available but has no sampling box",
                metadata.entry_id
            ))
        })?;
        let candidate = match region {
            Some(region) => match world_to_grid(region, ratio, sampling) {
                Some(b) => b,
                None => {
                    debug!(ratio, "request lies outside the grid");
                    continue;
                }
            },
            None => SliceBox::full(ratio, sampling.grid_dimensions),
        };

        if max_points.map_or(true, |budget| candidate.volume() <= budget) {
            debug!(ratio, volume = candidate.volume(), "level fits");
            return Ok(Some(candidate));
        }
        fallback = Some(candidate);
    }

    if let Some(b) = &fallback {
        debug!(ratio = b.downsampling_rate, "no level fits the budget, using the coarsest");
    }
    Ok(fallback)
}
