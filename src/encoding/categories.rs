//! Volume and segmentation slices as BinaryCIF categories
//!
//! A slice file holds one data block named after the channel or lattice with
//! `volume_data_3d_info` plus either `volume_data_3d` (density values) or
//! `segmentation_data_table` and `segmentation_data_3d` (category ids and the
//! labels behind them). Values are written with x changing fastest.

use super::data::ColumnData;
use super::pipeline::EncodingPolicy;
use super::writer::{default_encoder_name, CategoryBuilder, CifWriter};
use crate::error::{Result, VolsegError};
use crate::grid::GridData;
use crate::metadata::{DescriptiveStatistics, SamplingBox};
use crate::set_table::{CategoryId, SetTable};
use crate::slice_box::SliceBox;
use bytes::Bytes;
use ndarray::Array3;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Describes where a slice sits and what the data looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    /// Data block header, usually the channel or lattice id
    pub name: String,
    pub slice: SliceBox,
    /// Sampling box of the level the slice was cut from
    pub sampling: SamplingBox,
    /// Statistics of the original resolution
    pub source_statistics: DescriptiveStatistics,
    /// Statistics of the level the slice was cut from
    pub sampled_statistics: DescriptiveStatistics,
}

/// Values of `arr` with x changing fastest.
pub fn flatten_x_fastest<T: Copy>(arr: &Array3<T>) -> Vec<T> {
    arr.t().iter().copied().collect()
}

fn info_category(info: &VolumeInfo) -> Result<CategoryBuilder> {
    let dims = info.sampling.grid_dimensions;
    let extent = info.slice.extent();
    let policy = EncodingPolicy::lossless();
    let mut builder = CategoryBuilder::new("volume_data_3d_info", policy)
        .string_column("name", &[info.name.as_str()])?;

    for axis in 0..3 {
        let d = dims[axis].max(1) as f64;
        builder = builder
            .column(&format!("axis_order[{axis}]"), ColumnData::from(vec![axis as i32]))?
            .column(
                &format!("origin[{axis}]"),
                ColumnData::from(vec![info.slice.bottom_left[axis] as f64 / d]),
            )?
            .column(
                &format!("dimensions[{axis}]"),
                ColumnData::from(vec![extent[axis] as f64 / d]),
            )?
            .column(
                &format!("sample_count[{axis}]"),
                ColumnData::from(vec![extent[axis] as i32]),
            )?
            .column(
                &format!("spacegroup_cell_size[{axis}]"),
                ColumnData::from(vec![dims[axis] as f64 * info.sampling.voxel_size[axis]]),
            )?
            .column(
                &format!("spacegroup_cell_angles[{axis}]"),
                ColumnData::from(vec![90.0f64]),
            )?;
    }

    let rate = i32::try_from(info.slice.downsampling_rate).map_err(|_| {
        VolsegError::EncoderRange(format!(
            "downsampling rate {} does not fit in Int32",
            info.slice.downsampling_rate
        ))
    })?;
    let (src, sampled) = (&info.source_statistics, &info.sampled_statistics);
    builder
        .column("sample_rate", ColumnData::from(vec![rate]))?
        .column("spacegroup_number", ColumnData::from(vec![1i32]))?
        .column("mean_source", ColumnData::from(vec![src.mean]))?
        .column("mean_sampled", ColumnData::from(vec![sampled.mean]))?
        .column("sigma_source", ColumnData::from(vec![src.std]))?
        .column("sigma_sampled", ColumnData::from(vec![sampled.std]))?
        .column("min_source", ColumnData::from(vec![src.min]))?
        .column("min_sampled", ColumnData::from(vec![sampled.min]))?
        .column("max_source", ColumnData::from(vec![src.max]))?
        .column("max_sampled", ColumnData::from(vec![sampled.max]))
}

/// Encode a cut grid as a BinaryCIF file.
///
/// With a set table the grid is treated as a segmentation lattice and only
/// the sets actually referenced by the slice are written.
#[instrument(level = "debug", skip_all, fields(name = %info.name, rate = info.slice.downsampling_rate))]
pub fn encode_slice(
    grid: &GridData,
    set_table: Option<&SetTable>,
    info: &VolumeInfo,
    policy: &EncodingPolicy,
) -> Result<Bytes> {
    if grid.shape() != info.slice.extent() {
        return Err(VolsegError::InvalidDimensions(format!(
            "grid {:?} does not match slice extent {:?}",
            grid.shape(),
            info.slice.extent()
        )));
    }

    let mut writer = CifWriter::new(default_encoder_name());
    writer.start_data_block(info.name.clone());
    writer.write_category(info_category(info)?.build())?;

    match set_table {
        Some(table) => {
            let ids = flatten_x_fastest(grid.as_categories()?);
            let used: BTreeSet<CategoryId> = ids.iter().copied().collect();
            let used: Vec<CategoryId> = used.into_iter().collect();

            let mut set_ids = Vec::new();
            let mut segment_ids = Vec::new();
            for (id, labels) in used.iter().zip(table.get_categories(&used)?) {
                for &label in labels {
                    set_ids.push(*id);
                    segment_ids.push(label);
                }
            }
            debug!(sets = used.len(), pairs = set_ids.len(), "writing segmentation slice");

            let table_category = CategoryBuilder::new("segmentation_data_table", *policy)
                .column("set_id", ColumnData::from(set_ids))?
                .column("segment_id", ColumnData::from(segment_ids))?
                .build();
            let values = CategoryBuilder::new("segmentation_data_3d", *policy)
                .column("values", ColumnData::from(ids))?
                .build();
            writer.write_category(table_category)?;
            writer.write_category(values)?;
        }
        None => {
            let values = flatten_x_fastest(&grid.to_f32());
            let values = CategoryBuilder::new("volume_data_3d", *policy)
                .column("values", ColumnData::from(values))?
                .build();
            writer.write_category(values)?;
        }
    }
    writer.encode()
}
