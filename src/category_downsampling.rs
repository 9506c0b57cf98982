//! Category-set downsampling of segmentation lattices
//!
//! One step halves every axis. Output voxel `(i, j, k)` covers the source
//! block `[2i, 2i+2) x [2j, 2j+2) x [2k, 2k+2)`, clipped at the high edge when
//! a source dimension is odd. Its category is the union of the label sets of
//! every source voxel in the block, registered in a fresh [`SetTable`] for the
//! new level. Source levels are never touched; each step returns a new
//! `(grid, table)` pair.

use crate::error::{Result, VolsegError};
use crate::grid::{shape_of, GridShape};
use crate::set_table::{CategoryId, Label, SetTable};
use ndarray::Array3;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// One published level of a segmentation pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryLevel {
    /// Downsampling ratio relative to the original grid
    pub ratio: u32,
    pub grid: Array3<CategoryId>,
    pub table: SetTable,
}

impl CategoryLevel {
    pub fn shape(&self) -> GridShape {
        shape_of(&self.grid)
    }
}

/// Shape of the grid produced by one halving step.
pub fn halved_shape(shape: GridShape) -> GridShape {
    [
        shape[0].div_ceil(2),
        shape[1].div_ceil(2),
        shape[2].div_ceil(2),
    ]
}

/// Source index range `[start, end)` covered by output index `i` along an
/// axis of length `dim`.
fn block_range(i: usize, dim: usize) -> (usize, usize) {
    let start = (2 * i).min(dim - 1);
    let end = (2 * i + 2).min(dim);
    (start, end)
}

/// Check that every value of `grid` has a set in `table`.
pub fn validate_lattice(grid: &Array3<CategoryId>, table: &SetTable) -> Result<()> {
    match grid.iter().find(|&&v| table.get(v).is_none()) {
        Some(&v) => Err(VolsegError::UnknownCategoryId(v)),
        None => Ok(()),
    }
}

/// Produce the next coarser level of a segmentation lattice.
#[instrument(level = "debug", skip_all, fields(shape = ?shape_of(grid)))]
pub fn downsample_categories(
    grid: &Array3<CategoryId>,
    table: &SetTable,
) -> Result<(Array3<CategoryId>, SetTable)> {
    let shape = shape_of(grid);
    if shape.iter().any(|&d| d == 0) {
        return Err(VolsegError::InvalidDimensions(format!(
            "cannot downsample an empty lattice {:?}",
            shape
        )));
    }
    let out_shape = halved_shape(shape);

    let mut new_table = SetTable::new();
    // Distinct source ids of a block -> output id. Blocks inside one segment
    // repeat the same few combinations, so most voxels hit this cache.
    let mut resolved: HashMap<Vec<CategoryId>, CategoryId> = HashMap::new();
    let mut block_ids: Vec<CategoryId> = Vec::with_capacity(8);
    let mut union: Vec<Label> = Vec::new();
    let mut values = Vec::with_capacity(out_shape.iter().product());

    for i in 0..out_shape[0] {
        let (x0, x1) = block_range(i, shape[0]);
        for j in 0..out_shape[1] {
            let (y0, y1) = block_range(j, shape[1]);
            for k in 0..out_shape[2] {
                let (z0, z1) = block_range(k, shape[2]);
                if x1 <= x0 || y1 <= y0 || z1 <= z0 {
                    continue;
                }

                block_ids.clear();
                for x in x0..x1 {
                    for y in y0..y1 {
                        for z in z0..z1 {
                            block_ids.push(grid[[x, y, z]]);
                        }
                    }
                }
                block_ids.sort_unstable();
                block_ids.dedup();

                if let Some(&id) = resolved.get(&block_ids) {
                    values.push(id);
                    continue;
                }

                union.clear();
                for set in table.get_categories(&block_ids)? {
                    union.extend_from_slice(set);
                }
                union.sort_unstable();
                union.dedup();

                let id = new_table.resolve_canonical(union.clone())?;
                resolved.insert(block_ids.clone(), id);
                values.push(id);
            }
        }
    }

    let expected: usize = out_shape.iter().product();
    if values.len() != expected {
        return Err(VolsegError::Integrity(format!(
            "downsampled lattice {:?} has {} assigned voxels, expected {}",
            out_shape,
            values.len(),
            expected
        )));
    }

    debug!(
        out_shape = ?out_shape,
        categories = new_table.len(),
        "downsampled segmentation lattice"
    );
    let out = Array3::from_shape_vec((out_shape[0], out_shape[1], out_shape[2]), values)?;
    Ok((out, new_table))
}

/// Build `steps` successive levels on top of the original lattice.
///
/// The returned vector starts with the original (ratio 1) level and holds
/// `steps + 1` levels in increasing ratio order.
#[instrument(level = "debug", skip(grid, table))]
pub fn build_category_pyramid(
    grid: Array3<CategoryId>,
    table: SetTable,
    steps: u32,
) -> Result<Vec<CategoryLevel>> {
    validate_lattice(&grid, &table)?;

    let mut levels = vec![CategoryLevel {
        ratio: 1,
        grid,
        table,
    }];
    for _ in 0..steps {
        let previous = &levels[levels.len() - 1];
        let (grid, table) = downsample_categories(&previous.grid, &previous.table)?;
        let ratio = previous.ratio * 2;
        levels.push(CategoryLevel { ratio, grid, table });
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn singleton_grid(shape: GridShape, first_label: u32) -> (Array3<u32>, SetTable) {
        let grid = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(x, y, z)| {
            first_label + (x * shape[1] * shape[2] + y * shape[2] + z) as u32
        });
        let table = SetTable::from_labels(grid.iter().copied());
        (grid, table)
    }

    /// Every output voxel denotes exactly the union of its source block.
    fn assert_covers_source(
        src: &Array3<u32>,
        src_table: &SetTable,
        out: &Array3<u32>,
        out_table: &SetTable,
    ) {
        let shape = shape_of(src);
        assert_eq!(shape_of(out), halved_shape(shape));
        for ((i, j, k), &id) in out.indexed_iter() {
            let mut expected: Vec<u32> = Vec::new();
            for x in 2 * i..(2 * i + 2).min(shape[0]) {
                for y in 2 * j..(2 * j + 2).min(shape[1]) {
                    for z in 2 * k..(2 * k + 2).min(shape[2]) {
                        expected.extend_from_slice(src_table.get(src[[x, y, z]]).unwrap());
                    }
                }
            }
            expected.sort_unstable();
            expected.dedup();
            assert_eq!(out_table.get(id), Some(expected.as_slice()), "voxel {:?}", (i, j, k));
        }
    }

    #[test]
    fn test_4x4x4_distinct_singletons() {
        let (grid, table) = singleton_grid([4, 4, 4], 1);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_eq!(out.dim(), (2, 2, 2));
        assert_covers_source(&grid, &table, &out, &out_table);

        // Eight distinct blocks of eight labels each
        assert_eq!(out_table.len(), 8 + 1);
        let first = out_table.get(out[[0, 0, 0]]).unwrap();
        assert_eq!(first, &[1, 2, 5, 6, 17, 18, 21, 22]);
    }

    #[test]
    fn test_background_label_contributes_nothing() {
        let (grid, table) = singleton_grid([4, 4, 4], 0);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_covers_source(&grid, &table, &out, &out_table);
        assert_eq!(out_table.get(out[[0, 0, 0]]).unwrap(), &[1, 4, 5, 16, 17, 20, 21]);
    }

    #[test]
    fn test_odd_dimensions_clip() {
        let (grid, table) = singleton_grid([5, 5, 5], 1);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_eq!(out.dim(), (3, 3, 3));
        assert_covers_source(&grid, &table, &out, &out_table);
        // The far corner covers a single source voxel
        assert_eq!(out_table.get(out[[2, 2, 2]]).unwrap(), &[125]);
        // An edge voxel covers a 1x2x2 block
        assert_eq!(out_table.get(out[[2, 0, 0]]).unwrap().len(), 4);
    }

    #[test]
    fn test_mixed_odd_even_shape() {
        let (grid, table) = singleton_grid([3, 4, 1], 1);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_eq!(out.dim(), (2, 2, 1));
        assert_covers_source(&grid, &table, &out, &out_table);
    }

    #[test]
    fn test_identical_blocks_share_an_id() {
        let mut grid = Array3::<u32>::zeros((4, 2, 2));
        grid.slice_mut(ndarray::s![0..2, .., ..]).fill(3);
        grid.slice_mut(ndarray::s![2..4, .., ..]).fill(3);
        grid[[3, 1, 1]] = 4;
        let table = SetTable::from_labels([3, 4]);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_eq!(out.dim(), (2, 1, 1));
        assert_eq!(out_table.get(out[[0, 0, 0]]).unwrap(), &[3]);
        assert_eq!(out_table.get(out[[1, 0, 0]]).unwrap(), &[3, 4]);
    }

    #[test]
    fn test_background_block_maps_to_zero() {
        let grid = Array3::<u32>::zeros((2, 2, 2));
        let table = SetTable::from_labels([0]);
        let (out, out_table) = downsample_categories(&grid, &table).unwrap();
        assert_eq!(out[[0, 0, 0]], 0);
        assert!(out_table.is_empty());
    }

    #[test]
    fn test_unknown_id_is_fatal() {
        let mut grid = Array3::<u32>::ones((2, 2, 2));
        grid[[1, 1, 1]] = 9;
        let table = SetTable::from_labels([1]);
        match downsample_categories(&grid, &table) {
            Err(VolsegError::UnknownCategoryId(9)) => {}
            other => panic!("unexpected {:?}", other.map(|(g, _)| g.dim())),
        }
        assert!(build_category_pyramid(grid, table, 0).is_err());
    }

    #[test]
    fn test_pyramid_levels() {
        let (grid, table) = singleton_grid([5, 6, 7], 1);
        let levels = build_category_pyramid(grid, table, 3).unwrap();
        let ratios: Vec<u32> = levels.iter().map(|l| l.ratio).collect();
        assert_eq!(ratios, vec![1, 2, 4, 8]);
        let shapes: Vec<GridShape> = levels.iter().map(|l| l.shape()).collect();
        assert_eq!(shapes, vec![[5, 6, 7], [3, 3, 4], [2, 2, 2], [1, 1, 1]]);

        // The coarsest voxel holds every label of the original lattice
        let top = &levels[3];
        assert_eq!(top.table.get(top.grid[[0, 0, 0]]).unwrap().len(), 5 * 6 * 7);

        for pair in levels.windows(2) {
            assert_covers_source(&pair[0].grid, &pair[0].table, &pair[1].grid, &pair[1].table);
        }
    }

    #[test]
    fn test_random_lattices_cover_sources() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let shape = [
                rng.gen_range(1..9),
                rng.gen_range(1..9),
                rng.gen_range(1..9),
            ];
            let grid = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |_| {
                rng.gen_range(0..6u32)
            });
            let table = SetTable::from_labels(grid.iter().copied());
            let (out, out_table) = downsample_categories(&grid, &table).unwrap();
            assert_covers_source(&grid, &table, &out, &out_table);
        }
    }
}
