use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use volseg::encoding::{encode_column, ColumnData, EncodingPolicy};
use volseg::{downsample_categories, downsample_magic_kernel, SetTable};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const GRID_SIZES: [usize; 3] = [16, 32, 64];

fn set_up_density(size: usize) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(7);
    Array3::from_shape_fn((size, size, size), |_| rng.gen_range(-1.0f32..1.0))
}

/// Blobs of a handful of labels, like a typical segmentation.
fn set_up_lattice(size: usize) -> (Array3<u32>, SetTable) {
    let grid = Array3::from_shape_fn((size, size, size), |(x, y, z)| {
        ((x / 6) % 3 + (y / 5) % 2 + (z / 7) % 4) as u32
    });
    let table = SetTable::from_labels(grid.iter().copied());
    (grid, table)
}

fn magic_kernel(c: &mut Criterion) {
    let mut group = c.benchmark_group("magic_kernel");
    for size in GRID_SIZES.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let grid = set_up_density(size);
            b.iter(|| black_box(downsample_magic_kernel(&grid)));
        });
    }
    group.finish();
}

fn category_sets(c: &mut Criterion) {
    let mut group = c.benchmark_group("category_sets");
    for size in GRID_SIZES.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (grid, table) = set_up_lattice(size);
            b.iter(|| black_box(downsample_categories(&grid, &table).unwrap()));
        });
    }
    group.finish();
}

fn encode_lattice_column(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_lattice_column");
    for size in GRID_SIZES.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (grid, _) = set_up_lattice(size);
            let column = ColumnData::from(grid.iter().copied().collect::<Vec<u32>>());
            b.iter(|| black_box(encode_column(&column, &EncodingPolicy::lossless()).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, magic_kernel, category_sets, encode_lattice_column);
criterion_main!(benches);
