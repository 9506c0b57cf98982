//! Magic-kernel downsampling of continuous volumes
//!
//! Each step convolves the grid with the separable kernel `[1, 4, 6, 4, 1] / 16`
//! on every axis and keeps every second sample (starting at index 0), so an
//! axis of length `n` becomes `ceil(n / 2)`. Samples beyond the grid edge are
//! mirrored about the edge sample (`... 2 1 | 0 1 2 ... n-1 | n-2 n-3 ...`).

use crate::error::Result;
use crate::grid::{shape_of, GridData};
use crate::types::DataType;
use ndarray::Array3;
use num_traits::Float;

/// Kernel taps relative to the centre sample.
const TAP_OFFSETS: [isize; 5] = [-2, -1, 0, 1, 2];

fn kernel_weights<F: Float>() -> [F; 5] {
    let one = F::one();
    let two = one + one;
    let four = two + two;
    let six = four + two;
    let sixteen = four * four;
    [
        one / sixteen,
        four / sixteen,
        six / sixteen,
        four / sixteen,
        one / sixteen,
    ]
}

/// Mirror an out-of-range index back into `[0, n)`.
fn mirror(index: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = index.rem_euclid(period);
    if m >= n as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

/// Convolve along `axis` and keep every second sample along it.
fn convolve_decimate_axis<F: Float>(input: &Array3<F>, axis: usize) -> Array3<F> {
    let shape = shape_of(input);
    let n = shape[axis];
    let mut out_shape = shape;
    out_shape[axis] = n.div_ceil(2);
    let weights = kernel_weights::<F>();

    Array3::from_shape_fn((out_shape[0], out_shape[1], out_shape[2]), |(x, y, z)| {
        let mut index = [x, y, z];
        let centre = 2 * index[axis] as isize;
        let mut acc = F::zero();
        for (offset, &w) in TAP_OFFSETS.iter().zip(weights.iter()) {
            index[axis] = mirror(centre + offset, n);
            acc = acc + w * input[index];
        }
        acc
    })
}

/// Halve a float grid on every axis.
///
/// Because the kernel is separable, convolving and decimating one axis at a
/// time gives the same result as a full 3-D convolution followed by
/// decimation, at a fraction of the work.
pub fn downsample_magic_kernel<F: Float>(grid: &Array3<F>) -> Array3<F> {
    let mut out = convolve_decimate_axis(grid, 0);
    out = convolve_decimate_axis(&out, 1);
    convolve_decimate_axis(&out, 2)
}

/// Halve a grid and cast the result to the level's storage type.
pub fn downsample_volume<F>(grid: &Array3<F>, storage: DataType) -> Result<GridData>
where
    F: Float,
{
    let halved = downsample_magic_kernel(grid);
    GridData::from_float_grid(&halved, storage)
}
