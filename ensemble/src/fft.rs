//! Two-dimensional FFTs built from row and column passes of `rustfft`.
//!
//! Conventions follow numpy: the forward transform is unnormalized and the
//! inverse is scaled by `1 / (rows * cols)`.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use rustfft::num_complex::Complex64;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftDirection, FftPlanner};

/// In-place 1D transform of each subview of `out` taken along `axis`, rows or columns in parallel.
fn pass_along(out: &mut Array2<Complex64>, axis: Axis, fft: &dyn Fft<f64>) {
    let len = out.len_of(Axis(1 - axis.index()));
    out.axis_iter_mut(axis).into_par_iter().for_each_init(
        || vec![Complex64::zero(); len],
        |buffer, mut lane| {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            fft.process(buffer);
            for (v, b) in lane.iter_mut().zip(buffer.iter()) {
                *v = *b;
            }
        },
    );
}

fn transform_2d(input: &ArrayView2<Complex64>, direction: FftDirection) -> Array2<Complex64> {
    let (rows, cols) = input.dim();
    let mut out = input.to_owned();
    if rows == 0 || cols == 0 {
        return out;
    }

    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft(cols, direction);
    let col_fft = planner.plan_fft(rows, direction);

    pass_along(&mut out, Axis(0), row_fft.as_ref());
    pass_along(&mut out, Axis(1), col_fft.as_ref());

    out
}

/// Forward 2D FFT.
pub fn fft2(input: &ArrayView2<Complex64>) -> Array2<Complex64> {
    transform_2d(input, FftDirection::Forward)
}

/// Forward 2D FFT of real data.
pub fn fft2_real(input: &ArrayView2<f64>) -> Array2<Complex64> {
    let complex = input.mapv(|v| Complex64::new(v, 0.0));
    transform_2d(&complex.view(), FftDirection::Forward)
}

/// Normalized inverse 2D FFT.
pub fn ifft2(input: &ArrayView2<Complex64>) -> Array2<Complex64> {
    let (rows, cols) = input.dim();
    let mut out = transform_2d(input, FftDirection::Inverse);
    if rows > 0 && cols > 0 {
        let norm = 1.0 / (rows * cols) as f64;
        out.mapv_inplace(|v| v * norm);
    }
    out
}
