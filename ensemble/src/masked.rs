//! Masked arrays and the masked arithmetic used to combine atom statistics.
//!
//! A mask value of `true` marks an invalid element. Reductions skip masked
//! elements and only mask an output pixel when every input along the reduced
//! axis is masked.

use ndarray::{stack, Array, Array2, ArrayView2, Axis, Dimension, Ix2, Ix3, Zip};
use rustfft::num_complex::Complex64;
use rustfft::num_traits::Zero;
use std::ops::{Add, Sub};

use crate::error::{EnsembleError, Result};

/// Scalar types that can live in a [`MaskedArray`] and be reduced.
pub trait MaskedElement:
    Copy + Zero + Add<Output = Self> + Sub<Output = Self> + Send + Sync + 'static
{
    /// Squared magnitude, `|x|²`.
    fn norm_sqr(self) -> f64;

    fn div_real(self, divisor: f64) -> Self;

    fn is_finite(self) -> bool;
}

impl MaskedElement for f64 {
    fn norm_sqr(self) -> f64 {
        self * self
    }

    fn div_real(self, divisor: f64) -> Self {
        self / divisor
    }

    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }
}

impl MaskedElement for Complex64 {
    fn norm_sqr(self) -> f64 {
        Complex64::norm_sqr(&self)
    }

    fn div_real(self, divisor: f64) -> Self {
        self / divisor
    }

    fn is_finite(self) -> bool {
        Complex64::is_finite(self)
    }
}

/// Data array paired with a same-shaped validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedArray<T, D: Dimension> {
    data: Array<T, D>,
    mask: Array<bool, D>,
}

pub type MaskedArray2<T> = MaskedArray<T, Ix2>;
pub type MaskedArray3<T> = MaskedArray<T, Ix3>;

impl<T, D: Dimension> MaskedArray<T, D> {
    pub fn new(data: Array<T, D>, mask: Array<bool, D>) -> Result<Self> {
        if data.shape() != mask.shape() {
            return Err(EnsembleError::ShapeMismatch {
                expected: data.shape().to_vec(),
                found: mask.shape().to_vec(),
            });
        }
        Ok(Self { data, mask })
    }

    /// Wrap `data` with nothing masked.
    pub fn unmasked(data: Array<T, D>) -> Self {
        let mask = Array::from_elem(data.raw_dim(), false);
        Self { data, mask }
    }

    pub fn data(&self) -> &Array<T, D> {
        &self.data
    }

    pub fn mask(&self) -> &Array<bool, D> {
        &self.mask
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn count_masked(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    pub fn into_parts(self) -> (Array<T, D>, Array<bool, D>) {
        (self.data, self.mask)
    }
}

impl<T: Copy, D: Dimension> MaskedArray<T, D> {
    /// Copy of the data with masked elements replaced by `fill`.
    pub fn filled(&self, fill: T) -> Array<T, D> {
        let mut out = self.data.clone();
        Zip::from(&mut out)
            .and(&self.mask)
            .for_each(|value, &masked| {
                if masked {
                    *value = fill;
                }
            });
        out
    }

    /// Iterator over unmasked values in logical order.
    pub fn compressed(&self) -> impl Iterator<Item = T> + '_ {
        self.data
            .iter()
            .zip(self.mask.iter())
            .filter(|(_, &masked)| !masked)
            .map(|(&value, _)| value)
    }
}

impl<T: MaskedElement> MaskedArray2<T> {
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self::unmasked(Array2::from_elem(shape, T::zero()))
    }

    /// Element-wise sum. A pixel is masked when either operand is masked; masked
    /// pixels keep this array's data.
    pub fn masked_add(&self, other: &Self) -> Result<Self> {
        if self.shape() != other.shape() {
            return Err(EnsembleError::ShapeMismatch {
                expected: self.shape().to_vec(),
                found: other.shape().to_vec(),
            });
        }

        let mut data = self.data.clone();
        let mut mask = self.mask.clone();
        Zip::from(&mut data)
            .and(&mut mask)
            .and(&other.data)
            .and(&other.mask)
            .for_each(|value, masked, &rhs, &rhs_masked| {
                *masked = *masked || rhs_masked;
                if !*masked {
                    *value = *value + rhs;
                }
            });
        Ok(Self { data, mask })
    }

    /// Element-wise division by a real array.
    ///
    /// The result is masked where either operand is masked, where the divisor
    /// is zero, or where the quotient is not finite. Masked pixels keep the
    /// numerator's data.
    pub fn masked_divide(&self, divisor: &MaskedArray2<f64>) -> Result<Self> {
        if self.shape() != divisor.shape() {
            return Err(EnsembleError::ShapeMismatch {
                expected: self.shape().to_vec(),
                found: divisor.shape().to_vec(),
            });
        }

        let mut data = self.data.clone();
        let mut mask = self.mask.clone();
        Zip::from(&mut data)
            .and(&mut mask)
            .and(&divisor.data)
            .and(&divisor.mask)
            .for_each(|value, masked, &den, &den_masked| {
                if *masked || den_masked || den == 0.0 {
                    *masked = true;
                    return;
                }
                let quotient = value.div_real(den);
                if quotient.is_finite() {
                    *value = quotient;
                } else {
                    *masked = true;
                }
            });
        Ok(Self { data, mask })
    }
}

/// Stack 2D layers along a new trailing axis: `n` layers of `(h, w)` become `(h, w, n)`.
pub fn stack_trailing<T: MaskedElement>(layers: &[MaskedArray2<T>]) -> Result<MaskedArray3<T>> {
    let first = layers.first().ok_or(EnsembleError::EmptyEnsemble)?;
    if let Some(bad) = layers.iter().find(|layer| layer.shape() != first.shape()) {
        return Err(EnsembleError::ShapeMismatch {
            expected: first.shape().to_vec(),
            found: bad.shape().to_vec(),
        });
    }

    let data_views: Vec<ArrayView2<T>> = layers.iter().map(|l| l.data.view()).collect();
    let mask_views: Vec<ArrayView2<bool>> = layers.iter().map(|l| l.mask.view()).collect();

    let data = stack(Axis(2), &data_views).map_err(|_| EnsembleError::ShapeMismatch {
        expected: first.shape().to_vec(),
        found: Vec::new(),
    })?;
    let mask = stack(Axis(2), &mask_views).map_err(|_| EnsembleError::ShapeMismatch {
        expected: first.shape().to_vec(),
        found: Vec::new(),
    })?;
    Ok(MaskedArray { data, mask })
}

impl<T: MaskedElement> MaskedArray3<T> {
    /// Number of layers along the trailing axis.
    pub fn depth(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// One layer of the stack.
    pub fn layer(&self, index: usize) -> MaskedArray2<T> {
        MaskedArray {
            data: self.data.index_axis(Axis(2), index).to_owned(),
            mask: self.mask.index_axis(Axis(2), index).to_owned(),
        }
    }

    /// Sum of unmasked values along the trailing axis.
    pub fn sum_trailing(&self) -> MaskedArray2<T> {
        let (rows, cols, _) = self.data.dim();
        let mut data = Array2::from_elem((rows, cols), T::zero());
        let mut mask = Array2::from_elem((rows, cols), false);

        Zip::from(&mut data)
            .and(&mut mask)
            .and(self.data.lanes(Axis(2)))
            .and(self.mask.lanes(Axis(2)))
            .par_for_each(|out, out_masked, values, masks| {
                let mut acc = T::zero();
                let mut count = 0usize;
                for (&value, &masked) in values.iter().zip(masks.iter()) {
                    if !masked {
                        acc = acc + value;
                        count += 1;
                    }
                }
                *out = acc;
                *out_masked = count == 0;
            });

        MaskedArray { data, mask }
    }

    /// Population standard deviation (ddof = 0) of unmasked values along the
    /// trailing axis. For complex data this is `sqrt(mean(|x - mean|²))`.
    pub fn std_trailing(&self) -> MaskedArray2<f64> {
        let (rows, cols, _) = self.data.dim();
        let mut data = Array2::<f64>::zeros((rows, cols));
        let mut mask = Array2::from_elem((rows, cols), false);

        Zip::from(&mut data)
            .and(&mut mask)
            .and(self.data.lanes(Axis(2)))
            .and(self.mask.lanes(Axis(2)))
            .par_for_each(|out, out_masked, values, masks| {
                let mut acc = T::zero();
                let mut count = 0usize;
                for (&value, &masked) in values.iter().zip(masks.iter()) {
                    if !masked {
                        acc = acc + value;
                        count += 1;
                    }
                }
                if count == 0 {
                    *out_masked = true;
                    return;
                }

                let n = count as f64;
                let mean = acc.div_real(n);
                let sum_sq: f64 = values
                    .iter()
                    .zip(masks.iter())
                    .filter(|(_, &masked)| !masked)
                    .map(|(&value, _)| (value - mean).norm_sqr())
                    .sum();
                *out = (sum_sq / n).sqrt();
            });

        MaskedArray { data, mask }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn masked(data: Array2<f64>, mask: Array2<bool>) -> MaskedArray2<f64> {
        MaskedArray::new(data, mask).unwrap()
    }

    #[test]
    fn test_new_rejects_mismatched_mask() {
        let err = MaskedArray::new(Array2::<f64>::zeros((2, 2)), Array2::from_elem((2, 3), false));
        assert!(matches!(err, Err(EnsembleError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_masked_add_propagates_mask() {
        let a = masked(array![[1.0, 2.0], [3.0, 4.0]], array![[false, true], [false, false]]);
        let b = masked(array![[10.0, 20.0], [30.0, 40.0]], array![[false, false], [true, false]]);

        let sum = a.masked_add(&b).unwrap();
        assert_eq!(sum.mask(), &array![[false, true], [true, false]]);
        assert_eq!(sum.data()[[0, 0]], 11.0);
        assert_eq!(sum.data()[[1, 1]], 44.0);
        // Masked pixels keep the left operand's data
        assert_eq!(sum.data()[[0, 1]], 2.0);
        assert_eq!(sum.data()[[1, 0]], 3.0);
    }

    #[test]
    fn test_masked_add_shape_check() {
        let a = MaskedArray2::<f64>::zeros((2, 2));
        let b = MaskedArray2::<f64>::zeros((3, 2));
        assert!(matches!(
            a.masked_add(&b),
            Err(EnsembleError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_filled_and_compressed() {
        let a = masked(array![[1.0, 2.0], [3.0, 4.0]], array![[false, true], [true, false]]);
        assert_eq!(a.filled(0.0), array![[1.0, 0.0], [0.0, 4.0]]);
        assert_eq!(a.compressed().collect::<Vec<_>>(), vec![1.0, 4.0]);
        assert_eq!(a.count_masked(), 2);
    }

    #[test]
    fn test_stack_trailing_layout() {
        let layers: Vec<MaskedArray2<f64>> = (0..3)
            .map(|k| MaskedArray::unmasked(Array2::from_elem((2, 4), k as f64)))
            .collect();
        let stacked = stack_trailing(&layers).unwrap();

        assert_eq!(stacked.shape(), &[2, 4, 3]);
        assert_eq!(stacked.depth(), 3);
        for k in 0..3 {
            assert_eq!(stacked.layer(k), layers[k]);
        }
    }

    #[test]
    fn test_stack_trailing_rejects_empty_and_mismatch() {
        assert!(matches!(
            stack_trailing::<f64>(&[]),
            Err(EnsembleError::EmptyEnsemble)
        ));

        let layers = vec![
            MaskedArray2::<f64>::zeros((2, 2)),
            MaskedArray2::<f64>::zeros((2, 3)),
        ];
        assert!(matches!(
            stack_trailing(&layers),
            Err(EnsembleError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_sum_skips_masked_values() {
        let layers = vec![
            masked(array![[1.0, 5.0]], array![[false, true]]),
            masked(array![[2.0, 7.0]], array![[false, true]]),
            masked(array![[3.0, 9.0]], array![[true, true]]),
        ];
        let sum = stack_trailing(&layers).unwrap().sum_trailing();

        assert_eq!(sum.data()[[0, 0]], 3.0);
        assert!(!sum.mask()[[0, 0]]);
        // Every input masked: output masked
        assert!(sum.mask()[[0, 1]]);
    }

    #[test]
    fn test_std_real() {
        let layers: Vec<MaskedArray2<f64>> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .map(|&v| MaskedArray::unmasked(array![[v]]))
            .collect();
        let std = stack_trailing(&layers).unwrap().std_trailing();
        assert_relative_eq!(std.data()[[0, 0]], 2.0);
    }

    #[test]
    fn test_std_complex_uses_modulus() {
        let layers = vec![
            MaskedArray::unmasked(array![[Complex64::new(1.0, 1.0)]]),
            MaskedArray::unmasked(array![[Complex64::new(-1.0, -1.0)]]),
        ];
        let std = stack_trailing(&layers).unwrap().std_trailing();
        // mean 0, |x|² = 2 for both
        assert_relative_eq!(std.data()[[0, 0]], 2.0_f64.sqrt());
    }

    #[test]
    fn test_std_ignores_masked_and_single_value_is_zero() {
        let layers = vec![
            masked(array![[1.0, 3.0]], array![[false, false]]),
            masked(array![[100.0, 5.0]], array![[true, false]]),
        ];
        let std = stack_trailing(&layers).unwrap().std_trailing();
        assert_eq!(std.data()[[0, 0]], 0.0);
        assert!(!std.mask()[[0, 0]]);
        assert_relative_eq!(std.data()[[0, 1]], 1.0);
    }

    #[test]
    fn test_masked_divide_zero_divisor() {
        let num = MaskedArray::unmasked(array![[Complex64::new(4.0, 2.0), Complex64::new(1.0, 0.0)]]);
        let den = masked(array![[2.0, 0.0]], array![[false, false]]);

        let quotient = num.masked_divide(&den).unwrap();
        assert_eq!(quotient.data()[[0, 0]], Complex64::new(2.0, 1.0));
        assert!(!quotient.mask()[[0, 0]]);
        assert!(quotient.mask()[[0, 1]]);
        assert_eq!(quotient.filled(Complex64::zero())[[0, 1]], Complex64::zero());
    }

    #[test]
    fn test_masked_divide_masked_operands() {
        let num = masked(array![[1.0, 1.0]], array![[true, false]]);
        let den = masked(array![[1.0, 1.0]], array![[false, true]]);
        let quotient = num.masked_divide(&den).unwrap();
        assert_eq!(quotient.mask(), &array![[true, true]]);
    }
}
