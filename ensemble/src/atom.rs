//! Interfaces to the per-image processing unit ("atom").
//!
//! PSF modeling, noise estimation and image loading live outside this crate.
//! The orchestrator only needs the statistics below, a writable zero point and
//! a cleanup hook for any per-atom on-disk cache.

use rustfft::num_complex::Complex64;

use crate::error::AtomError;
use crate::masked::MaskedArray2;

/// One input image reduced to the statistics needed for coaddition.
///
/// Workers receive their own clones of atoms, so `Clone` must produce an
/// independent copy that can be moved to another thread.
pub trait Atom: Clone + Send + 'static {
    /// Spatial-domain S statistic of this image.
    fn s_component(&self) -> Result<MaskedArray2<f64>, AtomError>;

    /// Fourier-domain S statistic of this image.
    fn s_hat_component(&self) -> Result<MaskedArray2<Complex64>, AtomError>;

    /// Flux calibration (zero point) of this image.
    fn zero_point(&self) -> f64;

    fn set_zero_point(&mut self, zero_point: f64);

    /// Release any cached on-disk state. Called once per materialized atom.
    fn cleanup(&mut self) -> Result<(), AtomError>;
}

/// Builds atoms from image references.
pub trait AtomFactory {
    /// Handle to one input image (a path, a catalog key, an in-memory frame...).
    type Reference: Clone;
    type Atom: Atom;

    /// Pixel shape `(rows, cols)` of the referenced image.
    fn image_shape(&self, reference: &Self::Reference) -> Result<(usize, usize), AtomError>;

    /// Create the atom for one image.
    fn materialize(
        &self,
        reference: &Self::Reference,
        pow_th: f64,
    ) -> Result<Self::Atom, AtomError>;
}

/// Estimates per-image zero points relative to the ensemble.
pub trait TransparencyEstimator<A: Atom> {
    /// One zero point per atom, in atom order.
    fn estimate(&self, atoms: &[A]) -> Result<Vec<f64>, AtomError>;
}
