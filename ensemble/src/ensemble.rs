//! The ensemble orchestrator.
//!
//! An [`Ensemble`] owns the ordered list of image references and the lazily
//! built atoms for them. The coaddition entry points split the atoms into
//! chunks, fan them out to a fresh [`WorkerPool`] and combine the partial
//! results (Zackay & Ofek 2015, arXiv:1512.06872 and arXiv:1512.06879).

use log::{debug, info, warn};
use ndarray::Array2;
use rustfft::num_complex::Complex64;
use rustfft::num_traits::Zero;
use std::time::Duration;

use crate::atom::{Atom, AtomFactory, TransparencyEstimator};
use crate::chunk::chunk_it;
use crate::config::{validate_pow_th, EnsembleConfig};
use crate::error::{AtomError, EnsembleError, Result};
use crate::fft::ifft2;
use crate::masked::{stack_trailing, MaskedArray2, MaskedArray3};
use crate::worker::{PartialResult, ReductionMode, WorkerPool};

/// Every intermediate of the R computation, for inspection.
#[derive(Debug, Clone)]
pub struct RDebug {
    /// Per-atom Fourier S statistics stacked along the trailing axis.
    pub s_hat_stack: MaskedArray3<Complex64>,
    /// Per-atom spatial S statistics stacked along the trailing axis.
    pub s_stack: MaskedArray3<f64>,
    pub s_hat: MaskedArray2<Complex64>,
    pub s: MaskedArray2<f64>,
    pub r_hat: MaskedArray2<Complex64>,
    pub r: Array2<Complex64>,
}

struct AtomCache<A> {
    revision: u64,
    atoms: Vec<A>,
}

/// Ordered collection of images combined as one coadd.
///
/// The image list behaves as an ordered container. Every mutation bumps a
/// revision counter; the atom cache is rebuilt on the next access whenever its
/// revision is stale, so even same-length replacements are picked up.
///
/// Atoms are cleaned up exactly once: when a stale cache is replaced, on
/// [`cleanup`](Ensemble::cleanup)/[`close`](Ensemble::close), or on drop.
pub struct Ensemble<F: AtomFactory> {
    factory: F,
    images: Vec<F::Reference>,
    pow_th: f64,
    global_shape: (usize, usize),
    collect_timeout: Option<Duration>,
    revision: u64,
    cache: Option<AtomCache<F::Atom>>,
    zero_points: Option<Vec<f64>>,
}

impl<F: AtomFactory> Ensemble<F> {
    /// Build an ensemble; the first image fixes the output shape.
    pub fn new(factory: F, images: Vec<F::Reference>, pow_th: f64) -> Result<Self> {
        validate_pow_th(pow_th)?;
        let first = images.first().ok_or(EnsembleError::EmptyEnsemble)?;
        let global_shape = factory.image_shape(first)?;
        info!(
            "Ensemble of {} images with global shape {:?}",
            images.len(),
            global_shape
        );

        Ok(Self {
            factory,
            images,
            pow_th,
            global_shape,
            collect_timeout: None,
            revision: 0,
            cache: None,
            zero_points: None,
        })
    }

    /// Build an ensemble with parameters taken from a validated config.
    pub fn with_config(factory: F, images: Vec<F::Reference>, config: &EnsembleConfig) -> Result<Self> {
        config.validate()?;
        let mut ensemble = Self::new(factory, images, config.pow_th)?;
        ensemble.collect_timeout = config.collect_timeout();
        Ok(ensemble)
    }

    /// Bound the wait for each worker's result. `None` waits indefinitely.
    pub fn set_collect_timeout(&mut self, timeout: Option<Duration>) {
        self.collect_timeout = timeout;
    }

    pub fn global_shape(&self) -> (usize, usize) {
        self.global_shape
    }

    pub fn pow_th(&self) -> f64 {
        self.pow_th
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Number of mutations applied to the image list so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // =========================================================================
    // Ordered container over the image references
    // =========================================================================

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&F::Reference> {
        self.images.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, F::Reference> {
        self.images.iter()
    }

    fn check_index(&self, index: usize, len: usize) -> Result<()> {
        if index >= len {
            return Err(EnsembleError::IndexOutOfRange {
                index,
                len: self.images.len(),
            });
        }
        Ok(())
    }

    /// Replace the reference at `index`, returning the old one.
    pub fn set(&mut self, index: usize, reference: F::Reference) -> Result<F::Reference> {
        self.check_index(index, self.images.len())?;
        self.revision += 1;
        Ok(std::mem::replace(&mut self.images[index], reference))
    }

    pub fn remove(&mut self, index: usize) -> Result<F::Reference> {
        self.check_index(index, self.images.len())?;
        self.revision += 1;
        Ok(self.images.remove(index))
    }

    /// Insert before `index`; `index == len()` appends.
    pub fn insert(&mut self, index: usize, reference: F::Reference) -> Result<()> {
        self.check_index(index, self.images.len() + 1)?;
        self.revision += 1;
        self.images.insert(index, reference);
        Ok(())
    }

    pub fn push(&mut self, reference: F::Reference) {
        self.revision += 1;
        self.images.push(reference);
    }

    // =========================================================================
    // Atoms
    // =========================================================================

    /// Atoms for the current image list, built on first access and rebuilt
    /// after any mutation of the list.
    pub fn atoms(&mut self) -> Result<&[F::Atom]> {
        Ok(&*self.atoms_mut()?)
    }

    /// Atom lifecycle (cleanup) stays with the ensemble.
    pub(crate) fn atoms_mut(&mut self) -> Result<&mut [F::Atom]> {
        let stale = match &self.cache {
            Some(cache) => cache.revision != self.revision,
            None => true,
        };

        if stale {
            if let Some(old) = self.cache.take() {
                debug!(
                    "Image list changed (revision {} -> {}), rebuilding atoms",
                    old.revision, self.revision
                );
                clean_atoms(old.atoms)?;
                self.zero_points = None;
            }

            let mut atoms = Vec::with_capacity(self.images.len());
            for (idx, reference) in self.images.iter().enumerate() {
                match self.factory.materialize(reference, self.pow_th) {
                    Ok(atom) => atoms.push(atom),
                    Err(e) => {
                        warn!(
                            "Materializing atom {idx} failed, releasing {} built atoms",
                            atoms.len()
                        );
                        if let Err(cleanup_err) = clean_atoms(atoms) {
                            warn!("Cleanup after failed materialization: {cleanup_err}");
                        }
                        return Err(e.into());
                    }
                }
            }
            debug!("Materialized {} atoms", atoms.len());

            self.cache = Some(AtomCache {
                revision: self.revision,
                atoms,
            });
        }

        match self.cache.as_mut() {
            Some(cache) => Ok(&mut cache.atoms),
            None => Err(EnsembleError::EmptyEnsemble),
        }
    }

    /// Number of atoms currently materialized, without building any.
    pub fn materialized_atoms(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.atoms.len())
    }

    /// Estimate zero points, write them onto the atoms and keep a copy.
    pub fn transparencies<E>(&mut self, estimator: &E) -> Result<Vec<f64>>
    where
        E: TransparencyEstimator<F::Atom>,
    {
        let atoms = self.atoms_mut()?;
        let zps = estimator.estimate(atoms)?;
        if zps.len() != atoms.len() {
            return Err(EnsembleError::ZeroPointCount {
                expected: atoms.len(),
                found: zps.len(),
            });
        }

        for (atom, &zp) in atoms.iter_mut().zip(zps.iter()) {
            atom.set_zero_point(zp);
        }
        self.zero_points = Some(zps.clone());
        Ok(zps)
    }

    /// Zero points from the last [`transparencies`](Ensemble::transparencies)
    /// call, if the atoms have not been rebuilt since.
    pub fn zero_points(&self) -> Option<&[f64]> {
        self.zero_points.as_deref()
    }

    fn launch(&mut self, workers: usize, mode: ReductionMode) -> Result<WorkerPool> {
        let shape = self.global_shape;
        let timeout = self.collect_timeout;
        let chunks = chunk_it(self.atoms()?, workers)?;
        info!(
            "Launching {} workers ({} requested) in {:?} mode",
            chunks.len(),
            workers,
            mode
        );
        WorkerPool::launch(chunks, mode, shape, timeout)
    }

    // =========================================================================
    // Coaddition
    // =========================================================================

    /// Coadded S image: masked sum of every atom's spatial S component.
    pub fn calculate_s(&mut self, workers: usize) -> Result<MaskedArray2<f64>> {
        let mut pool = self.launch(workers, ReductionMode::Stack)?;

        let mut s = MaskedArray2::<f64>::zeros(self.global_shape);
        for partial in pool.collect()? {
            match partial {
                PartialResult::Stacked(s_comp) => {
                    s = s_comp.masked_add(&s)?;
                }
                PartialResult::Fourier { .. } => {
                    return Err(EnsembleError::Atom(AtomError::Invalid(
                        "stack worker returned fourier components".to_string(),
                    )))
                }
            }
        }

        debug!("S calculated, joining workers");
        pool.join()?;
        Ok(s)
    }

    /// Detection statistic R.
    pub fn calculate_r(&mut self, workers: usize) -> Result<Array2<Complex64>> {
        Ok(self.calculate_r_debug(workers)?.r)
    }

    /// R together with the coadded S.
    pub fn calculate_r_with_s(
        &mut self,
        workers: usize,
    ) -> Result<(Array2<Complex64>, MaskedArray2<f64>)> {
        let out = self.calculate_r_debug(workers)?;
        Ok((out.r, out.s))
    }

    /// R with every intermediate array.
    ///
    /// `R = ifft2(sum(S_hat) / std(S_hat))`, reducing over atoms. Pixels where
    /// the deviation is zero or masked are masked in `R_hat` and enter the
    /// inverse transform as zero.
    pub fn calculate_r_debug(&mut self, workers: usize) -> Result<RDebug> {
        let mut pool = self.launch(workers, ReductionMode::Fourier)?;

        let mut s_list = Vec::with_capacity(self.len());
        let mut s_hat_list = Vec::with_capacity(self.len());
        for partial in pool.collect()? {
            match partial {
                PartialResult::Fourier { spatial, fourier } => {
                    s_list.extend(spatial);
                    s_hat_list.extend(fourier);
                }
                PartialResult::Stacked(_) => {
                    return Err(EnsembleError::Atom(AtomError::Invalid(
                        "fourier worker returned a stacked image".to_string(),
                    )))
                }
            }
        }

        let s_stack = stack_trailing(&s_list)?;
        let s_hat_stack = stack_trailing(&s_hat_list)?;

        let s = s_stack.sum_trailing();
        let s_hat = s_hat_stack.sum_trailing();
        let hat_std = s_hat_stack.std_trailing();
        let r_hat = s_hat.masked_divide(&hat_std)?;

        let masked = r_hat.count_masked();
        if masked > 0 {
            warn!("{masked} R_hat pixels masked (zero or undefined deviation)");
        }
        let r = ifft2(&r_hat.filled(Complex64::zero()).view());

        debug!("R calculated, joining workers");
        pool.join()?;

        Ok(RDebug {
            s_hat_stack,
            s_stack,
            s_hat,
            s,
            r_hat,
            r,
        })
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Run every materialized atom's cleanup hook. Later calls are no-ops
    /// until atoms are built again.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.cache.take() {
            Some(cache) => {
                info!("Cleaning up {} atoms", cache.atoms.len());
                clean_atoms(cache.atoms)
            }
            None => Ok(()),
        }
    }

    /// End the ensemble's life, surfacing cleanup errors.
    pub fn close(mut self) -> Result<()> {
        self.cleanup()
    }
}

/// Clean every atom, even after a failure, and report the first error.
fn clean_atoms<A: Atom>(atoms: Vec<A>) -> Result<()> {
    let mut first_error = None;
    for (idx, mut atom) in atoms.into_iter().enumerate() {
        if let Err(e) = atom.cleanup() {
            warn!("Cleanup of atom {idx} failed: {e}");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

impl<F: AtomFactory> Drop for Ensemble<F> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Ensemble cleanup on drop failed: {e}");
        }
    }
}
