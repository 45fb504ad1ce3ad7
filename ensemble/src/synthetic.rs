//! Synthetic star fields and a disk-cached atom built from them.
//!
//! NOTE: the generated fields are not a realistic sky. They exist so the
//! coaddition pipeline can be exercised end to end without an external image
//! source or PSF model.

use array_store::ArrayStore;
use log::debug;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rustfft::num_complex::Complex64;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::atom::{Atom, AtomFactory, TransparencyEstimator};
use crate::error::AtomError;
use crate::fft::fft2_real;
use crate::masked::{MaskedArray, MaskedArray2};

const PIXELS_ID: &str = "pixels";
const MASK_ID: &str = "mask";

/// One synthetic exposure.
#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    pub label: String,
    pub pixels: Array2<f64>,
    /// `true` marks a bad pixel. `None` means every pixel is valid.
    pub mask: Option<Array2<bool>>,
    /// Per-pixel noise variance used to weight the image
    pub noise_variance: f64,
}

impl SyntheticFrame {
    /// Frame with no bad pixels and unit noise variance.
    pub fn new(label: impl Into<String>, pixels: Array2<f64>) -> Self {
        Self {
            label: label.into(),
            pixels,
            mask: None,
            noise_variance: 1.0,
        }
    }

    pub fn with_mask(mut self, mask: Array2<bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_noise_variance(mut self, noise_variance: f64) -> Self {
        self.noise_variance = noise_variance;
        self
    }
}

/// Gaussian star placed in every frame of a field.
#[derive(Debug, Clone)]
pub struct StarParams {
    pub x: f64,
    pub y: f64,
    pub peak_flux: f64,
    pub fwhm: f64, // pixels
}

/// Parameters for [`generate_field`].
#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub rows: usize,
    pub cols: usize,
    pub n_stars: usize,
    pub sky_level: f64,
    pub read_noise_std: f64,
    /// Frame-to-frame transparency is drawn uniformly from `[min_transparency, 1]`
    pub min_transparency: f64,
    pub seed: u64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            rows: 64,
            cols: 64,
            n_stars: 12,
            sky_level: 100.0,
            read_noise_std: 5.0,
            min_transparency: 0.7,
            seed: 42,
        }
    }
}

/// Star positions shared by every frame generated from `config`.
pub fn field_stars(config: &FieldConfig) -> Vec<StarParams> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    (0..config.n_stars)
        .map(|_| StarParams {
            x: rng.gen_range(0.0..config.cols as f64),
            y: rng.gen_range(0.0..config.rows as f64),
            peak_flux: rng.gen_range(500.0..5000.0),
            fwhm: rng.gen_range(2.0..4.0),
        })
        .collect()
}

/// Render one noisy exposure of `stars` scaled by `transparency`.
pub fn render_frame(
    config: &FieldConfig,
    stars: &[StarParams],
    transparency: f64,
    seed: u64,
) -> Result<Array2<f64>, AtomError> {
    let mut image = Array2::from_elem((config.rows, config.cols), config.sky_level);

    for star in stars {
        // FWHM = 2.355 * sigma
        let sigma = star.fwhm / 2.355;
        let sigma2 = sigma * sigma;
        let radius = (3.0 * sigma).ceil() as i64;

        let y_min = (star.y as i64 - radius).max(0) as usize;
        let y_max = (star.y as i64 + radius + 1).min(config.rows as i64) as usize;
        let x_min = (star.x as i64 - radius).max(0) as usize;
        let x_max = (star.x as i64 + radius + 1).min(config.cols as i64) as usize;

        for y in y_min..y_max {
            for x in x_min..x_max {
                let dx = x as f64 - star.x;
                let dy = y as f64 - star.y;
                let r2 = dx * dx + dy * dy;
                image[[y, x]] += transparency * star.peak_flux * (-r2 / (2.0 * sigma2)).exp();
            }
        }
    }

    if config.read_noise_std > 0.0 {
        let noise = Normal::new(0.0, config.read_noise_std)
            .map_err(|e| AtomError::Invalid(format!("read noise: {e}")))?;
        let mut rng = StdRng::seed_from_u64(seed);
        image.mapv_inplace(|v| v + noise.sample(&mut rng));
    }

    Ok(image)
}

/// Generate `count` exposures of one star field with varying transparency.
///
/// Returns the frames together with the transparency each was rendered with.
pub fn generate_field(
    config: &FieldConfig,
    count: usize,
) -> Result<(Vec<SyntheticFrame>, Vec<f64>), AtomError> {
    if !(0.0..=1.0).contains(&config.min_transparency) {
        return Err(AtomError::Invalid(format!(
            "min_transparency {} outside [0, 1]",
            config.min_transparency
        )));
    }

    let stars = field_stars(config);
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let variance = config.read_noise_std.powi(2).max(f64::MIN_POSITIVE);

    let mut frames = Vec::with_capacity(count);
    let mut transparencies = Vec::with_capacity(count);
    for idx in 0..count {
        let transparency = rng.gen_range(config.min_transparency..=1.0);
        let frame_seed = config.seed.wrapping_add(1000 + idx as u64);
        let pixels = render_frame(config, &stars, transparency, frame_seed)?;
        frames.push(
            SyntheticFrame::new(format!("frame{idx:03}"), pixels).with_noise_variance(variance),
        );
        transparencies.push(transparency);
    }
    debug!(
        "Generated {} frames of {}x{} with {} stars",
        count,
        config.rows,
        config.cols,
        stars.len()
    );
    Ok((frames, transparencies))
}

/// Atom over a [`SyntheticFrame`] whose pixels and mask are cached on disk.
///
/// A point-like PSF is assumed, so the matched-filter statistic reduces to the
/// inverse-variance weighted image: `S = zp * M / var`.
#[derive(Debug, Clone)]
pub struct SyntheticAtom {
    label: String,
    store: Option<ArrayStore>,
    noise_variance: f64,
    zero_point: f64,
    pow_th: f64,
}

impl SyntheticAtom {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pow_th(&self) -> f64 {
        self.pow_th
    }

    /// Base name of the on-disk cache, `None` once cleaned up.
    pub fn store_name(&self) -> Option<&Path> {
        self.store.as_ref().map(|store| store.name())
    }

    fn store(&self) -> Result<&ArrayStore, AtomError> {
        self.store
            .as_ref()
            .ok_or_else(|| AtomError::Invalid(format!("atom {} already cleaned up", self.label)))
    }

    /// Cached pixels and bad-pixel mask.
    pub fn image(&self) -> Result<MaskedArray2<f64>, AtomError> {
        let store = self.store()?;
        let pixels = store.load_array2::<f64>(PIXELS_ID)?;
        let mask = store.load_array2::<bool>(MASK_ID)?;
        MaskedArray::new(pixels, mask).map_err(|e| AtomError::Invalid(e.to_string()))
    }
}

impl Atom for SyntheticAtom {
    fn s_component(&self) -> Result<MaskedArray2<f64>, AtomError> {
        let weight = self.zero_point / self.noise_variance;
        let (pixels, mask) = self.image()?.into_parts();
        MaskedArray::new(pixels.mapv(|v| v * weight), mask)
            .map_err(|e| AtomError::Invalid(e.to_string()))
    }

    fn s_hat_component(&self) -> Result<MaskedArray2<Complex64>, AtomError> {
        let s = self.s_component()?;
        Ok(MaskedArray::unmasked(fft2_real(&s.filled(0.0).view())))
    }

    fn zero_point(&self) -> f64 {
        self.zero_point
    }

    fn set_zero_point(&mut self, zero_point: f64) {
        self.zero_point = zero_point;
    }

    fn cleanup(&mut self) -> Result<(), AtomError> {
        if let Some(store) = self.store.take() {
            debug!("Removing cache of atom {}", self.label);
            store.remove_files()?;
        }
        Ok(())
    }
}

/// Builds [`SyntheticAtom`]s, caching each frame under `cache_dir`.
#[derive(Debug)]
pub struct SyntheticFactory {
    cache_dir: PathBuf,
    materialized: AtomicUsize,
}

impl SyntheticFactory {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            materialized: AtomicUsize::new(0),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Number of atoms built so far.
    pub fn materialized(&self) -> usize {
        self.materialized.load(Ordering::SeqCst)
    }
}

impl AtomFactory for SyntheticFactory {
    type Reference = SyntheticFrame;
    type Atom = SyntheticAtom;

    fn image_shape(&self, frame: &SyntheticFrame) -> Result<(usize, usize), AtomError> {
        Ok(frame.pixels.dim())
    }

    fn materialize(&self, frame: &SyntheticFrame, pow_th: f64) -> Result<SyntheticAtom, AtomError> {
        if !(frame.noise_variance > 0.0 && frame.noise_variance.is_finite()) {
            return Err(AtomError::Invalid(format!(
                "frame {} has noise variance {}",
                frame.label, frame.noise_variance
            )));
        }
        let mask = match &frame.mask {
            Some(mask) if mask.dim() != frame.pixels.dim() => {
                return Err(AtomError::Invalid(format!(
                    "frame {} mask shape {:?} does not match pixels {:?}",
                    frame.label,
                    mask.dim(),
                    frame.pixels.dim()
                )))
            }
            Some(mask) => mask.clone(),
            None => Array2::from_elem(frame.pixels.dim(), false),
        };

        let serial = self.materialized.fetch_add(1, Ordering::SeqCst);
        let name = self.cache_dir.join(format!("atom{serial:05}"));
        let mut store = ArrayStore::create(&name)?;
        store.dump(&frame.pixels, PIXELS_ID)?;
        store.dump(&mask, MASK_ID)?;
        debug!("Cached frame {} at {}", frame.label, name.display());

        Ok(SyntheticAtom {
            label: frame.label.clone(),
            store: Some(store),
            noise_variance: frame.noise_variance,
            zero_point: 1.0,
            pow_th,
        })
    }
}

/// Median of finite values; `None` when there are none.
fn median(values: &[f64]) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.total_cmp(b));
    let mid = valid.len() / 2;
    Some(if valid.len() % 2 == 0 {
        (valid[mid - 1] + valid[mid]) / 2.0
    } else {
        valid[mid]
    })
}

/// Zero points from background-subtracted total flux, relative to the first atom.
#[derive(Debug, Clone, Copy, Default)]
pub struct FluxRatioEstimator;

impl FluxRatioEstimator {
    fn flux(atom: &SyntheticAtom) -> Result<f64, AtomError> {
        let image = atom.image()?;
        let valid: Vec<f64> = image.compressed().collect();
        let background = median(&valid)
            .ok_or_else(|| AtomError::Invalid(format!("atom {} has no valid pixels", atom.label)))?;
        Ok(valid.iter().map(|v| v - background).sum())
    }
}

impl TransparencyEstimator<SyntheticAtom> for FluxRatioEstimator {
    fn estimate(&self, atoms: &[SyntheticAtom]) -> Result<Vec<f64>, AtomError> {
        let fluxes = atoms.iter().map(Self::flux).collect::<Result<Vec<_>, _>>()?;
        let reference = match fluxes.first() {
            Some(&flux) if flux > 0.0 => flux,
            Some(&flux) => {
                return Err(AtomError::Invalid(format!(
                    "reference atom flux {flux} is not positive"
                )))
            }
            None => return Ok(Vec::new()),
        };
        Ok(fluxes.iter().map(|flux| flux / reference).collect())
    }
}
