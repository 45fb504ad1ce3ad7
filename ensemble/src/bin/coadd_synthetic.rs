//! Coadd a generated star field and report summary statistics.
//!
//! Example:
//!   coadd_synthetic --frames 16 --size 128 --workers 4 --mode both --output /tmp/coadd

use anyhow::{Context, Result};
use array_store::ArrayStore;
use clap::{Parser, ValueEnum};
use ensemble::synthetic::{generate_field, FieldConfig, FluxRatioEstimator, SyntheticFactory};
use ensemble::{Ensemble, EnsembleConfig};
use log::info;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Coadded image only
    S,
    /// Detection statistic only
    R,
    /// R together with S
    Both,
}

/// Command line arguments for synthetic coaddition
#[derive(Parser, Debug)]
#[command(author, version, about = "Zackay & Ofek coaddition of a synthetic star field")]
struct Args {
    /// Number of frames in the ensemble
    #[arg(short = 'n', long, default_value_t = 8)]
    frames: usize,

    /// Frame edge length in pixels
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// Number of stars in the field
    #[arg(long, default_value_t = 12)]
    stars: usize,

    /// Read noise standard deviation in DN
    #[arg(long, default_value_t = 5.0)]
    read_noise: f64,

    /// Random seed for the field and its noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// JSON ensemble configuration; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of workers per coaddition call
    #[arg(short, long)]
    workers: Option<usize>,

    /// PSF power threshold in (0, 1]
    #[arg(long)]
    pow_th: Option<f64>,

    #[arg(short, long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Estimate per-frame zero points before coadding
    #[arg(long, default_value_t = false)]
    calibrate: bool,

    /// Directory for per-atom caches (a temporary directory when omitted)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Array store base name to write the results into
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<EnsembleConfig> {
    let mut config = match &args.config {
        Some(path) => EnsembleConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EnsembleConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(pow_th) = args.pow_th {
        config.pow_th = pow_th;
    }
    config.validate().context("invalid ensemble configuration")?;
    Ok(config)
}

fn summarize(name: &str, values: impl Iterator<Item = f64>) {
    let (count, sum, min, max) = values.fold(
        (0usize, 0.0, f64::INFINITY, f64::NEG_INFINITY),
        |(n, sum, min, max), v| (n + 1, sum + v, min.min(v), max.max(v)),
    );
    if count == 0 {
        info!("{name}: every pixel masked");
        return;
    }
    info!(
        "{name}: {count} valid pixels, mean {:.4}, min {:.4}, max {:.4}",
        sum / count as f64,
        min,
        max
    );
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    let field = FieldConfig {
        rows: args.size,
        cols: args.size,
        n_stars: args.stars,
        read_noise_std: args.read_noise,
        seed: args.seed,
        ..Default::default()
    };
    let (frames, transparencies) =
        generate_field(&field, args.frames).context("failed to generate star field")?;
    info!(
        "Generated {} frames of {}x{}, true transparencies {:?}",
        frames.len(),
        args.size,
        args.size,
        transparencies
    );

    // Keep the temporary directory alive until the ensemble is closed
    let temp_dir;
    let cache_dir = match &args.cache_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
            dir.clone()
        }
        None => {
            temp_dir = tempfile::tempdir().context("failed to create temporary cache dir")?;
            temp_dir.path().to_path_buf()
        }
    };

    let factory = SyntheticFactory::new(&cache_dir);
    let mut ensemble = Ensemble::with_config(factory, frames, &config)?;

    if args.calibrate {
        let zps = ensemble
            .transparencies(&FluxRatioEstimator)
            .context("zero point estimation failed")?;
        info!("Estimated zero points {:?}", zps);
    }

    let mut output = match &args.output {
        Some(base) => Some(
            ArrayStore::create(base)
                .with_context(|| format!("failed to create output store {}", base.display()))?,
        ),
        None => None,
    };

    let start = Instant::now();
    let (s, r) = match args.mode {
        Mode::S => (Some(ensemble.calculate_s(config.workers)?), None),
        Mode::R => (None, Some(ensemble.calculate_r(config.workers)?)),
        Mode::Both => {
            let (r, s) = ensemble.calculate_r_with_s(config.workers)?;
            (Some(s), Some(r))
        }
    };
    info!(
        "Coaddition with {} workers took {:?}",
        config.workers,
        start.elapsed()
    );

    if let Some(s) = &s {
        summarize("S", s.compressed());
        if let Some(store) = output.as_mut() {
            store.dump(&s.filled(0.0), "S")?;
            store.dump(s.mask(), "S_mask")?;
        }
    }
    if let Some(r) = &r {
        summarize("R (real part)", r.iter().map(|v| v.re));
        if let Some(store) = output.as_mut() {
            store.dump(r, "R")?;
        }
    }
    if let Some(store) = &output {
        info!(
            "Wrote {} arrays to {}",
            store.len(),
            store.data_path().display()
        );
    }

    ensemble.close().context("atom cleanup failed")?;
    Ok(())
}
