//! Parallel coaddition of astronomical image ensembles.
//!
//! Implements the proper coaddition statistics of Zackay & Ofek: the coadded
//! image `S` and the detection statistic `R`. Each input image is reduced to an
//! [`Atom`] by an external [`AtomFactory`]; the [`Ensemble`] partitions the atoms
//! into chunks, reduces every chunk on its own worker thread and combines the
//! partial results in the orchestrator.
//!
//! [`synthetic`] provides a self-contained atom implementation over generated
//! star fields, cached on disk in an [`array_store::ArrayStore`].

pub mod atom;
pub mod chunk;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod fft;
pub mod masked;
pub mod synthetic;
pub mod worker;

pub use atom::{Atom, AtomFactory, TransparencyEstimator};
pub use chunk::{chunk_bounds, chunk_it};
pub use config::EnsembleConfig;
pub use ensemble::{Ensemble, RDebug};
pub use error::{AtomError, EnsembleError, Result};
pub use masked::{MaskedArray, MaskedArray2, MaskedArray3};
pub use worker::{PartialResult, ReductionMode, WorkerPool};
