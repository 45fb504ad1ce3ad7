use array_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by an [`Atom`](crate::atom::Atom) or [`AtomFactory`](crate::atom::AtomFactory).
#[derive(Error, Debug)]
pub enum AtomError {
    #[error("atom cache error: {0}")]
    Store(#[from] StoreError),

    #[error("atom I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image or statistic could not be produced.
    #[error("invalid atom: {0}")]
    Invalid(String),

    /// Errors from external atom implementations.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors produced by the ensemble orchestrator and its worker pool.
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// Operation needs at least one image.
    #[error("ensemble holds no images")]
    EmptyEnsemble,

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("index {index} out of range for ensemble of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// An array does not match the shape it is combined with.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error(transparent)]
    Atom(#[from] AtomError),

    /// A worker reported an atom failure for its chunk.
    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: AtomError,
    },

    /// A worker exited without delivering its result.
    #[error("worker {worker} exited without sending a result")]
    WorkerFailed { worker: usize },

    /// No result arrived within the configured collection timeout.
    #[error("worker {worker} produced no result within {timeout:?}")]
    WorkerTimeout { worker: usize, timeout: Duration },

    #[error("failed to spawn worker {worker}: {source}")]
    WorkerSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    /// Transparency estimator returned the wrong number of zero points.
    #[error("expected {expected} zero points, got {found}")]
    ZeroPointCount { expected: usize, found: usize },

    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = EnsembleError> = std::result::Result<T, E>;
