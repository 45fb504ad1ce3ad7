//! One-shot reduction workers.
//!
//! Each worker is a dedicated thread that receives exactly one [`WorkerTask`]
//! over its task channel, reduces the chunk it owns, sends one typed result
//! message back over its own result channel and exits. The orchestrator reads
//! every result channel once, in launch order.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use rustfft::num_complex::Complex64;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::atom::Atom;
use crate::error::{AtomError, EnsembleError, Result};
use crate::masked::MaskedArray2;

/// What a worker computes for its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionMode {
    /// Masked sum of the chunk's spatial S components.
    Stack,
    /// Per-atom spatial and Fourier S components, uncombined.
    Fourier,
}

/// Work order sent to a single worker.
pub struct WorkerTask<A> {
    pub chunk: Vec<A>,
    pub mode: ReductionMode,
    /// Global output shape every atom statistic must match.
    pub shape: (usize, usize),
}

/// Result message sent back by a worker.
#[derive(Debug)]
pub enum PartialResult {
    Stacked(MaskedArray2<f64>),
    Fourier {
        spatial: Vec<MaskedArray2<f64>>,
        fourier: Vec<MaskedArray2<Complex64>>,
    },
}

type WorkerMessage = std::result::Result<PartialResult, AtomError>;

fn check_shape(
    found: &[usize],
    shape: (usize, usize),
    what: &str,
) -> std::result::Result<(), AtomError> {
    let expected = [shape.0, shape.1];
    if found != &expected[..] {
        return Err(AtomError::Invalid(format!(
            "{what} has shape {found:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

/// Compute a chunk's contribution. This is the whole body of a worker.
pub fn reduce_chunk<A: Atom>(task: &WorkerTask<A>) -> std::result::Result<PartialResult, AtomError> {
    match task.mode {
        ReductionMode::Stack => {
            let mut stacked = MaskedArray2::<f64>::zeros(task.shape);
            for atom in &task.chunk {
                let s = atom.s_component()?;
                check_shape(s.shape(), task.shape, "s_component")?;
                stacked = s
                    .masked_add(&stacked)
                    .map_err(|e| AtomError::Invalid(e.to_string()))?;
            }
            Ok(PartialResult::Stacked(stacked))
        }
        ReductionMode::Fourier => {
            let mut spatial = Vec::with_capacity(task.chunk.len());
            let mut fourier = Vec::with_capacity(task.chunk.len());
            for atom in &task.chunk {
                let s = atom.s_component()?;
                check_shape(s.shape(), task.shape, "s_component")?;
                let s_hat = atom.s_hat_component()?;
                check_shape(s_hat.shape(), task.shape, "s_hat_component")?;
                spatial.push(s);
                fourier.push(s_hat);
            }
            Ok(PartialResult::Fourier { spatial, fourier })
        }
    }
}

struct Worker {
    id: usize,
    results: Receiver<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

/// The set of workers launched for one coaddition call.
///
/// Dropping the pool without calling [`join`](WorkerPool::join) still joins
/// every worker; with a collection timeout configured, workers that are still
/// running are detached instead.
pub struct WorkerPool {
    workers: Vec<Worker>,
    collect_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Start one worker per chunk and hand each its task.
    pub fn launch<A: Atom>(
        chunks: Vec<Vec<A>>,
        mode: ReductionMode,
        shape: (usize, usize),
        collect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(chunks.len()),
            collect_timeout,
        };

        for (worker_id, chunk) in chunks.into_iter().enumerate() {
            let (task_tx, task_rx) = bounded::<WorkerTask<A>>(1);
            let (result_tx, result_rx) = bounded::<WorkerMessage>(1);

            let handle = thread::Builder::new()
                .name(format!("coadd-worker-{worker_id}"))
                .spawn(move || {
                    let Ok(task) = task_rx.recv() else {
                        warn!("Worker {worker_id} never received its task");
                        return;
                    };
                    debug!(
                        "Worker {} reducing {} atoms in {:?} mode",
                        worker_id,
                        task.chunk.len(),
                        task.mode
                    );
                    let message = reduce_chunk(&task);
                    if result_tx.send(message).is_err() {
                        warn!("Worker {worker_id} result dropped: orchestrator stopped listening");
                    }
                })
                .map_err(|source| EnsembleError::WorkerSpawn {
                    worker: worker_id,
                    source,
                })?;

            pool.workers.push(Worker {
                id: worker_id,
                results: result_rx,
                handle: Some(handle),
            });

            let atoms = chunk.len();
            task_tx
                .send(WorkerTask { chunk, mode, shape })
                .map_err(|_| EnsembleError::WorkerFailed { worker: worker_id })?;
            info!("Started worker {worker_id} with {atoms} atoms");
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Read each worker's result exactly once, in launch order.
    ///
    /// Blocks on each worker in turn, so a slow early worker delays reading
    /// faster later ones.
    pub fn collect(&mut self) -> Result<Vec<PartialResult>> {
        let timeout = self.collect_timeout;
        let mut results = Vec::with_capacity(self.workers.len());

        for worker in &self.workers {
            let message = match timeout {
                None => worker
                    .results
                    .recv()
                    .map_err(|_| EnsembleError::WorkerFailed { worker: worker.id })?,
                Some(timeout) => match worker.results.recv_timeout(timeout) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(EnsembleError::WorkerTimeout {
                            worker: worker.id,
                            timeout,
                        })
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(EnsembleError::WorkerFailed { worker: worker.id })
                    }
                },
            };

            debug!("Collected result from worker {}", worker.id);
            let partial = message.map_err(|source| EnsembleError::Worker {
                worker: worker.id,
                source,
            })?;
            results.push(partial);
        }

        Ok(results)
    }

    /// Wait for every worker thread to exit.
    pub fn join(mut self) -> Result<()> {
        let mut first_failure = None;
        for mut worker in self.workers.drain(..) {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("Worker {} panicked", worker.id);
                    first_failure.get_or_insert(worker.id);
                }
            }
        }
        debug!("All workers joined");

        match first_failure {
            Some(worker) => Err(EnsembleError::WorkerFailed { worker }),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for mut worker in self.workers.drain(..) {
            let Some(handle) = worker.handle.take() else {
                continue;
            };
            if self.collect_timeout.is_some() && !handle.is_finished() {
                warn!("Detaching worker {} that is still running", worker.id);
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker {} panicked", worker.id);
            }
        }
    }
}
