//! Crate-wide error type. Fatal invariant violations (shape mismatches,
//! access to sparse-grid data before allocation) are asserted at the call
//! site rather than returned here — only the recoverable error kinds are
//! `Result`s.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("MPI error: {0}")]
    Mpi(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A task's `run` reported a fault (non-finite output, or its
    /// `FaultCriterion` triggered). Recoverable: the manager schedules
    /// `RECOMPUTE` on another group.
    #[error("task {0} faulted during run")]
    TaskFault(u32),

    /// A set of tasks was flagged by the SDC detector. Recoverable: the
    /// manager triggers `REINIT_TASK` for each.
    #[error("silent data corruption detected in tasks {0:?}")]
    SilentDataCorruption(Vec<u32>),
}

pub type Result<T> = std::result::Result<T, Error>;
