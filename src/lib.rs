//! Distributed combination-technique solver core: process topology,
//! task lifecycle, distributed grids, hierarchization, collective
//! reduction, the manager/worker control plane, and silent-data-corruption
//! detection.

pub mod combicom;
pub mod config;
pub mod error;
pub mod grid;
pub mod level;
pub mod manager;
pub mod mpi_system;
pub mod sdc;
pub mod task;

pub use error::{Error, Result};

/// Install the crate's tracing subscriber, reading the filter from
/// `RUST_LOG` (defaulting to `info`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
