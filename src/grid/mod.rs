//! Grid data structures: the per-task distributed full grid, the shared
//! distributed sparse grid used for combination, and the hierarchical
//! transform connecting them.

pub mod dfg;
pub mod dsg;
pub mod hierarchization;

pub use dfg::DistributedFullGrid;
pub use dsg::DistributedSparseGridUniform;
