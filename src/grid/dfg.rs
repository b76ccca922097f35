//! Distributed full grid: a dense rank-d array of samples for one task,
//! partitioned over the group's Cartesian communicator.

use crate::grid::dsg::DistributedSparseGridUniform;
use crate::grid::hierarchization::{dehierarchize_1d, hierarchize_1d, PencilExchange};
use crate::level::{BoundaryFlags, DimType, IndexType, LevelVector};

/// Number of nodal points of a full-grid axis at `level`: `2^level + 1`
/// with boundary DOFs, `2^level - 1` without.
pub fn full_axis_size(level: i64, boundary: bool) -> usize {
    if boundary {
        (1usize << level) + 1
    } else {
        (1usize << level) - 1
    }
}

/// Split `total` points as evenly as possible across `size` processes;
/// returns this process's `(start, len)`. Earlier ranks absorb the
/// remainder, one point each.
pub fn partition_1d(total: usize, rank: usize, size: usize) -> (usize, usize) {
    let base = total / size;
    let remainder = total % size;
    let len = base + if rank < remainder { 1 } else { 0 };
    let start = rank * base + rank.min(remainder);
    (start, len)
}

/// Greedy power-of-two process-grid decomposition: repeatedly double the
/// process count along whichever axis currently has the worst
/// points-per-process ratio, until `prod(p) == num_procs`. Requires
/// `num_procs` to be a power of two.
pub fn compute_decomposition(level: &LevelVector, num_procs: usize) -> Vec<usize> {
    assert!(
        num_procs.is_power_of_two(),
        "number of processes per group must be a power of two, got {num_procs}"
    );
    let dim = level.dim();
    let mut p = vec![1usize; dim];
    let mut prod = 1usize;

    while prod != num_procs {
        let (axis, _) = (0..dim)
            .map(|k| {
                let ratio = 2f64.powi(level[k] as i32) / p[k] as f64;
                (k, ratio)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        p[axis] *= 2;
        prod = p.iter().product();
    }

    p
}

/// Cartesian coordinates of a rank within a `decomposition`-shaped process
/// grid, row-major (the last axis varies fastest) — the same mapping
/// `DistributedFullGrid` uses internally, exposed so callers building a
/// per-axis communicator topology can agree with it.
pub fn rank_to_coords(mut rank: usize, decomposition: &[usize]) -> Vec<usize> {
    // Row-major (C-order): the last axis varies fastest.
    let mut coords = vec![0usize; decomposition.len()];
    for axis in (0..decomposition.len()).rev() {
        coords[axis] = rank % decomposition[axis];
        rank /= decomposition[axis];
    }
    coords
}

fn strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; sizes.len()];
    for axis in (0..sizes.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * sizes[axis + 1];
    }
    strides
}

pub struct DistributedFullGrid {
    dim: DimType,
    level: LevelVector,
    boundary: BoundaryFlags,
    decomposition: Vec<usize>,
    rank_coords: Vec<usize>,
    global_sizes: Vec<usize>,
    local_sizes: Vec<usize>,
    local_offsets: Vec<usize>,
    local_strides: Vec<usize>,
    global_strides: Vec<usize>,
    data: Vec<f64>,
    /// Per local linear index: (subspace id, offset within that
    /// subspace's local stripe). Populated by `register_uniform_sg`.
    point_subspace: Vec<usize>,
    point_offset: Vec<usize>,
    registered: bool,
}

impl DistributedFullGrid {
    pub fn new(level: LevelVector, boundary: BoundaryFlags, decomposition: Vec<usize>, rank: usize) -> Self {
        let dim = level.dim();
        assert_eq!(decomposition.len(), dim);
        assert_eq!(boundary.dim(), dim);

        let global_sizes: Vec<usize> = (0..dim)
            .map(|axis| full_axis_size(level[axis], boundary.get(axis)))
            .collect();
        let rank_coords = rank_to_coords(rank, &decomposition);

        let mut local_sizes = vec![0usize; dim];
        let mut local_offsets = vec![0usize; dim];
        for axis in 0..dim {
            let (start, len) = partition_1d(global_sizes[axis], rank_coords[axis], decomposition[axis]);
            local_offsets[axis] = start;
            local_sizes[axis] = len;
        }

        let local_len = local_sizes.iter().product();
        let local_strides = strides(&local_sizes);
        let global_strides = strides(&global_sizes);

        Self {
            dim,
            level,
            boundary,
            decomposition,
            rank_coords,
            global_sizes,
            local_sizes,
            local_offsets,
            local_strides,
            global_strides,
            data: vec![0.0; local_len],
            point_subspace: Vec::new(),
            point_offset: Vec::new(),
            registered: false,
        }
    }

    pub fn dim(&self) -> DimType {
        self.dim
    }

    pub fn level_vector(&self) -> &LevelVector {
        &self.level
    }

    pub fn boundary(&self) -> &BoundaryFlags {
        &self.boundary
    }

    pub fn decomposition(&self) -> &[usize] {
        &self.decomposition
    }

    /// This rank's coordinates in the group's Cartesian process grid.
    pub fn rank_coords(&self) -> &[usize] {
        &self.rank_coords
    }

    pub fn local_sizes(&self) -> &[usize] {
        &self.local_sizes
    }

    pub fn local_len(&self) -> usize {
        self.data.len()
    }

    pub fn elements(&self) -> &[f64] {
        &self.data
    }

    pub fn elements_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    fn local_coords(&self, local_linear: usize) -> Vec<usize> {
        let mut rem = local_linear;
        let mut coords = vec![0usize; self.dim];
        for (c, &stride) in coords.iter_mut().zip(self.local_strides.iter()) {
            *c = rem / stride;
            rem %= stride;
        }
        coords
    }

    /// Bijective global linear index for a local point.
    pub fn global_linear_index(&self, local_linear: usize) -> usize {
        let local = self.local_coords(local_linear);
        (0..self.dim)
            .map(|axis| (local[axis] + self.local_offsets[axis]) * self.global_strides[axis])
            .sum()
    }

    /// Global axis index vector of a local point.
    pub fn global_coords(&self, local_linear: usize) -> Vec<IndexType> {
        let local = self.local_coords(local_linear);
        (0..self.dim)
            .map(|axis| (local[axis] + self.local_offsets[axis]) as IndexType)
            .collect()
    }

    /// Physical coordinate in `[0, 1]^d` of a global axis index, useful
    /// for evaluating analytical test functions.
    pub fn coords_global(&self, local_linear: usize) -> Vec<f64> {
        self.global_coords(local_linear)
            .iter()
            .enumerate()
            .map(|(axis, &idx)| {
                let n = self.global_sizes[axis] as f64;
                if self.boundary.get(axis) {
                    idx as f64 / (n - 1.0)
                } else {
                    (idx as f64 + 1.0) / (n + 1.0)
                }
            })
            .collect()
    }

    /// Level vector of the subspace a global index vector belongs to:
    /// per axis, the level at which that index is first introduced.
    fn subspace_level_of(&self, global_idx: &[IndexType]) -> LevelVector {
        let mut levels = vec![0i64; self.dim];
        for axis in 0..self.dim {
            levels[axis] = axis_level_of_index(
                global_idx[axis],
                self.level[axis],
                self.boundary.get(axis),
            );
        }
        LevelVector::new(levels)
    }

    /// Offset within a subspace's local stripe a global index vector maps
    /// to: the per-axis rank of this index among all indices sharing that
    /// subspace's level.
    fn subspace_offset_of(&self, global_idx: &[IndexType], sub_level: &LevelVector) -> usize {
        let mut offset = 0usize;
        let mut stride = 1usize;
        for axis in (0..self.dim).rev() {
            let rank_in_subspace = axis_rank_in_subspace(
                global_idx[axis],
                sub_level[axis],
                self.level[axis],
                self.boundary.get(axis),
            );
            offset += rank_in_subspace * stride;
            stride *= crate::grid::dsg::subspace_axis_size(sub_level[axis], self.boundary.get(axis));
        }
        offset
    }

    /// Compute, for each local point, the (subspace, offset) it
    /// contributes to, and report the per-subspace local `dataSize` this
    /// rank requires. The caller still must MAX-allreduce these across
    /// the group so every worker agrees before allocating the shared
    /// buffer.
    pub fn register_uniform_sg(&mut self, dsg: &DistributedSparseGridUniform) -> Vec<usize> {
        let mut local_data_size = vec![0usize; dsg.num_subspaces()];
        self.point_subspace = vec![usize::MAX; self.local_len()];
        self.point_offset = vec![0; self.local_len()];

        for i in 0..self.local_len() {
            let global_idx = self.global_coords(i);
            let sub_level = self.subspace_level_of(&global_idx);
            let Some(sub_id) = dsg.index_of(&sub_level) else {
                continue;
            };
            let offset = self.subspace_offset_of(&global_idx, &sub_level);
            self.point_subspace[i] = sub_id;
            self.point_offset[i] = offset;
            local_data_size[sub_id] = local_data_size[sub_id].max(offset + 1);
        }

        self.registered = true;
        local_data_size
    }

    /// Accumulate `coeff * value` into the DSG stripe at each local
    /// point's precomputed (subspace, offset). Data-parallel, no
    /// communication.
    pub fn add_to_uniform_sg(&self, dsg: &mut DistributedSparseGridUniform, coeff: f64) {
        assert!(self.registered, "add_to_uniform_sg called before register_uniform_sg");
        for i in 0..self.local_len() {
            let sub = self.point_subspace[i];
            if sub == usize::MAX {
                continue;
            }
            let offset = self.point_offset[i];
            dsg.stripe_mut(sub)[offset] += coeff * self.data[i];
        }
    }

    /// Inverse of `add_to_uniform_sg` for `coeff = 1`: overwrite every
    /// local point from the DSG stripe.
    pub fn extract_from_uniform_sg(&mut self, dsg: &DistributedSparseGridUniform) {
        assert!(self.registered, "extract_from_uniform_sg called before register_uniform_sg");
        for i in 0..self.local_len() {
            let sub = self.point_subspace[i];
            if sub == usize::MAX {
                continue;
            }
            let offset = self.point_offset[i];
            self.data[i] = dsg.stripe(sub)[offset];
        }
    }

    fn pencil_indices(&self, axis: usize, fixed_local: &[usize]) -> Vec<usize> {
        (0..self.local_sizes[axis])
            .map(|pos| {
                let mut local = fixed_local.to_vec();
                local[axis] = pos;
                (0..self.dim).map(|a| local[a] * self.local_strides[a]).sum()
            })
            .collect()
    }

    fn for_each_pencil(&self, axis: usize, mut f: impl FnMut(&Self, &[usize])) {
        let mut fixed = vec![0usize; self.dim];
        fixed[axis] = 0;
        let other_axes: Vec<usize> = (0..self.dim).filter(|&a| a != axis).collect();
        let counts: Vec<usize> = other_axes.iter().map(|&a| self.local_sizes[a]).collect();
        let total: usize = counts.iter().product::<usize>().max(1);

        for flat in 0..total {
            let mut rem = flat;
            for (k, &a) in other_axes.iter().enumerate() {
                let stride: usize = counts[k + 1..].iter().product();
                fixed[a] = rem / stride.max(1);
                rem %= stride.max(1);
            }
            let indices = self.pencil_indices(axis, &fixed);
            f(self, &indices);
        }
    }

    fn run_transform(
        &mut self,
        exchange: &dyn PencilExchange,
        transform: impl Fn(&mut [f64], i64, bool),
    ) {
        for axis in 0..self.dim {
            let lvl = self.level[axis];
            let boundary = self.boundary.get(axis);
            let mut pencils = Vec::new();
            self.for_each_pencil(axis, |dfg, indices| {
                let segment: Vec<f64> = indices.iter().map(|&i| dfg.data[i]).collect();
                pencils.push((indices.to_vec(), segment));
            });

            for (indices, segment) in pencils {
                let mut full = exchange.allgather_pencil(axis, &segment);
                transform(&mut full, lvl, boundary);
                let local = exchange.scatter_pencil(axis, &full, segment.len(), self.local_offsets[axis]);
                for (slot, &idx) in indices.iter().enumerate() {
                    self.data[idx] = local[slot];
                }
            }
        }
    }

    /// In-place hierarchical transform, one axis at a time.
    pub fn hierarchize(&mut self, exchange: &dyn PencilExchange) {
        self.run_transform(exchange, hierarchize_1d);
    }

    /// Exact inverse of `hierarchize`.
    pub fn dehierarchize(&mut self, exchange: &dyn PencilExchange) {
        self.run_transform(exchange, dehierarchize_1d);
    }

    /// Gather this grid onto `target_rank` within the group, reassembled
    /// into one dense array in global axis order. `None` on every rank
    /// other than `target_rank`.
    pub fn gather_full_grid(&self, gather: &dyn GridGather, target_rank: usize) -> Option<Vec<f64>> {
        let buffers = gather.gather_at(&self.data, target_rank)?;
        Some(place_full_grid(&self.level, &self.boundary, &self.decomposition, &buffers))
    }
}

/// Reassemble a dense global-order array from every rank's local buffer
/// in a group's Cartesian decomposition. `rank_buffers[r]` must be rank
/// `r`'s local data in local-linear order, for the same `(level,
/// boundary, decomposition)` every rank in the group shares — each
/// rank's own placement is recomputed analytically rather than shipped
/// over the wire, since `decomposition`/`level`/`boundary` are already
/// common knowledge.
pub fn place_full_grid(
    level: &LevelVector,
    boundary: &BoundaryFlags,
    decomposition: &[usize],
    rank_buffers: &[Vec<f64>],
) -> Vec<f64> {
    let dim = level.dim();
    let global_sizes: Vec<usize> = (0..dim).map(|axis| full_axis_size(level[axis], boundary.get(axis))).collect();
    let global_strides = strides(&global_sizes);
    let total: usize = global_sizes.iter().product();
    let mut full = vec![0.0; total];

    for (rank, buf) in rank_buffers.iter().enumerate() {
        let rank_coords = rank_to_coords(rank, decomposition);
        let mut local_sizes = vec![0usize; dim];
        let mut local_offsets = vec![0usize; dim];
        for axis in 0..dim {
            let (start, len) = partition_1d(global_sizes[axis], rank_coords[axis], decomposition[axis]);
            local_offsets[axis] = start;
            local_sizes[axis] = len;
        }
        let local_strides = strides(&local_sizes);
        let local_len: usize = local_sizes.iter().product();
        assert_eq!(buf.len(), local_len, "rank {rank} full-grid buffer length mismatch");

        for (i, &value) in buf.iter().enumerate() {
            let mut rem = i;
            let mut local = vec![0usize; dim];
            for (c, &stride) in local.iter_mut().zip(local_strides.iter()) {
                *c = rem / stride;
                rem %= stride;
            }
            let global_idx: usize = (0..dim)
                .map(|axis| (local[axis] + local_offsets[axis]) * global_strides[axis])
                .sum();
            full[global_idx] = value;
        }
    }
    full
}

/// Assembles a group's full-grid gather onto one target rank. Mirrors
/// `PencilExchange`/`GlobalReduce`: a no-communication `LocalGridGather`
/// for the single-process group, and a real `mpi-transport`
/// implementation over the group's local communicator.
pub trait GridGather {
    /// Gather `local` onto `target_rank`. `Some` (one buffer per rank,
    /// indexed by rank) on `target_rank`, `None` everywhere else.
    fn gather_at(&self, local: &[f64], target_rank: usize) -> Option<Vec<Vec<f64>>>;
}

/// No-communication gather for a single-process group: the only rank is
/// always the target.
pub struct LocalGridGather;

impl GridGather for LocalGridGather {
    fn gather_at(&self, local: &[f64], target_rank: usize) -> Option<Vec<Vec<f64>>> {
        assert_eq!(target_rank, 0, "single-process group only has rank 0");
        Some(vec![local.to_vec()])
    }
}

/// The level at which global axis index `idx` (0..=2^level) is first
/// introduced in the hierarchical basis.
fn axis_level_of_index(idx: IndexType, level: i64, boundary: bool) -> i64 {
    let n = 1i64 << level;
    if idx == 0 || idx == n {
        return if boundary { 1 } else { 0 };
    }
    let mut l = level;
    let mut i = idx;
    while i % 2 == 0 {
        i /= 2;
        l -= 1;
    }
    l.max(1)
}

/// This index's rank (0-based) among all global indices sharing the same
/// subspace level along this axis, in increasing order.
fn axis_rank_in_subspace(idx: IndexType, sub_level: i64, level: i64, boundary: bool) -> usize {
    let n = 1i64 << level;
    if idx == 0 {
        return 0;
    }
    if idx == n {
        return 1;
    }
    if sub_level == 1 && boundary {
        // sub_level 1 bucket holds {0, midpoint, n} for boundary grids;
        // endpoints handled above, so this must be the midpoint.
        return 2;
    }
    let stride = 1i64 << (level - sub_level);
    ((idx / stride - 1) / 2) as usize
}

#[cfg(feature = "mpi-transport")]
pub mod transport {
    use super::GridGather;
    use mpi::datatype::PartitionMut;
    use mpi::topology::Communicator;
    use mpi::traits::*;

    /// Gathers a group's full grid over a real MPI communicator via the
    /// same all-gather-varcount idiom `MpiPencilExchange` uses (every
    /// rank ends up with every buffer), keeping only the target rank's
    /// copy rather than adding a separate single-root `Gatherv` code
    /// path.
    pub struct MpiGridGather<'a, C: Communicator> {
        pub comm: &'a C,
    }

    impl<'a, C: Communicator> GridGather for MpiGridGather<'a, C> {
        fn gather_at(&self, local: &[f64], target_rank: usize) -> Option<Vec<Vec<f64>>> {
            let size = self.comm.size() as usize;
            let my_len = local.len() as i32;
            let mut counts = vec![0i32; size];
            self.comm.all_gather_into(&my_len, &mut counts);

            let mut displs = vec![0i32; size];
            let mut running = 0i32;
            for (d, &c) in displs.iter_mut().zip(counts.iter()) {
                *d = running;
                running += c;
            }

            let mut raw = vec![0.0f64; running as usize];
            let mut partition = PartitionMut::new(&mut raw, counts.clone(), displs.clone());
            self.comm.all_gather_varcount_into(local, &mut partition);

            if self.comm.rank() as usize != target_rank {
                return None;
            }
            Some(
                (0..size)
                    .map(|r| raw[displs[r] as usize..(displs[r] + counts[r]) as usize].to_vec())
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::hierarchization::LocalPencilExchange;

    fn bilinear(coords: &[f64]) -> f64 {
        coords.iter().product::<f64>()
    }

    #[test]
    fn decomposition_is_power_of_two_product() {
        let level = LevelVector::new(vec![3, 3]);
        let p = compute_decomposition(&level, 4);
        assert_eq!(p.iter().product::<usize>(), 4);
    }

    #[test]
    fn partition_1d_covers_total_exactly() {
        let total = 17;
        let size = 4;
        let mut covered = 0;
        for r in 0..size {
            let (start, len) = partition_1d(total, r, size);
            assert_eq!(start, covered);
            covered += len;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn single_process_round_trip_matches_original_samples() {
        let level = LevelVector::new(vec![3, 2]);
        let boundary = BoundaryFlags::all(2, true);
        let decomposition = vec![1, 1];
        let mut dfg = DistributedFullGrid::new(level, boundary, decomposition, 0);

        for i in 0..dfg.local_len() {
            let c = dfg.coords_global(i);
            dfg.elements_mut()[i] = bilinear(&c);
        }
        let original = dfg.elements().to_vec();

        dfg.hierarchize(&LocalPencilExchange);
        dfg.dehierarchize(&LocalPencilExchange);

        for (a, b) in dfg.elements().iter().zip(original.iter()) {
            assert!((a - b).abs() <= 16.0 * f64::EPSILON * 8.0, "{a} vs {b}");
        }
    }

    #[test]
    fn global_linear_index_is_bijective_over_local_points() {
        let level = LevelVector::new(vec![2, 2]);
        let boundary = BoundaryFlags::all(2, true);
        let dfg = DistributedFullGrid::new(level, boundary, vec![1, 1], 0);
        let mut seen = std::collections::HashSet::new();
        for i in 0..dfg.local_len() {
            assert!(seen.insert(dfg.global_linear_index(i)));
        }
    }

    #[test]
    fn gather_full_grid_reassembles_every_rank_tile_in_global_order() {
        let level = LevelVector::new(vec![3, 2]);
        let boundary = BoundaryFlags::all(2, true);
        let decomposition = compute_decomposition(&level, 2);
        let num_procs: usize = decomposition.iter().product();

        let mut dfgs: Vec<DistributedFullGrid> = (0..num_procs)
            .map(|r| DistributedFullGrid::new(level.clone(), boundary.clone(), decomposition.clone(), r))
            .collect();
        for dfg in &mut dfgs {
            for i in 0..dfg.local_len() {
                let c = dfg.coords_global(i);
                dfg.elements_mut()[i] = bilinear(&c);
            }
        }

        let buffers: Vec<Vec<f64>> = dfgs.iter().map(|d| d.elements().to_vec()).collect();
        let full = place_full_grid(&level, &boundary, &decomposition, &buffers);

        let global_sizes = [full_axis_size(3, true), full_axis_size(2, true)];
        assert_eq!(full.len(), global_sizes[0] * global_sizes[1]);
        for dfg in &dfgs {
            for i in 0..dfg.local_len() {
                let g = dfg.global_linear_index(i);
                assert!((full[g] - dfg.elements()[i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn gather_full_grid_on_single_process_group_is_identity() {
        let level = LevelVector::new(vec![2, 2]);
        let boundary = BoundaryFlags::all(2, true);
        let mut dfg = DistributedFullGrid::new(level, boundary, vec![1, 1], 0);
        for i in 0..dfg.local_len() {
            dfg.elements_mut()[i] = i as f64;
        }
        let gathered = dfg.gather_full_grid(&LocalGridGather, 0).unwrap();
        assert_eq!(gathered, dfg.elements());
    }
}
