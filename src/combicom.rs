//! Collective operations over a distributed sparse grid: the size
//! agreement pass that precedes allocation, the sum-reduce across the
//! global-reduce communicator that combines every group's local
//! contribution, and the node-local team gather/scatter that splits a
//! group's subspace set across a team before/after that reduce. The
//! reduction strategy (one blocking allreduce over the flat buffer vs. one
//! non-blocking `Iallreduce` per owned subspace followed by a single
//! `Waitall`) is controlled by `RunConfig::nonblocking`.

use crate::grid::dsg::DistributedSparseGridUniform;

/// Elementwise-max over `local_sizes` (the per-subspace `dataSize` a
/// task's registration reported) across every agreeing peer. Must run
/// before `DistributedSparseGridUniform::create_subspace_data`, since
/// not every peer necessarily has a task touching every subspace.
pub fn agree_data_sizes(local_sizes: &[usize], peer_sizes: &[Vec<usize>]) -> Vec<usize> {
    let mut sizes = local_sizes.to_vec();
    for peer in peer_sizes {
        assert_eq!(peer.len(), sizes.len());
        for (s, &p) in sizes.iter_mut().zip(peer.iter()) {
            *s = (*s).max(p);
        }
    }
    sizes
}

/// Sum-combine `dsg`'s local contribution with the same-named buffers
/// from `peers` (already-gathered raw data of equal length, one per
/// global-reduce partner), in place.
///
/// This free function performs the arithmetic identical to what a real
/// `MPI_Allreduce`/`MPI_Iallreduce` with `MPI_SUM` would produce once
/// every peer's buffer has been gathered onto this rank by the transport
/// layer; it is the part of the reduction this crate can exercise
/// without a running MPI job.
pub fn sum_reduce_in_place(dsg: &mut DistributedSparseGridUniform, peers: &[Vec<f64>]) {
    let local_len = dsg.raw_data_size();
    for peer in peers {
        assert_eq!(peer.len(), local_len, "peer buffer length does not match local DSG buffer");
    }
    let buf = dsg.raw_data_mut();
    for peer in peers {
        for (a, &b) in buf.iter_mut().zip(peer.iter()) {
            *a += b;
        }
    }
}

/// Drives a `DistributedSparseGridUniform` through the size-agreement
/// and sum-reduce steps across this rank's global-reduce peers. Kept
/// abstract so the worker state machine can be exercised without a
/// running MPI job.
///
/// Split into two steps so the caller controls ordering: `allocate` must
/// run before anything is folded into `dsg` (it agrees sizes and zero-
/// allocates the backing buffer), `reduce` runs after every local
/// contribution has been added and only sums across peers.
pub trait GlobalReduce {
    /// Agree on subspace sizes across every peer and allocate `dsg`'s
    /// backing buffer, zero-initialized. Must run before any
    /// `add_to_uniform_sg` call.
    fn allocate(&self, dsg: &mut DistributedSparseGridUniform);

    /// Sum this rank's already-folded contribution with every peer's.
    /// Must run after every local contribution has been added.
    fn reduce(&self, dsg: &mut DistributedSparseGridUniform);
}

/// The degenerate case of a single process group: there are no peers to
/// reduce with, so the local contribution already is the combined
/// result. Still responsible for allocating the buffer from the locally
/// known data sizes.
pub struct SingleGroupReduce;

impl GlobalReduce for SingleGroupReduce {
    fn allocate(&self, dsg: &mut DistributedSparseGridUniform) {
        dsg.create_subspace_data();
    }

    fn reduce(&self, _dsg: &mut DistributedSparseGridUniform) {}
}

/// Team-local subspace ownership: within a group's node-local team,
/// member `team_rank` of `team_size` owns every `team_size`-th subspace
/// starting at its own rank — a strided split of a DSG's subspace set
/// across the team. `team_size == 1` owns every subspace (the no-op
/// case: no team-level split at all).
pub fn team_owned_subspaces(num_subspaces: usize, team_rank: usize, team_size: usize) -> Vec<usize> {
    (team_rank..num_subspaces).step_by(team_size).collect()
}

/// Team gather: reassemble the full subspace-ordered buffer (one chunk
/// of `dsg.data_size(i)` floats per subspace `i`, in increasing subspace
/// order) from each team member's own buffer, which holds only the
/// chunks for the subspaces it owns (`team_owned_subspaces`), themselves
/// concatenated in increasing subspace order. Mirrors the node-local
/// consolidation a team root performs before carrying the team's
/// combined contribution into the group-wide reduce.
pub fn team_gather(dsg: &DistributedSparseGridUniform, team_size: usize, member_buffers: &[Vec<f64>]) -> Vec<f64> {
    assert_eq!(member_buffers.len(), team_size);
    let total: usize = (0..dsg.num_subspaces()).map(|i| dsg.data_size(i)).sum();
    let mut full = Vec::with_capacity(total);
    let mut cursor = vec![0usize; team_size];
    for i in 0..dsg.num_subspaces() {
        let owner = i % team_size;
        let len = dsg.data_size(i);
        let start = cursor[owner];
        full.extend_from_slice(&member_buffers[owner][start..start + len]);
        cursor[owner] += len;
    }
    full
}

/// Inverse of `team_gather`: extract `team_rank`'s owned-subspace chunks
/// back out of the full subspace-ordered buffer, in increasing subspace
/// order.
pub fn team_scatter(dsg: &DistributedSparseGridUniform, team_size: usize, team_rank: usize, full: &[f64]) -> Vec<f64> {
    let mut local = Vec::new();
    let mut offset = 0;
    for i in 0..dsg.num_subspaces() {
        let len = dsg.data_size(i);
        if i % team_size == team_rank {
            local.extend_from_slice(&full[offset..offset + len]);
        }
        offset += len;
    }
    local
}

/// Assembles/disassembles a group's team-local subspace split. Mirrors
/// the `PencilExchange`/`GlobalReduce` shape: a no-communication
/// `LocalTeamExchange` for the common `team_size == 1` case, and a real
/// `mpi-transport` implementation over the team communicator.
pub trait TeamExchange {
    fn gather(&self, dsg: &DistributedSparseGridUniform, local: &[f64]) -> Vec<f64>;
    fn scatter(&self, dsg: &DistributedSparseGridUniform, full: &[f64]) -> Vec<f64>;
}

/// No-communication team exchange for `team_size == 1`: this rank's
/// buffer already spans every subspace.
pub struct LocalTeamExchange;

impl TeamExchange for LocalTeamExchange {
    fn gather(&self, _dsg: &DistributedSparseGridUniform, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }

    fn scatter(&self, _dsg: &DistributedSparseGridUniform, full: &[f64]) -> Vec<f64> {
        full.to_vec()
    }
}

#[cfg(feature = "mpi-transport")]
pub mod transport {
    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::datatype::PartitionMut;
    use mpi::traits::*;

    /// Agree subspace sizes via `MPI_Allreduce` with `MAX` across
    /// `comm`, then allocate `dsg`'s backing buffer, zeroed. Must run
    /// before any `add_to_uniform_sg` call.
    pub fn agree_and_allocate<C: Communicator>(comm: &C, dsg: &mut DistributedSparseGridUniform) {
        let mut sizes: Vec<i32> = (0..dsg.num_subspaces()).map(|i| dsg.data_size(i) as i32).collect();
        comm.all_reduce_into(&sizes.clone(), &mut sizes, SystemOperation::max());
        for (i, &s) in sizes.iter().enumerate() {
            dsg.set_data_size(i, s as usize);
        }
        dsg.create_subspace_data();
    }

    /// Sum-reduce `dsg`'s already-populated buffer across `comm` — either
    /// one blocking `allreduce_into` or, per subspace, an
    /// `immediate_all_reduce_into` (Iallreduce) followed by waiting on
    /// every request.
    pub fn sum_reduce<C: Communicator>(comm: &C, dsg: &mut DistributedSparseGridUniform, nonblocking: bool) {
        if nonblocking {
            // Each subspace's stripe is reduced independently; a scope
            // keeps every in-flight request's buffer borrow alive until
            // `Waitall`-equivalent drop at scope exit.
            mpi::request::scope(|scope| {
                let mut requests = Vec::with_capacity(dsg.num_subspaces());
                for i in 0..dsg.num_subspaces() {
                    let stripe = dsg.stripe_mut(i);
                    if stripe.is_empty() {
                        continue;
                    }
                    let req = comm.immediate_all_reduce_into(scope, stripe, SystemOperation::sum());
                    requests.push(req);
                }
                for req in requests {
                    req.wait();
                }
            });
        } else {
            let buf = dsg.raw_data_mut();
            comm.all_reduce_into(&buf.to_vec(), buf, SystemOperation::sum());
        }
    }

    /// Adapts `agree_and_allocate`/`sum_reduce` to the `GlobalReduce`
    /// trait so `ProcessGroupWorker::combine_uniform` can drive a real
    /// MPI run without knowing about communicators.
    pub struct MpiGlobalReduce<'a, C: Communicator> {
        pub comm: &'a C,
        pub nonblocking: bool,
    }

    impl<'a, C: Communicator> super::GlobalReduce for MpiGlobalReduce<'a, C> {
        fn allocate(&self, dsg: &mut DistributedSparseGridUniform) {
            agree_and_allocate(self.comm, dsg);
        }

        fn reduce(&self, dsg: &mut DistributedSparseGridUniform) {
            sum_reduce(self.comm, dsg, self.nonblocking);
        }
    }

    /// Real team gather/scatter over a team communicator: each member
    /// contributes the concatenation of its owned-subspace chunks via a
    /// varcount all-gather, and the pure `team_gather`/`team_scatter`
    /// helpers reorder the result into (or back out of) subspace order.
    pub struct MpiTeamExchange<'a, C: Communicator> {
        pub comm: &'a C,
        pub team_size: usize,
    }

    impl<'a, C: Communicator> super::TeamExchange for MpiTeamExchange<'a, C> {
        fn gather(&self, dsg: &DistributedSparseGridUniform, local: &[f64]) -> Vec<f64> {
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

            let member_buffers: Vec<Vec<f64>> = (0..size)
                .map(|r| raw[displs[r] as usize..(displs[r] + counts[r]) as usize].to_vec())
                .collect();
            team_gather(dsg, self.team_size, &member_buffers)
        }

        fn scatter(&self, dsg: &DistributedSparseGridUniform, full: &[f64]) -> Vec<f64> {
            let team_rank = self.comm.rank() as usize;
            team_scatter(dsg, self.team_size, team_rank, full)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{BoundaryFlags, LevelVector};

    fn dsg() -> DistributedSparseGridUniform {
        DistributedSparseGridUniform::new(
            1,
            &LevelVector::new(vec![3]),
            &LevelVector::new(vec![1]),
            BoundaryFlags::all(1, true),
        )
    }

    #[test]
    fn agree_data_sizes_takes_elementwise_max() {
        let local = vec![2, 0, 5];
        let peers = vec![vec![0, 3, 1], vec![1, 1, 4]];
        assert_eq!(agree_data_sizes(&local, &peers), vec![2, 3, 5]);
    }

    #[test]
    fn sum_reduce_adds_every_peer_contribution() {
        let mut d = dsg();
        for i in 0..d.num_subspaces() {
            d.set_data_size(i, d.subspace_size(i));
        }
        d.create_subspace_data();
        let n = d.raw_data_size();
        d.raw_data_mut().iter_mut().for_each(|v| *v = 1.0);

        let peers = vec![vec![2.0; n], vec![3.0; n]];
        sum_reduce_in_place(&mut d, &peers);

        assert!(d.raw_data().iter().all(|&v| (v - 6.0).abs() < 1e-12));
    }

    #[test]
    fn single_group_reduce_allocates_without_changing_values() {
        let mut d = dsg();
        for i in 0..d.num_subspaces() {
            d.set_data_size(i, d.subspace_size(i));
        }
        SingleGroupReduce.allocate(&mut d);
        d.raw_data_mut().iter_mut().for_each(|v| *v = 5.0);
        SingleGroupReduce.reduce(&mut d);
        assert!(d.raw_data().iter().all(|&v| (v - 5.0).abs() < 1e-12));
    }

    #[test]
    fn team_owned_subspaces_is_strided_and_partitions_every_subspace() {
        let num_subspaces = 7;
        let team_size = 3;
        let mut seen = vec![false; num_subspaces];
        for rank in 0..team_size {
            for s in team_owned_subspaces(num_subspaces, rank, team_size) {
                assert!(!seen[s], "subspace {s} owned by more than one team member");
                seen[s] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "every subspace must be owned by exactly one team member");
    }

    #[test]
    fn team_owned_subspaces_is_every_subspace_when_team_size_is_one() {
        assert_eq!(team_owned_subspaces(5, 0, 1), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn team_gather_scatter_round_trip() {
        let mut d = dsg();
        for i in 0..d.num_subspaces() {
            d.set_data_size(i, d.subspace_size(i).max(1));
        }
        let team_size = 2;

        let full: Vec<f64> = {
            let total: usize = (0..d.num_subspaces()).map(|i| d.data_size(i)).sum();
            (0..total).map(|i| i as f64).collect()
        };

        let member_buffers: Vec<Vec<f64>> = (0..team_size).map(|r| team_scatter(&d, team_size, r, &full)).collect();
        let reassembled = team_gather(&d, team_size, &member_buffers);
        assert_eq!(reassembled, full);
    }

    #[test]
    fn team_gather_is_identity_when_team_size_is_one() {
        let mut d = dsg();
        for i in 0..d.num_subspaces() {
            d.set_data_size(i, d.subspace_size(i).max(1));
        }
        let total: usize = (0..d.num_subspaces()).map(|i| d.data_size(i)).sum();
        let full: Vec<f64> = (0..total).map(|i| i as f64).collect();
        assert_eq!(team_gather(&d, 1, std::slice::from_ref(&full)), full);
    }
}
