//! Process topology: how world ranks are carved into the manager rank,
//! process groups, node-local teams within a group, and the cross-group
//! communicator used by the global reduce.
//!
//! `GroupLayout` is pure arithmetic over rank numbers and is exercised
//! without any MPI runtime. `MpiSystem`, gated behind `mpi-transport`,
//! builds the matching real communicators the rest of the crate talks
//! through; it mirrors the six-communicator topology of the reference
//! combination-technique runtime (world / manager-workers / local / team
//! / global-reduce / masters), generalizing the synchronous split/reduce
//! style the visualization runtime this crate grew out of used for its
//! own (async) `DistributedContext`.

/// Static mapping from a worker's world rank to its group, in-group rank,
/// and team, plus the manager's reserved rank. The manager always takes
/// the last world rank; workers fill the rest group by group.
#[derive(Debug, Clone, Copy)]
pub struct GroupLayout {
    pub num_groups: usize,
    pub group_size: usize,
    pub team_size: usize,
}

impl GroupLayout {
    pub fn new(num_groups: usize, group_size: usize, team_size: usize) -> Self {
        assert!(num_groups > 0 && group_size > 0 && team_size > 0);
        assert_eq!(group_size % team_size, 0, "team_size must divide group_size");
        Self {
            num_groups,
            group_size,
            team_size,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_groups * self.group_size
    }

    /// World rank reserved for the manager: one past the last worker.
    pub fn manager_rank(&self) -> usize {
        self.num_workers()
    }

    pub fn is_manager(&self, world_rank: usize) -> bool {
        world_rank == self.manager_rank()
    }

    pub fn group_of(&self, world_rank: usize) -> usize {
        assert!(world_rank < self.num_workers(), "rank {world_rank} is not a worker");
        world_rank / self.group_size
    }

    pub fn local_rank_of(&self, world_rank: usize) -> usize {
        assert!(world_rank < self.num_workers(), "rank {world_rank} is not a worker");
        world_rank % self.group_size
    }

    pub fn team_of(&self, local_rank: usize) -> usize {
        local_rank / self.team_size
    }

    /// The `MASTER_EXCLUSIVE_SECTION` predicate: whether a worker is its
    /// group's local root, the only rank that talks directly to the
    /// manager.
    pub fn is_local_root(&self, local_rank: usize) -> bool {
        local_rank == 0
    }

    /// World rank of the local root of `group`.
    pub fn local_root_rank(&self, group: usize) -> usize {
        group * self.group_size
    }

    /// World rank that shares `local_rank` with `world_rank`'s group, in
    /// a different group — the peer this rank's global-reduce
    /// communicator talks to.
    pub fn global_reduce_peers(&self, local_rank: usize) -> Vec<usize> {
        (0..self.num_groups)
            .map(|g| g * self.group_size + local_rank)
            .collect()
    }
}

#[cfg(feature = "mpi-transport")]
pub mod transport {
    use super::GroupLayout;
    use mpi::topology::{Color, Communicator, SimpleCommunicator};
    use mpi::traits::*;

    /// The live communicators a worker process holds for the duration of
    /// a run. Construction must be called by every rank in `world`
    /// (including the manager) so the collective splits stay in sync.
    pub struct MpiSystem {
        pub world: SimpleCommunicator,
        pub layout: GroupLayout,
        /// `None` on the manager rank.
        pub local: Option<SimpleCommunicator>,
        pub team: Option<SimpleCommunicator>,
        pub global_reduce: Option<SimpleCommunicator>,
        /// Only local roots (and the manager) are members.
        pub masters: Option<SimpleCommunicator>,
    }

    impl MpiSystem {
        pub fn init(world: SimpleCommunicator, layout: GroupLayout) -> Self {
            let rank = world.rank() as usize;
            let is_manager = layout.is_manager(rank);

            let local = if is_manager {
                None
            } else {
                let group = layout.group_of(rank);
                world.split_by_color(Color::with_value(group as i32))
            };

            let team = local.as_ref().map(|local_comm| {
                let local_rank = local_comm.rank() as usize;
                let team = layout.team_of(local_rank);
                local_comm
                    .split_by_color(Color::with_value(team as i32))
                    .expect("team split must succeed for every local member")
            });

            let global_reduce = if is_manager {
                None
            } else {
                let local_rank = layout.local_rank_of(rank);
                world.split_by_color(Color::with_value(local_rank as i32))
            };

            let masters = {
                let is_root_or_manager = is_manager
                    || local
                        .as_ref()
                        .map(|l| layout.is_local_root(l.rank() as usize))
                        .unwrap_or(false);
                if is_root_or_manager {
                    world.split_by_color(Color::with_value(0))
                } else {
                    world.split_by_color(Color::undefined())
                }
            };

            Self {
                world,
                layout,
                local,
                team,
                global_reduce,
                masters,
            }
        }

        pub fn is_local_root(&self) -> bool {
            match &self.local {
                Some(local) => self.layout.is_local_root(local.rank() as usize),
                None => true, // the manager acts as its own "root"
            }
        }

        pub fn manager_world_rank(&self) -> i32 {
            self.layout.manager_rank() as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_rank_is_one_past_last_worker() {
        let layout = GroupLayout::new(4, 4, 1);
        assert_eq!(layout.manager_rank(), 16);
        assert!(layout.is_manager(16));
        assert!(!layout.is_manager(15));
    }

    #[test]
    fn group_and_local_rank_partition_workers() {
        let layout = GroupLayout::new(2, 4, 1);
        for world_rank in 0..layout.num_workers() {
            let g = layout.group_of(world_rank);
            let lr = layout.local_rank_of(world_rank);
            assert_eq!(g * layout.group_size + lr, world_rank);
        }
    }

    #[test]
    fn exactly_one_local_root_per_group() {
        let layout = GroupLayout::new(3, 8, 2);
        for g in 0..layout.num_groups {
            let root = layout.local_root_rank(g);
            assert_eq!(layout.group_of(root), g);
            assert!(layout.is_local_root(layout.local_rank_of(root)));
        }
    }

    #[test]
    fn global_reduce_peers_share_local_rank_across_groups() {
        let layout = GroupLayout::new(3, 4, 1);
        let peers = layout.global_reduce_peers(2);
        assert_eq!(peers.len(), layout.num_groups);
        for &p in &peers {
            assert_eq!(layout.local_rank_of(p), 2);
        }
    }

    #[test]
    #[should_panic]
    fn team_size_must_divide_group_size() {
        GroupLayout::new(1, 4, 3);
    }
}
