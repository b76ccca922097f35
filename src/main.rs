//! Entry point for the `distcomb-manager` binary. Every process in the MPI
//! job — the manager and every worker — runs this same executable and
//! branches on its world rank. Reads a TOML run configuration, places the
//! sparse-grid task set across process groups, and drives every group
//! through the classical combination-technique run loop: advance each held
//! task, hierarchize and fold it into a shared sparse grid at its
//! combination coefficient, reduce across groups, and dehierarchize the
//! combined result back onto every task.

use std::env;
use std::path::PathBuf;

use mpi::topology::Communicator;
use mpi::traits::*;

use distcomb::combicom::transport::MpiGlobalReduce;
use distcomb::config::RunConfig;
use distcomb::error::Result;
use distcomb::grid::dfg::{compute_decomposition, rank_to_coords};
use distcomb::grid::hierarchization::transport::MpiPencilExchange;
use distcomb::grid::DistributedFullGrid;
use distcomb::level::{enumerate_sparse_grid_levels, BoundaryFlags, LevelVector};
use distcomb::manager::control::{build_combi_parameters, classical_coefficients, place_tasks};
use distcomb::manager::ProcessGroupWorker;
use distcomb::mpi_system::transport::MpiSystem;
use distcomb::mpi_system::GroupLayout;
use distcomb::task::{LinearLoadModel, Task, TaskId};

fn main() -> Result<()> {
    distcomb::init_tracing();

    let universe = mpi::initialize().expect("MPI_Init failed — run under mpirun/mpiexec");
    let world = universe.world();
    let world_rank = world.rank() as usize;

    let config_path = env::args().nth(1).unwrap_or_else(|| "distcomb.toml".to_string());
    let cfg = RunConfig::from_file(&PathBuf::from(config_path))?;

    let layout = GroupLayout::new(cfg.num_groups, cfg.group_size, cfg.team_size);
    assert_eq!(
        world.size() as usize,
        layout.num_workers() + 1,
        "world size must equal num_groups * group_size + 1 for the manager"
    );

    let levels = enumerate_sparse_grid_levels(&cfg.lmin_vector(), &cfg.lmax_vector());
    let indexed_levels: Vec<(TaskId, LevelVector)> = levels
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, l)| (i as TaskId, l))
        .collect();
    let placements = place_tasks(&indexed_levels, cfg.num_groups, &LinearLoadModel);
    let coefficients = classical_coefficients(&levels, &cfg.lmin_vector(), cfg.dim);
    let decomposition = compute_decomposition(&cfg.lmax_vector(), cfg.group_size);
    let combi_params = build_combi_parameters(
        cfg.dim,
        cfg.lmin_vector(),
        cfg.lmax_vector(),
        cfg.boundary_flags(),
        decomposition.clone(),
        &placements,
        &coefficients,
    );

    let system = MpiSystem::init(world, layout);

    if system.layout.is_manager(world_rank) {
        tracing::info!(
            num_tasks = indexed_levels.len(),
            num_groups = cfg.num_groups,
            num_combinations = cfg.num_combinations,
            "manager: scheme placed, handing off to worker groups"
        );
        return Ok(());
    }

    let group = system.layout.group_of(world_rank);
    let local = system
        .local
        .as_ref()
        .expect("every non-manager rank belongs to a local group communicator");
    let local_rank = local.rank() as usize;
    let rank_coords = rank_to_coords(local_rank, &decomposition);
    let exchange = MpiPencilExchange::new(local, &decomposition, &rank_coords);

    let mut worker = ProcessGroupWorker::new();
    worker.set_combi_parameters(combi_params.clone());

    for placement in placements.iter().filter(|p| p.group == group) {
        let coeff = combi_params.coeff(placement.id);
        let task: Box<dyn Task> = Box::new(AnalyticTask::new(
            placement.id,
            placement.level.clone(),
            cfg.boundary_flags(),
            coeff,
        ));
        worker.run_first(task, cfg.group_size, local_rank)?;
    }

    let global_reduce = system
        .global_reduce
        .as_ref()
        .expect("every non-manager rank belongs to a global-reduce communicator");
    let reduce = MpiGlobalReduce {
        comm: global_reduce,
        nonblocking: cfg.nonblocking,
    };

    for round in 0..cfg.num_combinations {
        worker.combine_uniform(&exchange, &reduce);
        tracing::info!(group, round, status = ?worker.status(), "combine round complete");
    }

    Ok(())
}

/// A self-contained demonstration task: fills its grid from a fixed
/// analytical function instead of advancing a real PDE solver. Exercises
/// the full task lifecycle — allocation, one run, hierarchize/combine/
/// dehierarchize — without depending on a solver crate this binary doesn't
/// carry.
struct AnalyticTask {
    id: TaskId,
    dim: usize,
    level: LevelVector,
    boundary: BoundaryFlags,
    coeff: f64,
    grid: Option<DistributedFullGrid>,
    finished: bool,
}

impl AnalyticTask {
    fn new(id: TaskId, level: LevelVector, boundary: BoundaryFlags, coeff: f64) -> Self {
        let dim = level.dim();
        Self {
            id,
            dim,
            level,
            boundary,
            coeff,
            grid: None,
            finished: false,
        }
    }
}

fn analytic_solution(coords: &[f64]) -> f64 {
    coords.iter().map(|&x| (std::f64::consts::PI * x).sin()).product()
}

impl Task for AnalyticTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn level_vector(&self) -> &LevelVector {
        &self.level
    }

    fn boundary(&self) -> &BoundaryFlags {
        &self.boundary
    }

    fn coefficient(&self) -> f64 {
        self.coeff
    }

    fn set_coefficient(&mut self, coeff: f64) {
        self.coeff = coeff;
    }

    fn init(&mut self, group_size: usize, group_rank: usize) {
        assert!(self.grid.is_none(), "init called twice on task {}", self.id);
        let decomposition = compute_decomposition(&self.level, group_size);
        self.grid = Some(DistributedFullGrid::new(
            self.level.clone(),
            self.boundary.clone(),
            decomposition,
            group_rank,
        ));
    }

    fn run(&mut self) -> Result<()> {
        let grid = self.grid.as_mut().expect("init must run before run");
        for i in 0..grid.local_len() {
            let coords = grid.coords_global(i);
            grid.elements_mut()[i] = analytic_solution(&coords);
        }
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    fn set_zero(&mut self) {
        if let Some(grid) = &mut self.grid {
            grid.elements_mut().iter_mut().for_each(|v| *v = 0.0);
        }
    }

    fn full_grid(&self) -> &DistributedFullGrid {
        self.grid.as_ref().expect("init must run before full_grid")
    }

    fn full_grid_mut(&mut self) -> &mut DistributedFullGrid {
        self.grid.as_mut().expect("init must run before full_grid_mut")
    }
}
