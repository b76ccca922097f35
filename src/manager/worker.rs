//! `ProcessGroupWorker`: the state machine every worker process in a
//! group runs. Owns the group's task list and combined sparse grid;
//! dispatches on the `SignalType` its local root broadcasts and reports
//! a `StatusType` back.

use crate::combicom::GlobalReduce;
use crate::error::{Error, Result};
use crate::grid::dfg::{DistributedFullGrid, GridGather};
use crate::grid::dsg::DistributedSparseGridUniform;
use crate::grid::hierarchization::PencilExchange;
use crate::manager::signal::StatusType;
use crate::sdc::{beta_at_cell, compute_beta, filter_sdc, generate_pairs, PairBeta};
use crate::task::{CombiParameters, Task, TaskId};

pub struct ProcessGroupWorker {
    tasks: Vec<Box<dyn Task>>,
    current_task: Option<usize>,
    status: StatusType,
    combined_dsg: Option<DistributedSparseGridUniform>,
    combi_parameters: Option<CombiParameters>,
}

impl Default for ProcessGroupWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroupWorker {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current_task: None,
            status: StatusType::Wait,
            combined_dsg: None,
            combi_parameters: None,
        }
    }

    pub fn status(&self) -> StatusType {
        self.status
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    pub fn set_combi_parameters(&mut self, params: CombiParameters) {
        self.combi_parameters = Some(params);
    }

    fn combi_parameters(&self) -> &CombiParameters {
        self.combi_parameters
            .as_ref()
            .expect("combi parameters must be set via UpdateCombiParameters before combining")
    }

    /// Handle `RUN_FIRST`: adopt a brand-new task, initialize its grid,
    /// and run it to completion of its first batch of steps.
    pub fn run_first(&mut self, mut task: Box<dyn Task>, group_size: usize, group_rank: usize) -> Result<()> {
        task.init(group_size, group_rank);
        self.status = StatusType::Busy;
        let result = task.run();
        self.tasks.push(task);
        self.current_task = Some(self.tasks.len() - 1);
        result.inspect_err(|_| {
            self.status = StatusType::Fail;
        })
    }

    /// Handle `RUN_NEXT`: reset every held task's `finished` flag and
    /// resume running them in order.
    pub fn run_next(&mut self) -> Result<()> {
        assert!(!self.tasks.is_empty(), "RUN_NEXT with no tasks held");
        self.status = StatusType::Busy;
        for t in &mut self.tasks {
            t.set_finished(false);
        }
        for i in 0..self.tasks.len() {
            self.current_task = Some(i);
            if let Err(e) = self.tasks[i].run() {
                self.status = StatusType::Fail;
                return Err(e);
            }
        }
        self.status = StatusType::Wait;
        Ok(())
    }

    /// Handle `ADD_TASK`: adopt a new task zeroed out, marked finished —
    /// it gets its real initial solution at the next combine.
    pub fn add_task(&mut self, mut task: Box<dyn Task>, group_size: usize, group_rank: usize) {
        assert!(
            self.tasks.iter().all(|t| t.id() != task.id()),
            "task {} already held by this group",
            task.id()
        );
        task.init(group_size, group_rank);
        task.set_zero();
        task.set_finished(true);
        self.tasks.push(task);
        self.status = StatusType::Busy;
    }

    /// Handle `SYNC_TASKS`: hand every held task back to the caller for
    /// return to the manager (the manager transport lives above this module).
    pub fn drain_tasks_for_sync(&mut self) -> Vec<Box<dyn Task>> {
        std::mem::take(&mut self.tasks)
    }

    /// Finish processing a signal: run any task still unfinished, then
    /// settle on `Wait` (unless a fault already set `Fail`).
    pub fn ready(&mut self) {
        for i in 0..self.tasks.len() {
            if !self.tasks[i].is_finished() {
                self.status = StatusType::Busy;
                self.current_task = Some(i);
                if self.tasks[i].run().is_err() {
                    self.status = StatusType::Fail;
                }
            }
        }
        if self.status != StatusType::Fail {
            self.status = StatusType::Wait;
        }
        self.current_task = None;
    }

    /// Handle `COMBINE`: hierarchize every held task's grid, fold it
    /// into a fresh sparse grid at its combination coefficient, reduce
    /// globally, then extract and dehierarchize every grid from the
    /// combined result.
    pub fn combine_uniform(&mut self, exchange: &dyn PencilExchange, reduce: &dyn GlobalReduce) {
        assert!(!self.tasks.is_empty(), "COMBINE with no tasks held");
        let params = self.combi_parameters().clone();

        // The sparse grid's levels span one level coarser than the
        // component grids it combines, per the classical scheme: a
        // combined grid at level l only has meaningful surpluses up to l-1.
        let mut sg_lmax = params.lmax.clone();
        for axis in 0..sg_lmax.dim() {
            if sg_lmax[axis] > 1 {
                sg_lmax[axis] -= 1;
            }
        }

        let mut dsg = DistributedSparseGridUniform::new(params.dim, &sg_lmax, &params.lmin, params.boundary.clone());

        let mut local_sizes = vec![0usize; dsg.num_subspaces()];
        for task in &mut self.tasks {
            let sizes = task.full_grid_mut().register_uniform_sg(&dsg);
            for (a, b) in local_sizes.iter_mut().zip(sizes.iter()) {
                *a = (*a).max(*b);
            }
        }
        for (i, &s) in local_sizes.iter().enumerate() {
            dsg.set_data_size(i, s);
        }
        // Sizes are agreed and the buffer zero-allocated before any add,
        // so every add lands on real storage instead of panicking, and
        // no contribution added before this point is later discarded by
        // a deferred allocation.
        reduce.allocate(&mut dsg);

        for task in &mut self.tasks {
            let coeff = params.coeff(task.id());
            let fg = task.full_grid_mut();
            fg.hierarchize(exchange);
            fg.add_to_uniform_sg(&mut dsg, coeff);
        }

        reduce.reduce(&mut dsg);

        for task in &mut self.tasks {
            let fg = task.full_grid_mut();
            fg.extract_from_uniform_sg(&dsg);
            fg.dehierarchize(exchange);
        }

        self.combined_dsg = Some(dsg);
    }

    /// Handle `UPDATE_COMBI_PARAMETERS`.
    pub fn update_combi_parameters(&mut self, params: CombiParameters) {
        self.combi_parameters = Some(params);
    }

    /// Handle `RECOMPUTE`: seed a replacement task from the last
    /// combined solution before running it.
    pub fn recompute(&mut self, mut task: Box<dyn Task>, group_size: usize, group_rank: usize) -> Result<()> {
        task.init(group_size, group_rank);
        task.set_zero();
        if let Some(dsg) = &self.combined_dsg {
            let fg = task.full_grid_mut();
            fg.register_uniform_sg(dsg);
            fg.extract_from_uniform_sg(dsg);
        }
        self.status = StatusType::Busy;
        let result = task.run();
        self.tasks.push(task);
        self.current_task = Some(self.tasks.len() - 1);
        result.inspect_err(|_| {
            self.status = StatusType::Fail;
        })
    }

    /// Mutable references to two distinct held tasks' grids, in `(t_id,
    /// s_id)` order regardless of their storage order. Panics if either
    /// id isn't held.
    fn pair_grids_mut(&mut self, t_id: TaskId, s_id: TaskId) -> (&mut DistributedFullGrid, &mut DistributedFullGrid) {
        let t_pos = self.tasks.iter().position(|t| t.id() == t_id).unwrap();
        let s_pos = self.tasks.iter().position(|t| t.id() == s_id).unwrap();
        let (lo, hi) = if t_pos < s_pos { (t_pos, s_pos) } else { (s_pos, t_pos) };
        let (left, right) = self.tasks.split_at_mut(hi);
        let lo_ref = &mut left[lo];
        let hi_ref = &mut right[0];
        if t_pos < s_pos {
            (lo_ref.full_grid_mut(), hi_ref.full_grid_mut())
        } else {
            (hi_ref.full_grid_mut(), lo_ref.full_grid_mut())
        }
    }

    /// Handle `SEARCH_SDC`: generate nearest-neighbour pairs among held
    /// tasks, then a two-pass beta measurement that makes every pair's
    /// beta comparable before the regression. Pass one finds each pair's
    /// own worst-magnitude disagreement cell; the single globally
    /// largest of those is fixed as `(l*, j*)`, and pass two re-measures
    /// every pair's beta at that one fixed cell (0 if a pair's grid
    /// doesn't reach it).
    pub fn search_sdc(&mut self, num_nearest_neighbors: usize, eps: f64) -> Result<Vec<TaskId>> {
        let params = self.combi_parameters().clone();
        let levels: Vec<(TaskId, _)> = self.tasks.iter().map(|t| (t.id(), t.level_vector().clone())).collect();
        let pairs = generate_pairs(&levels, num_nearest_neighbors);

        let mut own_cells = Vec::with_capacity(pairs.len());
        for &(t_id, s_id) in &pairs {
            let t_level = self.tasks.iter().find(|t| t.id() == t_id).unwrap().level_vector().clone();
            let s_level = self.tasks.iter().find(|t| t.id() == s_id).unwrap().level_vector().clone();
            let (dfg_t, dfg_s) = self.pair_grids_mut(t_id, s_id);
            let mut scratch = DistributedSparseGridUniform::new(params.dim, &params.lmax, &params.lmin, params.boundary.clone());
            own_cells.push(compute_beta(dfg_t, dfg_s, &mut scratch, &t_level, &s_level));
        }

        let global_cell = own_cells
            .iter()
            .max_by(|a, b| a.value.abs().partial_cmp(&b.value.abs()).unwrap())
            .cloned();

        let mut betas = Vec::with_capacity(pairs.len());
        if let Some(cell) = global_cell {
            for (t_id, s_id) in pairs {
                let t_level = self.tasks.iter().find(|t| t.id() == t_id).unwrap().level_vector().clone();
                let s_level = self.tasks.iter().find(|t| t.id() == s_id).unwrap().level_vector().clone();
                let (dfg_t, dfg_s) = self.pair_grids_mut(t_id, s_id);
                let mut scratch = DistributedSparseGridUniform::new(params.dim, &params.lmax, &params.lmin, params.boundary.clone());
                let beta = beta_at_cell(dfg_t, dfg_s, &mut scratch, cell.subspace, cell.offset);
                betas.push(PairBeta {
                    t_id,
                    s_id,
                    t_level,
                    s_level,
                    beta,
                });
            }
        }

        let flagged = filter_sdc(&betas, &params.lmin, &params.lmax, eps);
        if !flagged.is_empty() {
            self.status = StatusType::Fail;
            return Err(Error::SilentDataCorruption(flagged));
        }
        Ok(Vec::new())
    }

    /// Handle `GRID_EVAL`: gather a held task's full grid onto
    /// `target_rank` within the group, reassembled in global axis order.
    /// `None` on every rank other than `target_rank`.
    pub fn grid_eval(&self, task_id: TaskId, gather: &dyn GridGather, target_rank: usize) -> Option<Vec<f64>> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.id() == task_id)
            .unwrap_or_else(|| panic!("GRID_EVAL for task {task_id} not held by this group"));
        task.full_grid().gather_full_grid(gather, target_rank)
    }

    /// Handle `REINIT_TASK`: overwrite a flagged task's grid in place
    /// from the current combined solution, distinct from `RECOMPUTE`
    /// which replaces the task object itself with a fresh one. Extract
    /// and dehierarchize are paired the same way `combine_uniform` pairs
    /// them for every other held task, so the reinitialized grid is back
    /// in nodal basis before the next round hierarchizes it.
    pub fn reinit_task(&mut self, task_id: TaskId, exchange: &dyn PencilExchange) {
        let dsg = self
            .combined_dsg
            .as_ref()
            .expect("REINIT_TASK requires a combined result from a prior COMBINE");
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id() == task_id)
            .unwrap_or_else(|| panic!("REINIT_TASK for task {task_id} not held by this group"));
        let fg = task.full_grid_mut();
        fg.register_uniform_sg(dsg);
        fg.extract_from_uniform_sg(dsg);
        fg.dehierarchize(exchange);
        task.set_finished(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combicom::SingleGroupReduce;
    use crate::grid::dfg::{compute_decomposition, LocalGridGather};
    use crate::grid::hierarchization::LocalPencilExchange;
    use crate::level::{BoundaryFlags, DimType, LevelVector};

    /// A held task whose grid is filled with a fixed constant on `run` —
    /// enough to exercise the worker state machine without a real solver.
    struct ConstantTask {
        id: TaskId,
        level: LevelVector,
        boundary: BoundaryFlags,
        coeff: f64,
        value: f64,
        grid: Option<DistributedFullGrid>,
        finished: bool,
    }

    impl ConstantTask {
        fn new(id: TaskId, level: LevelVector, boundary: BoundaryFlags, coeff: f64, value: f64) -> Self {
            Self {
                id,
                level,
                boundary,
                coeff,
                value,
                grid: None,
                finished: false,
            }
        }
    }

    impl Task for ConstantTask {
        fn id(&self) -> TaskId {
            self.id
        }

        fn dim(&self) -> DimType {
            self.level.dim()
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
            let decomposition = compute_decomposition(&self.level, group_size);
            self.grid = Some(DistributedFullGrid::new(self.level.clone(), self.boundary.clone(), decomposition, group_rank));
        }

        fn run(&mut self) -> Result<()> {
            let grid = self.grid.as_mut().expect("init must run before run");
            grid.elements_mut().iter_mut().for_each(|v| *v = self.value);
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

    fn single_task_params(lmax: LevelVector, lmin: LevelVector, boundary: BoundaryFlags, task_id: TaskId) -> CombiParameters {
        let dim = lmax.dim();
        let mut p = CombiParameters::new(dim, lmin, lmax, boundary, vec![1; dim]);
        p.set_coeff(task_id, 1.0);
        p
    }

    #[test]
    fn combine_uniform_allocates_before_adding_and_does_not_panic() {
        let lmax = LevelVector::new(vec![2, 2]);
        let lmin = LevelVector::new(vec![1, 1]);
        let boundary = BoundaryFlags::all(2, true);

        let mut worker = ProcessGroupWorker::new();
        worker.set_combi_parameters(single_task_params(lmax.clone(), lmin, boundary.clone(), 1));

        let task: Box<dyn Task> = Box::new(ConstantTask::new(1, lmax, boundary, 1.0, 3.0));
        worker.run_first(task, 1, 0).unwrap();

        worker.combine_uniform(&LocalPencilExchange, &SingleGroupReduce);

        assert!(worker.tasks()[0]
            .full_grid()
            .elements()
            .iter()
            .all(|&v| (v - 3.0).abs() < 1e-9));
    }

    #[test]
    fn grid_eval_gathers_a_held_tasks_grid() {
        let level = LevelVector::new(vec![2, 2]);
        let boundary = BoundaryFlags::all(2, true);

        let mut worker = ProcessGroupWorker::new();
        worker.set_combi_parameters(single_task_params(level.clone(), level.clone(), boundary.clone(), 1));
        let task: Box<dyn Task> = Box::new(ConstantTask::new(1, level, boundary, 1.0, 5.0));
        worker.run_first(task, 1, 0).unwrap();

        let gathered = worker.grid_eval(1, &LocalGridGather, 0).unwrap();
        assert!(gathered.iter().all(|&v| (v - 5.0).abs() < 1e-9));
    }

    #[test]
    fn reinit_task_overwrites_grid_from_combined_solution() {
        let lmax = LevelVector::new(vec![2, 2]);
        let lmin = LevelVector::new(vec![1, 1]);
        let boundary = BoundaryFlags::all(2, true);

        let mut worker = ProcessGroupWorker::new();
        worker.set_combi_parameters(single_task_params(lmax.clone(), lmin, boundary.clone(), 1));
        let task: Box<dyn Task> = Box::new(ConstantTask::new(1, lmax.clone(), boundary.clone(), 1.0, 4.0));
        worker.run_first(task, 1, 0).unwrap();
        worker.combine_uniform(&LocalPencilExchange, &SingleGroupReduce);

        let replacement: Box<dyn Task> = Box::new(ConstantTask::new(2, lmax, boundary, 1.0, 0.0));
        worker.add_task(replacement, 1, 0);
        worker.reinit_task(2, &LocalPencilExchange);

        let grid = worker.tasks().iter().find(|t| t.id() == 2).unwrap().full_grid();
        assert!(
            grid.elements().iter().any(|&v| v.abs() > 1e-9),
            "reinit_task must copy real values from the combined solution"
        );
    }
}
