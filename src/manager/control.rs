//! Manager-side control plane: static initial task placement, combination
//! coefficient bookkeeping, and the signal/status protocol driving every
//! process group through a run.

use crate::level::LevelVector;
use crate::manager::signal::{SignalType, StatusType};
use crate::task::{CombiParameters, LoadModel, TaskId};

/// One task as seen by the manager: its id, level, and which group owns it.
#[derive(Debug, Clone)]
pub struct TaskPlacement {
    pub id: TaskId,
    pub level: LevelVector,
    pub group: usize,
}

/// Assign every level in `levels` to one of `num_groups` groups, greedily
/// balancing `load_model`'s cost estimate — the least-loaded group
/// always receives the next (unsorted) task. Placement is static: it is
/// computed once at scheme construction and never revisited.
pub fn place_tasks(levels: &[(TaskId, LevelVector)], num_groups: usize, load_model: &dyn LoadModel) -> Vec<TaskPlacement> {
    assert!(num_groups > 0);
    let mut group_load = vec![0.0f64; num_groups];
    let mut placements = Vec::with_capacity(levels.len());

    for (id, level) in levels {
        let cost = load_model.eval(level);
        let (group, _) = group_load
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        group_load[group] += cost;
        placements.push(TaskPlacement {
            id: *id,
            level: level.clone(),
            group,
        });
    }

    placements
}

/// Classical combination-technique coefficients for the regular sparse
/// grid index set relative to `lmin`: `(-1)^q * C(d-1, q)` where `q` is the
/// distance of `l - lmin` from the diagonal `sum(l - lmin) == n`.
pub fn classical_coefficients(levels: &[LevelVector], lmin: &LevelVector, dim: usize) -> Vec<f64> {
    let rel_sum = |l: &LevelVector| -> i64 { (0..dim).map(|a| l[a] - lmin[a]).sum() };
    let n = levels.iter().map(rel_sum).max().unwrap_or(0);
    levels
        .iter()
        .map(|l| {
            let q = n - rel_sum(l);
            if q < 0 || q > (dim as i64 - 1) {
                0.0
            } else {
                let sign = if q % 2 == 0 { 1.0 } else { -1.0 };
                sign * binomial(dim as u64 - 1, q as u64)
            }
        })
        .collect()
}

fn binomial(n: u64, k: u64) -> f64 {
    if k > n {
        return 0.0;
    }
    let mut result = 1.0f64;
    for i in 0..k {
        result = result * (n - i) as f64 / (i + 1) as f64;
    }
    result
}

/// Build the `CombiParameters` broadcast to every group once a scheme is
/// fixed: dim/lmin/lmax/boundary/decomposition plus one coefficient per task.
pub fn build_combi_parameters(
    dim: usize,
    lmin: LevelVector,
    lmax: LevelVector,
    boundary: crate::level::BoundaryFlags,
    decomposition: Vec<usize>,
    placements: &[TaskPlacement],
    coefficients: &[f64],
) -> CombiParameters {
    assert_eq!(placements.len(), coefficients.len());
    let mut params = CombiParameters::new(dim, lmin, lmax, boundary, decomposition);
    for (placement, &coeff) in placements.iter().zip(coefficients.iter()) {
        params.set_coeff(placement.id, coeff);
    }
    params
}

/// Tracks each group's last reported status, the minimal state the
/// manager's run loop needs to decide when every group has gone idle
/// or whether one has failed.
#[derive(Debug, Clone)]
pub struct GroupStatusTable {
    statuses: Vec<StatusType>,
}

impl GroupStatusTable {
    pub fn new(num_groups: usize) -> Self {
        Self {
            statuses: vec![StatusType::Wait; num_groups],
        }
    }

    pub fn set(&mut self, group: usize, status: StatusType) {
        self.statuses[group] = status;
    }

    pub fn all_waiting(&self) -> bool {
        self.statuses.iter().all(|&s| s == StatusType::Wait)
    }

    pub fn failed_groups(&self) -> Vec<usize> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == StatusType::Fail)
            .map(|(g, _)| g)
            .collect()
    }
}

/// The sequence of signals a standard combine round issues, in order.
pub fn combine_round_signals() -> [SignalType; 2] {
    [SignalType::Combine, SignalType::UpdateCombiParameters]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::LinearLoadModel;

    #[test]
    fn place_tasks_balances_across_groups() {
        let levels = vec![
            (1, LevelVector::new(vec![1, 1])),
            (2, LevelVector::new(vec![1, 1])),
            (3, LevelVector::new(vec![1, 1])),
            (4, LevelVector::new(vec![1, 1])),
        ];
        let placements = place_tasks(&levels, 2, &LinearLoadModel);
        let mut counts = [0usize; 2];
        for p in &placements {
            counts[p.group] += 1;
        }
        assert_eq!(counts, [2, 2]);
    }

    #[test]
    fn classical_coefficients_match_2d_regular_scheme() {
        // For d=2, every level on the n-diagonal (q=0) gets +1, and every
        // level one below it (q=1) gets -1.
        let lmin = LevelVector::new(vec![1, 1]);
        let levels = vec![LevelVector::new(vec![3, 1]), LevelVector::new(vec![2, 1])];
        let coeffs = classical_coefficients(&levels, &lmin, 2);
        assert_eq!(coeffs[0], 1.0);
        assert_eq!(coeffs[1], -1.0);
    }

    #[test]
    fn group_status_table_tracks_failures() {
        let mut table = GroupStatusTable::new(3);
        assert!(table.all_waiting());
        table.set(1, StatusType::Fail);
        assert!(!table.all_waiting());
        assert_eq!(table.failed_groups(), vec![1]);
    }
}
