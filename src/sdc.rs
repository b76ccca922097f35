//! Silent-data-corruption detection: pair nearby component grids, measure
//! how much their hierarchical surpluses disagree on the subspaces they
//! share, and fit a robust regression to tell a genuinely corrupted grid
//! apart from ordinary discretization noise.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::grid::dfg::DistributedFullGrid;
use crate::grid::dsg::DistributedSparseGridUniform;
use crate::level::LevelVector;
use crate::task::TaskId;

/// Pair up every task with its `k` nearest neighbours by L1 level
/// distance, then run a second pass making sure no task ends up with
/// fewer than `k` pairs (a task at the edge of the level set may not be
/// anyone else's nearest neighbour).
pub fn generate_pairs(levels: &[(TaskId, LevelVector)], k: usize) -> Vec<(TaskId, TaskId)> {
    let mut pairs: Vec<(TaskId, TaskId)> = Vec::new();
    let mut pair_count: HashMap<TaskId, usize> = levels.iter().map(|(id, _)| (*id, 0)).collect();
    let has_pair = |pairs: &[(TaskId, TaskId)], a: TaskId, b: TaskId| {
        pairs.iter().any(|&(x, y)| (x, y) == (a, b) || (x, y) == (b, a))
    };

    for &(s_id, ref s_level) in levels {
        let mut by_distance: Vec<&(TaskId, LevelVector)> = levels.iter().filter(|(id, _)| *id != s_id).collect();
        by_distance.sort_by_key(|(_, l)| l.l1_distance(s_level));

        let mut made = 0;
        for &(t_id, _) in &by_distance {
            if made == k {
                break;
            }
            if !has_pair(&pairs, s_id, *t_id) {
                pairs.push((*t_id, s_id));
                *pair_count.get_mut(&s_id).unwrap() += 1;
                *pair_count.get_mut(t_id).unwrap() += 1;
                made += 1;
            }
        }
    }

    for &(s_id, ref s_level) in levels {
        if pair_count[&s_id] >= k {
            continue;
        }
        let mut by_distance: Vec<&(TaskId, LevelVector)> = levels.iter().filter(|(id, _)| *id != s_id).collect();
        by_distance.sort_by_key(|(_, l)| l.l1_distance(s_level));

        while pair_count[&s_id] < k {
            let Some(&(t_id, _)) = by_distance.iter().find(|(id, _)| !has_pair(&pairs, s_id, *id)) else {
                break;
            };
            pairs.push((s_id, *t_id));
            *pair_count.get_mut(&s_id).unwrap() += 1;
            *pair_count.get_mut(t_id).unwrap() += 1;
        }
    }

    pairs
}

/// A single (subspace, offset) cell identified in a hierarchical-surplus
/// disagreement DSG, together with the value found there. `subspace`
/// indices are comparable across pairs measured against DSGs built from
/// the same `(dim, lmin, lmax, boundary)`, since the subspace
/// enumeration they share is then identical.
#[derive(Debug, Clone, Copy)]
pub struct BetaCell {
    pub subspace: usize,
    pub offset: usize,
    pub value: f64,
}

/// Fold `dfg_t - dfg_s` into `scratch` (registering both grids against
/// it first, agreeing each subspace's data size, and allocating), so the
/// two grids' hierarchical surpluses can be compared cell by cell.
/// `scratch` must not already be allocated.
fn fold_pair_diff(dfg_t: &mut DistributedFullGrid, dfg_s: &mut DistributedFullGrid, scratch: &mut DistributedSparseGridUniform) {
    let sizes_t = dfg_t.register_uniform_sg(scratch);
    let sizes_s = dfg_s.register_uniform_sg(scratch);
    for i in 0..scratch.num_subspaces() {
        scratch.set_data_size(i, sizes_t[i].max(sizes_s[i]));
    }
    scratch.create_subspace_data();

    dfg_t.register_uniform_sg(scratch);
    dfg_t.add_to_uniform_sg(scratch, 1.0);

    dfg_s.register_uniform_sg(scratch);
    dfg_s.add_to_uniform_sg(scratch, -1.0);
}

/// Hierarchical-surplus disagreement between two tasks' grids: the
/// largest-magnitude entry of `dfg_t - dfg_s`, and its cell, on any
/// subspace at or below their common (componentwise-min) level. Both
/// grids must already be hierarchized; `scratch` is a fresh DSG over the
/// same (dim, lmin, lmax, boundary) the two tasks share, used only for
/// this measurement and discarded afterwards.
///
/// This is a pair's own worst cell, not yet comparable across pairs —
/// `search_sdc` fixes a single global cell from these before the
/// regression runs, re-measuring every pair there with `beta_at_cell`.
pub fn compute_beta(
    dfg_t: &mut DistributedFullGrid,
    dfg_s: &mut DistributedFullGrid,
    scratch: &mut DistributedSparseGridUniform,
    t_level: &LevelVector,
    s_level: &LevelVector,
) -> BetaCell {
    let common_level = t_level.componentwise_min(s_level);
    fold_pair_diff(dfg_t, dfg_s, scratch);

    let mut best = BetaCell { subspace: 0, offset: 0, value: 0.0 };
    for i in 0..scratch.num_subspaces() {
        if !scratch.level_vector(i).le_componentwise(&common_level) {
            continue;
        }
        for (offset, &v) in scratch.stripe(i).iter().enumerate() {
            if v.abs() > best.value.abs() {
                best = BetaCell { subspace: i, offset, value: v };
            }
        }
    }
    best
}

/// Re-measure a pair's beta at one externally-fixed `(subspace, offset)`
/// cell, found by `compute_beta` on some other pair. 0.0 if this pair's
/// folded difference doesn't reach that cell (its grids are coarser than
/// the subspace the global maximum was found on).
pub fn beta_at_cell(
    dfg_t: &mut DistributedFullGrid,
    dfg_s: &mut DistributedFullGrid,
    scratch: &mut DistributedSparseGridUniform,
    subspace: usize,
    offset: usize,
) -> f64 {
    fold_pair_diff(dfg_t, dfg_s, scratch);
    if offset < scratch.data_size(subspace) {
        scratch.stripe(subspace)[offset]
    } else {
        0.0
    }
}

/// One measured pair and its beta value.
#[derive(Debug, Clone)]
pub struct PairBeta {
    pub t_id: TaskId,
    pub s_id: TaskId,
    pub t_level: LevelVector,
    pub s_level: LevelVector,
    pub beta: f64,
}

/// Regression design row: per axis, `h_t^2` contributes to that axis's
/// "D_t" column and `-h_s^2` to its "D_s" column, where `h = 2^{-level}`.
/// `p = 2 * (lmax[0] - lmin[0] + 1)` unknowns per axis block, generalized
/// here over every axis instead of just the first two.
fn design_row(t_level: &LevelVector, s_level: &LevelVector, lmin: &LevelVector, diff: i64) -> Vec<f64> {
    let dim = t_level.dim();
    let mut row = vec![0.0; dim * 2 * diff as usize];
    for axis in 0..dim {
        let ht = 2f64.powi(-(t_level[axis] as i32));
        let hs = 2f64.powi(-(s_level[axis] as i32));
        let t_idx = axis * 2 * diff as usize + (t_level[axis] - lmin[axis]) as usize;
        let s_idx = axis * 2 * diff as usize + diff as usize + (s_level[axis] - lmin[axis]) as usize;
        row[t_idx] += ht * ht;
        row[s_idx] -= hs * hs;
    }
    row
}

/// Robust least-squares outlier screen over a batch of beta
/// measurements. Builds the per-axis design matrix, fits ordinary least
/// squares, standardizes residuals with a median-absolute-deviation
/// scale estimate (the usual normal-consistency factor 1.4826, with the
/// small-sample correction `1 + 5/(n - p - 1)`), and flags any task
/// appearing in at least two anomalous pairs — or in the single
/// anomalous pair, if there's only one anomalous pair overall.
pub fn filter_sdc(pairs: &[PairBeta], lmin: &LevelVector, lmax: &LevelVector, eps: f64) -> Vec<TaskId> {
    let n = pairs.len();
    let diff = lmax[0] - lmin[0] + 1;
    let p = (lmin.dim() as i64 * 2 * diff) as usize;

    if n < p {
        return Vec::new();
    }

    let mut x = DMatrix::<f64>::zeros(n, p);
    let mut y = DVector::<f64>::zeros(n);
    for (row, pair) in pairs.iter().enumerate() {
        let r = design_row(&pair.t_level, &pair.s_level, lmin, diff);
        for (col, &v) in r.iter().enumerate() {
            x[(row, col)] = v;
        }
        y[row] = pair.beta;
    }

    let svd = x.clone().svd(true, true);
    let coeffs = svd.solve(&y, 1e-10).unwrap_or_else(|_| DVector::zeros(p));
    let fitted = &x * &coeffs;
    let residuals: Vec<f64> = (0..n).map(|i| y[i] - fitted[i]).collect();

    let mut abs_sorted: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    abs_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median_abs = if abs_sorted.is_empty() {
        0.0
    } else if abs_sorted.len() % 2 == 1 {
        abs_sorted[abs_sorted.len() / 2]
    } else {
        0.5 * (abs_sorted[abs_sorted.len() / 2 - 1] + abs_sorted[abs_sorted.len() / 2])
    };

    let correction = if n as i64 > p as i64 + 1 {
        1.0 + 5.0 / (n as f64 - p as f64 - 1.0)
    } else {
        1.0
    };
    let scale = 1.4826 * correction * median_abs;

    let mut suspect_count: HashMap<TaskId, usize> = HashMap::new();
    let mut anomalous_pairs = 0usize;
    let mut anomalous: Vec<(TaskId, TaskId)> = Vec::new();

    for (i, pair) in pairs.iter().enumerate() {
        if scale <= 0.0 {
            continue;
        }
        let stand = residuals[i] / scale;
        if stand.abs() > eps && pair.beta != 0.0 {
            *suspect_count.entry(pair.t_id).or_insert(0) += 1;
            *suspect_count.entry(pair.s_id).or_insert(0) += 1;
            anomalous_pairs += 1;
            anomalous.push((pair.t_id, pair.s_id));
        }
    }

    suspect_count
        .into_iter()
        .filter(|&(_, count)| count >= 2 || (count == 1 && anomalous_pairs == 1))
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv(v: Vec<i64>) -> LevelVector {
        LevelVector::new(v)
    }

    #[test]
    fn generate_pairs_gives_every_task_at_least_k_neighbours() {
        let levels = vec![
            (1, lv(vec![1, 1])),
            (2, lv(vec![2, 1])),
            (3, lv(vec![1, 2])),
            (4, lv(vec![3, 3])),
        ];
        let pairs = generate_pairs(&levels, 2);
        let mut count: HashMap<TaskId, usize> = levels.iter().map(|(id, _)| (*id, 0)).collect();
        for &(a, b) in &pairs {
            *count.get_mut(&a).unwrap() += 1;
            *count.get_mut(&b).unwrap() += 1;
        }
        for (&_id, &c) in &count {
            assert!(c >= 2);
        }
    }

    #[test]
    fn generate_pairs_produces_no_duplicate_unordered_pair() {
        let levels = vec![
            (1, lv(vec![1, 1])),
            (2, lv(vec![2, 1])),
            (3, lv(vec![1, 2])),
        ];
        let pairs = generate_pairs(&levels, 2);
        let mut seen = std::collections::HashSet::new();
        for &(a, b) in &pairs {
            let key = if a < b { (a, b) } else { (b, a) };
            assert!(seen.insert(key), "duplicate pair {a},{b}");
        }
    }

    #[test]
    fn compute_beta_is_zero_for_identical_constant_grids() {
        use crate::level::BoundaryFlags;

        let level = lv(vec![2, 2]);
        let boundary = BoundaryFlags::all(2, true);
        let mut dfg_t = DistributedFullGrid::new(level.clone(), boundary.clone(), vec![1, 1], 0);
        let mut dfg_s = DistributedFullGrid::new(level.clone(), boundary.clone(), vec![1, 1], 0);
        dfg_t.elements_mut().iter_mut().for_each(|v| *v = 3.0);
        dfg_s.elements_mut().iter_mut().for_each(|v| *v = 3.0);

        let mut scratch = DistributedSparseGridUniform::new(2, &level, &lv(vec![1, 1]), boundary);
        let cell = compute_beta(&mut dfg_t, &mut dfg_s, &mut scratch, &level, &level);
        assert!(cell.value.abs() < 1e-12);
    }

    #[test]
    fn beta_at_cell_reproduces_compute_beta_own_cell() {
        use crate::level::BoundaryFlags;

        let t_level = lv(vec![2, 2]);
        let s_level = lv(vec![2, 1]);
        let boundary = BoundaryFlags::all(2, true);
        let decomposition = vec![1, 1];
        let mut dfg_t = DistributedFullGrid::new(t_level.clone(), boundary.clone(), decomposition.clone(), 0);
        let mut dfg_s = DistributedFullGrid::new(s_level.clone(), boundary.clone(), decomposition, 0);
        for (i, v) in dfg_t.elements_mut().iter_mut().enumerate() {
            *v = i as f64 * 0.5;
        }
        for (i, v) in dfg_s.elements_mut().iter_mut().enumerate() {
            *v = i as f64 * 0.25 + 1.0;
        }

        let lmin = lv(vec![1, 1]);
        let lmax = lv(vec![2, 2]);
        let mut scratch_a = DistributedSparseGridUniform::new(2, &lmax, &lmin, boundary.clone());
        let cell = compute_beta(&mut dfg_t, &mut dfg_s, &mut scratch_a, &t_level, &s_level);

        let mut scratch_b = DistributedSparseGridUniform::new(2, &lmax, &lmin, boundary);
        let beta = beta_at_cell(&mut dfg_t, &mut dfg_s, &mut scratch_b, cell.subspace, cell.offset);
        assert!((beta - cell.value).abs() < 1e-12);
    }

    #[test]
    fn filter_sdc_flags_nothing_when_all_betas_are_consistent_noise() {
        let lmin = lv(vec![1, 1]);
        let lmax = lv(vec![3, 3]);
        // Not enough measurements for the p=2*diff=6 design -> no-op, not a false positive.
        let pairs = vec![PairBeta {
            t_id: 1,
            s_id: 2,
            t_level: lv(vec![2, 2]),
            s_level: lv(vec![1, 1]),
            beta: 1e-6,
        }];
        assert!(filter_sdc(&pairs, &lmin, &lmax, 2.5).is_empty());
    }
}
