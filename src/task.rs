//! Task abstraction, combination coefficients, and the opaque byte-stream
//! serializer that carries a task across a group boundary.
//!
//! A concrete task kind is never downcast by the core except in the
//! deserializer: the core only ever calls through the `Task` trait object.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::grid::dfg::DistributedFullGrid;
use crate::level::{BoundaryFlags, DimType, LevelVector};

pub type TaskId = u32;

/// A task's solver fault predicate, checked after each `run`. The actual
/// numerical criteria (non-finite output, blow-up thresholds) belong to
/// the PDE solver collaborator; the core only consumes the boolean.
pub trait FaultCriterion: Send + Sync {
    fn has_faulted(&self, samples: &[f64]) -> bool;
}

/// Never trips. The default for tasks that don't model faults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoFaultCriterion;

impl FaultCriterion for NoFaultCriterion {
    fn has_faulted(&self, _samples: &[f64]) -> bool {
        false
    }
}

/// Flags non-finite (NaN/Inf) output — the minimal criterion every task
/// should carry regardless of domain-specific ones.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NonFiniteFaultCriterion;

impl FaultCriterion for NonFiniteFaultCriterion {
    fn has_faulted(&self, samples: &[f64]) -> bool {
        samples.iter().any(|v| !v.is_finite())
    }
}

/// Abstract unit of work: one component grid for the lifetime of the run
/// it participates in. Lifecycle: constructed on the manager, serialized
/// to the owning group's local-root, broadcast inside the group, `init`
/// allocates the DFG, `run` advances the embedded solver by some number
/// of steps, `full_grid` gathers onto one rank.
pub trait Task: Send {
    fn id(&self) -> TaskId;
    fn dim(&self) -> DimType;
    fn level_vector(&self) -> &LevelVector;
    fn boundary(&self) -> &BoundaryFlags;
    fn coefficient(&self) -> f64;
    fn set_coefficient(&mut self, coeff: f64);

    /// Allocate the task's `DistributedFullGrid` over the group's local
    /// communicator. Idempotent only on first call; calling twice is a
    /// programming error (asserted, not `Result`).
    fn init(&mut self, group_size: usize, group_rank: usize);

    /// Advance the embedded solver. Sets `finished` on completion (or on
    /// fault, in which case it returns `Err`).
    fn run(&mut self) -> Result<()>;

    fn is_finished(&self) -> bool;
    fn set_finished(&mut self, finished: bool);

    /// Zero every sample. Used before recompute or re-initialization,
    /// when a task has no real solution yet.
    fn set_zero(&mut self);

    fn full_grid(&self) -> &DistributedFullGrid;
    fn full_grid_mut(&mut self) -> &mut DistributedFullGrid;
}

/// Abstract cost estimator for a level vector, used by the manager for
/// static initial task placement across groups. Placement is not
/// rebalanced mid-run.
pub trait LoadModel: Send + Sync {
    fn eval(&self, level: &LevelVector) -> f64;
}

/// Cost grows with the number of DOFs: `prod(2^l[i])`. A reasonable
/// default when no domain-specific cost model is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearLoadModel;

impl LoadModel for LinearLoadModel {
    fn eval(&self, level: &LevelVector) -> f64 {
        level
            .as_slice()
            .iter()
            .map(|&l| 2f64.powi(l as i32))
            .product()
    }
}

/// (dim, lmin, lmax, boundary, coefficients, decomposition) broadcast once
/// per scheme change and immutable during a combine round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombiParameters {
    pub dim: DimType,
    pub lmin: LevelVector,
    pub lmax: LevelVector,
    pub boundary: BoundaryFlags,
    coefficients: HashMap<TaskId, f64>,
    /// Per-axis process-grid decomposition shared by every DFG in the
    /// group, so that the global-reduce communicator maps identical
    /// ranks across groups onto the same spatial tile.
    pub decomposition: Vec<usize>,
}

impl CombiParameters {
    pub fn new(
        dim: DimType,
        lmin: LevelVector,
        lmax: LevelVector,
        boundary: BoundaryFlags,
        decomposition: Vec<usize>,
    ) -> Self {
        Self {
            dim,
            lmin,
            lmax,
            boundary,
            coefficients: HashMap::new(),
            decomposition,
        }
    }

    pub fn set_coeff(&mut self, task_id: TaskId, coeff: f64) {
        self.coefficients.insert(task_id, coeff);
    }

    pub fn coeff(&self, task_id: TaskId) -> f64 {
        *self
            .coefficients
            .get(&task_id)
            .unwrap_or_else(|| panic!("no combination coefficient registered for task {task_id}"))
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.coefficients.keys()
    }
}

/// Base fields every task serializes, in declaration order: dim, level,
/// boundary, coeff, and a type tag identifying the concrete kind for the
/// deserializer. Concrete task kinds append their own fields after these
/// when they implement `to_wire`/`from_wire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub id: TaskId,
    pub dim: DimType,
    pub level: LevelVector,
    pub boundary: BoundaryFlags,
    pub coeff: f64,
}

/// Serialize a task header plus subclass payload as one opaque byte
/// stream.
pub fn serialize_task<T: Serialize>(header: &TaskHeader, payload: &T) -> Result<Vec<u8>> {
    let mut buf = bincode::serialize(header)?;
    buf.extend(bincode::serialize(payload)?);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combi_parameters_round_trip_coeff() {
        let mut p = CombiParameters::new(
            2,
            LevelVector::new(vec![1, 1]),
            LevelVector::new(vec![3, 3]),
            BoundaryFlags::all(2, true),
            vec![2, 2],
        );
        p.set_coeff(7, -1.0);
        assert_eq!(p.coeff(7), -1.0);
    }

    #[test]
    fn non_finite_fault_criterion_trips_on_nan() {
        let c = NonFiniteFaultCriterion;
        assert!(c.has_faulted(&[1.0, f64::NAN]));
        assert!(!c.has_faulted(&[1.0, 2.0]));
    }

    #[test]
    fn linear_load_model_grows_with_level() {
        let m = LinearLoadModel;
        let small = m.eval(&LevelVector::new(vec![1, 1]));
        let large = m.eval(&LevelVector::new(vec![3, 3]));
        assert!(large > small);
    }
}
