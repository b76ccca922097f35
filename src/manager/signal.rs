//! Wire vocabulary between the manager and a process group's local
//! root: the signal words the manager sends, and the status words a
//! group reports back.

use serde::{Deserialize, Serialize};

/// Instruction broadcast by a group's local root to every worker in the
/// group after it receives one from the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    /// Receive a brand-new task, initialize it, and run it for the first time.
    RunFirst,
    /// Re-run every task already held by the group for another batch of steps.
    RunNext,
    /// Receive a single new task and add it to the group's task list, zeroed.
    AddTask,
    /// Evaluate the combined solution at a point (not implemented upstream either).
    Eval,
    /// Shut the worker loop down.
    Exit,
    /// Send every held task back to the manager.
    SyncTasks,
    /// Hierarchize, globally reduce, and dehierarchize every held task's grid.
    Combine,
    /// Evaluate the combined sparse grid onto a full grid.
    GridEval,
    /// Combine directly on dense full grids instead of the sparse representation.
    CombineFg,
    /// Receive and adopt new combination parameters (coefficients, decomposition).
    UpdateCombiParameters,
    /// Receive a replacement task and seed it from the current combined solution.
    Recompute,
    /// Run the corruption detector across every held task pair.
    SearchSdc,
    /// Receive a fresh task replacing one flagged corrupt, reseeded from the combined solution.
    ReinitTask,
}

/// A group's aggregate health, reported to the manager after every
/// signal is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusType {
    /// Every held task has finished its current batch of work.
    Wait,
    /// At least one held task is still running.
    Busy,
    /// A task faulted and the group needs manager intervention.
    Fail,
}
