//! Manager/worker control plane: the signal vocabulary, the worker-side
//! state machine, and the manager-side placement and status bookkeeping.

pub mod control;
pub mod signal;
pub mod worker;

pub use signal::{SignalType, StatusType};
pub use worker::ProcessGroupWorker;
