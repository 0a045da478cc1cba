// State machine module for workflow runs and run jobs
//
// Transition tables are pure; persistence goes through the store's
// compare-and-swap operations so that concurrent callers agree on one winner.

pub mod errors;
pub mod events;
pub mod guards;
pub mod run_job_state_machine;
pub mod run_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{RunJobEvent, RunStatusEvent};
pub use guards::{BoundToWorkerGuard, HeldByHatcheryGuard, InRegionGuard, StateGuard};
pub use run_job_state_machine::RunJobStateMachine;
pub use run_state_machine::RunStateMachine;
pub use states::{RunJobStatus, WorkflowRunStatus};
