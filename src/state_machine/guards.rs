use super::errors::{guard_failed, StateMachineResult};
use crate::models::RunJob;

/// Trait for implementing state transition guards
pub trait StateGuard<T> {
    /// Check if a transition is allowed
    fn check(&self, entity: &T) -> StateMachineResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard to check the hatchery holds the claim on a run job
pub struct HeldByHatcheryGuard<'a>(pub &'a str);

impl StateGuard<RunJob> for HeldByHatcheryGuard<'_> {
    fn check(&self, run_job: &RunJob) -> StateMachineResult<()> {
        if run_job.is_held_by(self.0) {
            Ok(())
        } else {
            Err(guard_failed(format!(
                "job {} is not held by hatchery {}",
                run_job.id, self.0
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Run job must be held by the calling hatchery"
    }
}

/// Guard to check the worker is the one registered on a run job
pub struct BoundToWorkerGuard<'a>(pub &'a str);

impl StateGuard<RunJob> for BoundToWorkerGuard<'_> {
    fn check(&self, run_job: &RunJob) -> StateMachineResult<()> {
        if run_job.is_bound_to(self.0) {
            Ok(())
        } else {
            Err(guard_failed(format!(
                "job {} is not bound to worker {}",
                run_job.id, self.0
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Run job must be bound to the calling worker"
    }
}

/// Guard to check a run job targets the region the caller acts for
pub struct InRegionGuard<'a>(pub &'a str);

impl StateGuard<RunJob> for InRegionGuard<'_> {
    fn check(&self, run_job: &RunJob) -> StateMachineResult<()> {
        if run_job.region == self.0 {
            Ok(())
        } else {
            Err(guard_failed(format!(
                "job {} does not belong to region {}",
                run_job.id, self.0
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Run job must target the caller's region"
    }
}
