pub mod publisher;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{RunJobStatus, WorkflowRunStatus};

// Re-export key types for convenience
pub use publisher::{EventPublisher, PublishedEvent};

/// Lifecycle events of the job queue, for live status consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobQueued {
        run_job_id: Uuid,
        workflow_run_id: Uuid,
        job_id: String,
        region: String,
    },
    JobTaken {
        run_job_id: Uuid,
        hatchery: String,
    },
    JobReleased {
        run_job_id: Uuid,
        hatchery: String,
        spawn_attempts: i32,
    },
    JobStarted {
        run_job_id: Uuid,
        worker: String,
    },
    JobEnded {
        run_job_id: Uuid,
        workflow_run_id: Uuid,
        status: RunJobStatus,
    },
    RunEnded {
        workflow_run_id: Uuid,
        status: WorkflowRunStatus,
    },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job_queued",
            Self::JobTaken { .. } => "job_taken",
            Self::JobReleased { .. } => "job_released",
            Self::JobStarted { .. } => "job_started",
            Self::JobEnded { .. } => "job_ended",
            Self::RunEnded { .. } => "run_ended",
        }
    }
}
