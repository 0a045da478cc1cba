use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow_data::JobDefinition;
use super::workflow_run::{RunInfoLevel, WorkflowRun};
use crate::state_machine::RunJobStatus;

/// The claimable unit for one job of one run attempt.
/// Maps to `run_jobs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub id: Uuid,
    pub job_id: String,
    pub workflow_run_id: Uuid,
    pub project_key: String,
    pub workflow_name: String,
    pub run_number: i64,
    pub run_attempt: i32,
    pub status: RunJobStatus,
    /// Job definition with pinned references
    pub job: JobDefinition,
    pub region: String,
    /// Empty when any hatchery may spawn the worker
    pub model_type: String,
    /// Pinned worker model name, empty when none is required
    pub model_name: String,
    pub hatchery_name: Option<String>,
    pub worker_name: Option<String>,
    /// Number of releases after failed spawns
    pub spawn_attempts: i32,
    pub queued: DateTime<Utc>,
    pub scheduled: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

impl RunJob {
    /// Materialize a crafted job; jobs with dependencies start `Blocked`
    pub fn from_job(
        run: &WorkflowRun,
        job_id: &str,
        job: &JobDefinition,
        region: &str,
        model_type: &str,
    ) -> Self {
        let status = if job.needs.is_empty() {
            RunJobStatus::Waiting
        } else {
            RunJobStatus::Blocked
        };
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            workflow_run_id: run.id,
            project_key: run.project_key.clone(),
            workflow_name: run.workflow_name.clone(),
            run_number: run.run_number,
            run_attempt: run.run_attempt,
            status,
            job: job.clone(),
            region: region.to_string(),
            model_type: model_type.to_string(),
            model_name: job.runs_on.model.clone(),
            hatchery_name: None,
            worker_name: None,
            spawn_attempts: 0,
            queued: Utc::now(),
            scheduled: None,
            started: None,
            ended: None,
        }
    }

    pub fn is_held_by(&self, hatchery_name: &str) -> bool {
        self.hatchery_name.as_deref() == Some(hatchery_name)
    }

    pub fn is_bound_to(&self, worker_name: &str) -> bool {
        self.worker_name.as_deref() == Some(worker_name)
    }

    /// Model type match; an empty requirement accepts any hatchery
    pub fn accepts_model_type(&self, model_type: &str) -> bool {
        self.model_type.is_empty() || self.model_type == model_type
    }
}

/// Message attached to a run job (spawn failures, worker start, job errors)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJobInfo {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub run_job_id: Uuid,
    pub level: RunInfoLevel,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

impl RunJobInfo {
    pub fn new(run_job: &RunJob, level: RunInfoLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_run_id: run_job.workflow_run_id,
            run_job_id: run_job.id,
            level,
            message: message.into(),
            issued_at: Utc::now(),
        }
    }
}
