use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::RepositoryRef;
use super::workflow_data::{WorkflowData, WorkflowDefinition};
use crate::state_machine::WorkflowRunStatus;

/// The VCS event that triggered a run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunEvent {
    pub git_ref: String,
    pub sha: String,
    pub hook_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One execution of a workflow.
/// Maps to `workflow_runs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub project_key: String,
    pub vcs_server: String,
    pub repository: String,
    pub workflow_name: String,
    /// Ref the workflow file was read from, e.g. `refs/heads/main`
    pub workflow_ref: String,
    pub workflow_sha: String,
    pub run_number: i64,
    pub run_attempt: i32,
    pub status: WorkflowRunStatus,
    pub workflow_data: WorkflowData,
    pub event: RunEvent,
    /// Set once the retention sweep purged the run's secret snapshot
    pub read_only: bool,
    pub started: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// New workflow run, created by the triggering event handler
#[derive(Debug, Clone)]
pub struct NewWorkflowRun {
    pub project_key: String,
    pub vcs_server: String,
    pub repository: String,
    pub workflow_ref: String,
    pub workflow_sha: String,
    pub run_number: i64,
    pub workflow: WorkflowDefinition,
    pub event: RunEvent,
}

impl WorkflowRun {
    pub fn new(new_run: NewWorkflowRun) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_key: new_run.project_key,
            vcs_server: new_run.vcs_server,
            repository: new_run.repository,
            workflow_name: new_run.workflow.name.clone(),
            workflow_ref: new_run.workflow_ref,
            workflow_sha: new_run.workflow_sha,
            run_number: new_run.run_number,
            run_attempt: 1,
            status: WorkflowRunStatus::Crafting,
            workflow_data: WorkflowData::new(new_run.workflow),
            event: new_run.event,
            read_only: false,
            started: now,
            last_modified: now,
        }
    }

    /// Repository holding the workflow file
    pub fn repository_ref(&self) -> RepositoryRef {
        RepositoryRef::new(&self.project_key, &self.vcs_server, &self.repository)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunInfoLevel {
    Info,
    Warning,
    Error,
}

impl RunInfoLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunInfoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunInfoLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid run info level: {s}")),
        }
    }
}

/// Human-readable message attached to a run attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub run_attempt: i32,
    pub level: RunInfoLevel,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

impl RunInfo {
    pub fn new(run: &WorkflowRun, level: RunInfoLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_run_id: run.id,
            run_attempt: run.run_attempt,
            level,
            message: message.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn error(run: &WorkflowRun, message: impl Into<String>) -> Self {
        Self::new(run, RunInfoLevel::Error, message)
    }
}
