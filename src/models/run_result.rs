use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::run_job::RunJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunResultStatus {
    Pending,
    Completed,
}

impl RunResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Completed => "Completed",
        }
    }
}

impl std::str::FromStr for RunResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid run result status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunResultKind {
    Variable,
    Test,
    ArtifactRef,
    Generic,
}

impl RunResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Variable => "Variable",
            Self::Test => "Test",
            Self::ArtifactRef => "ArtifactRef",
            Self::Generic => "Generic",
        }
    }
}

impl fmt::Display for RunResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload of a run result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum RunResultDetail {
    Variable {
        name: String,
        value: String,
    },
    Test {
        name: String,
        tests: u32,
        passed: u32,
        failed: u32,
        skipped: u32,
    },
    ArtifactRef {
        name: String,
        path: String,
        size: i64,
        md5: String,
    },
    Generic {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl RunResultDetail {
    pub fn kind(&self) -> RunResultKind {
        match self {
            Self::Variable { .. } => RunResultKind::Variable,
            Self::Test { .. } => RunResultKind::Test,
            Self::ArtifactRef { .. } => RunResultKind::ArtifactRef,
            Self::Generic { .. } => RunResultKind::Generic,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Variable { name, .. }
            | Self::Test { name, .. }
            | Self::ArtifactRef { name, .. }
            | Self::Generic { name, .. } => name,
        }
    }
}

/// Output produced by a run job.
/// Maps to `run_results` table, unique on `(run_job_id, kind, name)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub run_job_id: Uuid,
    pub run_attempt: i32,
    pub status: RunResultStatus,
    pub detail: RunResultDetail,
    pub issued_at: DateTime<Utc>,
}

/// Run result as posted by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunResult {
    pub status: RunResultStatus,
    pub detail: RunResultDetail,
}

impl NewRunResult {
    pub fn variable(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            status: RunResultStatus::Completed,
            detail: RunResultDetail::Variable {
                name: name.into(),
                value: value.into(),
            },
        }
    }
}

impl RunResult {
    pub fn new(run_job: &RunJob, new_result: NewRunResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_run_id: run_job.workflow_run_id,
            run_job_id: run_job.id,
            run_attempt: run_job.run_attempt,
            status: new_result.status,
            detail: new_result.detail,
            issued_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RunResultKind {
        self.detail.kind()
    }

    pub fn name(&self) -> &str {
        self.detail.name()
    }

    /// Same logical result: same job, kind and name
    pub fn same_key(&self, other: &RunResult) -> bool {
        self.run_job_id == other.run_job_id
            && self.kind() == other.kind()
            && self.name() == other.name()
    }
}
