use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowRunStatus {
    /// Created by the triggering handler, waiting for dependency resolution
    Crafting,
    /// Crafted successfully, jobs are being scheduled
    Building,
    /// Every job ended without a blocking failure
    Success,
    /// Crafting failed or a job failed
    Fail,
    /// Stopped by an operator
    Cancelled,
}

impl WorkflowRunStatus {
    pub const ALL: [WorkflowRunStatus; 5] = [
        Self::Crafting,
        Self::Building,
        Self::Success,
        Self::Fail,
        Self::Cancelled,
    ];

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crafting => "Crafting",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid workflow run status: {s}"))
    }
}

impl Default for WorkflowRunStatus {
    fn default() -> Self {
        Self::Crafting
    }
}

/// Status of one job within one run attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunJobStatus {
    /// Waiting for its dependencies to end
    Blocked,
    /// Claimable by an authorized hatchery
    Waiting,
    /// Reserved by a hatchery that is spawning a worker
    Scheduling,
    /// Taken by a worker
    Building,
    Success,
    Fail,
    /// Never ran because a dependency did not succeed
    Skipped,
    /// Cancelled externally
    Stopped,
}

impl RunJobStatus {
    pub const ALL: [RunJobStatus; 8] = [
        Self::Blocked,
        Self::Waiting,
        Self::Scheduling,
        Self::Building,
        Self::Success,
        Self::Fail,
        Self::Skipped,
        Self::Stopped,
    ];

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Fail | Self::Skipped | Self::Stopped
        )
    }

    /// Check if a hatchery or worker currently holds the job
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduling | Self::Building)
    }

    /// Check if this job lets its dependents become claimable
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "Blocked",
            Self::Waiting => "Waiting",
            Self::Scheduling => "Scheduling",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Skipped => "Skipped",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for RunJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid run job status: {s}"))
    }
}

impl Default for RunJobStatus {
    fn default() -> Self {
        Self::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_job_terminal_check() {
        assert!(RunJobStatus::Success.is_terminal());
        assert!(RunJobStatus::Fail.is_terminal());
        assert!(RunJobStatus::Skipped.is_terminal());
        assert!(RunJobStatus::Stopped.is_terminal());
        assert!(!RunJobStatus::Blocked.is_terminal());
        assert!(!RunJobStatus::Waiting.is_terminal());
        assert!(!RunJobStatus::Scheduling.is_terminal());
        assert!(!RunJobStatus::Building.is_terminal());
    }

    #[test]
    fn test_only_success_satisfies_dependencies() {
        let satisfying: Vec<_> = RunJobStatus::ALL
            .into_iter()
            .filter(RunJobStatus::satisfies_dependencies)
            .collect();
        assert_eq!(satisfying, vec![RunJobStatus::Success]);
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(RunJobStatus::Scheduling.to_string(), "Scheduling");
        assert_eq!(
            "Skipped".parse::<RunJobStatus>().unwrap(),
            RunJobStatus::Skipped
        );
        assert_eq!(
            "Cancelled".parse::<WorkflowRunStatus>().unwrap(),
            WorkflowRunStatus::Cancelled
        );
        assert!("scheduling".parse::<RunJobStatus>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&RunJobStatus::Waiting).unwrap();
        assert_eq!(json, "\"Waiting\"");
        let status: WorkflowRunStatus = serde_json::from_str("\"Building\"").unwrap();
        assert_eq!(status, WorkflowRunStatus::Building);
    }
}
