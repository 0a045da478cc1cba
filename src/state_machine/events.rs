use serde::{Deserialize, Serialize};

use super::states::WorkflowRunStatus;

/// Events that can trigger run job state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunJobEvent {
    /// Every dependency ended in a satisfying state
    Unblock,
    /// A dependency ended in a blocking state
    SkipForDependency,
    /// A hatchery reserves the job
    Claim(String),
    /// The holding hatchery gives the job back (spawn failure or orphan sweep)
    Release,
    /// Spawn retries are exhausted
    Abandon(String),
    /// A worker takes the job payload
    Start(String),
    /// The worker reports success
    Succeed,
    /// The worker reports failure with an optional error message
    Fail(Option<String>),
    /// External cancellation
    Stop,
}

impl RunJobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Unblock => "unblock",
            Self::SkipForDependency => "skip_for_dependency",
            Self::Claim(_) => "claim",
            Self::Release => "release",
            Self::Abandon(_) => "abandon",
            Self::Start(_) => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Stop => "stop",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => msg.as_deref(),
            Self::Abandon(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger workflow run state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunStatusEvent {
    /// Every job resolved and authorized
    Crafted,
    /// Crafting stopped on an unresolvable dependency or authorization failure
    CraftFailed(String),
    /// Every job ended; carries the aggregate status
    Settle(WorkflowRunStatus),
    Cancel,
    /// Start a new attempt from a terminal run
    Restart,
}

impl RunStatusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Crafted => "crafted",
            Self::CraftFailed(_) => "craft_failed",
            Self::Settle(_) => "settle",
            Self::Cancel => "cancel",
            Self::Restart => "restart",
        }
    }
}
