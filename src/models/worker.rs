use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Registered, job payload not taken yet
    Waiting,
    Building,
    Success,
    Fail,
    /// Unregistered or torn down
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Building => "Building",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::Disabled => "Disabled",
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Building" => Ok(Self::Building),
            "Success" => Ok(Self::Success),
            "Fail" => Ok(Self::Fail),
            "Disabled" => Ok(Self::Disabled),
            _ => Err(format!("Invalid worker status: {s}")),
        }
    }
}

/// An ephemeral worker bound to exactly one run job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub hatchery_name: String,
    pub run_job_id: Uuid,
    pub model_name: String,
    pub status: WorkerStatus,
    pub last_beat: DateTime<Utc>,
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// Details a worker sends when registering
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub os: String,
    pub arch: String,
    pub version: String,
}
