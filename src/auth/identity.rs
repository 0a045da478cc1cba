use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::Worker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HatcheryIdentity {
    pub name: String,
}

impl HatcheryIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A registered worker, bound to exactly one run job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: Uuid,
    pub name: String,
    pub hatchery_name: String,
    pub run_job_id: Uuid,
}

impl From<&Worker> for WorkerIdentity {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id,
            name: worker.name.clone(),
            hatchery_name: worker.hatchery_name.clone(),
            run_job_id: worker.run_job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
}

/// Caller of an engine operation, as resolved by the surrounding service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Hatchery(HatcheryIdentity),
    Worker(WorkerIdentity),
    User(UserIdentity),
}

impl Identity {
    pub fn into_hatchery(self) -> Result<HatcheryIdentity> {
        match self {
            Self::Hatchery(identity) => Ok(identity),
            other => Err(EngineError::Forbidden(format!(
                "{} is not a hatchery",
                other.describe()
            ))),
        }
    }

    pub fn into_worker(self) -> Result<WorkerIdentity> {
        match self {
            Self::Worker(identity) => Ok(identity),
            other => Err(EngineError::Forbidden(format!(
                "{} is not a worker",
                other.describe()
            ))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Hatchery(h) => format!("hatchery {}", h.name),
            Self::Worker(w) => format!("worker {}", w.name),
            Self::User(u) => format!("user {}", u.username),
        }
    }
}

/// Resolves an inbound credential to the caller identity.
///
/// The engine trusts this resolution; it only re-checks authorization
/// (region grants, job holders).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity>;
}

/// Fixed credential table, for tests and embedded deployments
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    identities: DashMap<String, Identity>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: impl Into<String>, identity: Identity) {
        self.identities.insert(credential.into(), identity);
    }

    pub fn revoke(&self, credential: &str) -> bool {
        self.identities.remove(credential).is_some()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity> {
        self.identities
            .get(credential)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Unauthorized("unknown credential".to_string()))
    }
}
