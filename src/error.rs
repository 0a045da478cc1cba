//! Error types for the hatchery scheduling engine.
//!

use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::errors::StateMachineError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("obsolete workflow dependency used: {reference}")]
    DependencyNotFound { reference: String },
    #[error("wrong configuration on job \"{job}\". No hatchery can run it with model [{model}]")]
    NoAuthorizedHatchery { job: String, model: String },
    #[error("region {0} not found")]
    RegionNotFound(String),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("job {0} has been stopped")]
    JobStopped(Uuid),
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("VCS error: {0}")]
    Vcs(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid spawn token: {0}")]
    Token(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Errors that end a crafting pass and become the run's single RunInfo.
    pub fn is_crafting_failure(&self) -> bool {
        matches!(
            self,
            EngineError::DependencyNotFound { .. }
                | EngineError::NoAuthorizedHatchery { .. }
                | EngineError::RegionNotFound(_)
                | EngineError::InvalidWorkflow(_)
                | EngineError::Timeout { .. }
                | EngineError::Vcs(_)
        )
    }

    /// Expected queue contention; callers re-poll.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Database(format!("migration failed: {err}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(format!("JSON serialization error: {err}"))
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(format!("YAML serialization error: {err}"))
    }
}

impl From<jsonwebtoken::errors::Error> for EngineError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        EngineError::Token(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
