//! # Engine Configuration
//!
//! Layered configuration for the scheduling engine: `engine.yaml`, then the
//! environment overlay `engine.<env>.yaml`, then `HATCHERY__*` environment
//! variables (`HATCHERY__CRAFTING__DEFAULT_REGION=build`).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hatchery_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let vcs_timeout = manager.config().crafting.vcs_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub crafting: CraftingConfig,
    pub queue: QueueConfig,
    pub spawn: SpawnConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Dependency resolution and authorization during crafting
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CraftingConfig {
    /// Region of jobs that declare none
    pub default_region: Option<String>,
    /// Project holding shared `library/<name>` entities
    pub library_project_key: Option<String>,
    /// Single-segment actions shipped with the worker
    pub builtin_actions: Vec<String>,
    /// Maximum nesting of actions using actions
    pub max_action_depth: usize,
    pub vcs_timeout_ms: u64,
    pub store_timeout_ms: u64,
}

impl CraftingConfig {
    pub fn vcs_timeout(&self) -> Duration {
        Duration::from_millis(self.vcs_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for CraftingConfig {
    fn default() -> Self {
        Self {
            default_region: None,
            library_project_key: None,
            builtin_actions: vec![
                "checkout".to_string(),
                "script".to_string(),
                "uploadArtifact".to_string(),
                "downloadArtifact".to_string(),
                "junit".to_string(),
            ],
            max_action_depth: 10,
            vcs_timeout_ms: 10_000,
            store_timeout_ms: 5_000,
        }
    }
}

/// Job queue behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Age after which a `Scheduling` job without a worker is reclaimed
    pub orphan_timeout_secs: u64,
    pub event_channel_capacity: usize,
}

impl QueueConfig {
    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            orphan_timeout_secs: 600,
            event_channel_capacity: 1000,
        }
    }
}

/// Worker spawning and registration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Releases allowed before a job fails; unlimited when unset
    pub max_attempts: Option<u32>,
    /// Clock skew tolerated on spawn token expiry
    pub token_leeway_secs: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            token_leeway_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/hatchery_development".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Directory receiving JSON log files; console only when unset
    pub json_file_directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file_directory: None,
        }
    }
}

impl EngineConfig {
    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.crafting.vcs_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "crafting.vcs_timeout_ms",
                0,
                "timeout must be greater than 0",
            ));
        }

        if self.crafting.store_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "crafting.store_timeout_ms",
                0,
                "timeout must be greater than 0",
            ));
        }

        if self.crafting.max_action_depth == 0 {
            return Err(ConfigurationError::invalid_value(
                "crafting.max_action_depth",
                0,
                "actions must be allowed at least one level",
            ));
        }

        if let Some(region) = &self.crafting.default_region {
            if region.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "crafting.default_region",
                    region,
                    "remove the key instead of setting it empty",
                ));
            }
        }

        if self.queue.event_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.event_channel_capacity",
                0,
                "capacity must be greater than 0",
            ));
        }

        if self.spawn.max_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "spawn.max_attempts",
                0,
                "at least one spawn attempt is required",
            ));
        }

        if self.database.url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "database configuration",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                0,
                "pool size must be greater than 0",
            ));
        }

        Ok(())
    }
}
