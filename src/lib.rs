#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Hatchery Core
//!
//! Workflow-run crafting and job scheduling engine for a continuous-delivery
//! platform.
//!
//! ## Overview
//!
//! A workflow run enters the engine in `Crafting`. Crafting pins every action
//! and worker model reference to a versioned entity and checks that at least
//! one hatchery may run each job. The run's jobs are then queued per region.
//! Hatcheries poll the queue, reserve a job and spawn a worker for it; the
//! worker registers with a spawn token, runs the job and posts its results,
//! which gate the jobs depending on it.
//!
//! ## Architecture
//!
//! The engine holds no lock of its own. Every state change is a
//! compare-and-swap through the [`store::Store`] trait, so any number of
//! hatcheries and workers can race on the same job and exactly one wins.
//! VCS access, credentials and secrets are consumed through traits
//! ([`vcs::RepositoryClient`], [`auth::Authenticator`],
//! [`secrets::SecretResolver`]).
//!
//! ## Module Organization
//!
//! - [`models`] - Runs, run jobs, results, hatcheries, workers and entities
//! - [`state_machine`] - Run and run job lifecycles
//! - [`store`] - Storage trait with in-memory and PostgreSQL implementations
//! - [`orchestration`] - Crafting, queue, coordinators and the [`Engine`] facade
//! - [`auth`] - Caller identities and spawn tokens
//! - [`config`] - Layered configuration
//! - [`events`] - Broadcast of queue lifecycle events
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hatchery_core::auth::StaticAuthenticator;
//! use hatchery_core::config::ConfigManager;
//! use hatchery_core::secrets::StaticSecretResolver;
//! use hatchery_core::store::InMemoryStore;
//! use hatchery_core::vcs::InMemoryRepositoryClient;
//! use hatchery_core::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let engine = Engine::new(
//!     manager.config().clone(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryRepositoryClient::new()),
//!     Arc::new(StaticSecretResolver::new()),
//!     Arc::new(StaticAuthenticator::new()),
//! )?;
//! for (run_id, outcome) in engine.craft_pending().await? {
//!     println!("{run_id}: {outcome:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod secrets;
pub mod state_machine;
pub mod store;
pub mod vcs;

pub use config::{ConfigManager, EngineConfig};
pub use error::{EngineError, Result};
pub use orchestration::{CraftOutcome, Engine, JobPayload};
pub use state_machine::{RunJobStatus, WorkflowRunStatus};
