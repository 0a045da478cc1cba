//! # Orchestration Engine
//!
//! Crafting and scheduling core for workflow runs.
//!
//! ## Architecture
//!
//! Every component works against the [`Store`](crate::store::Store) and never
//! holds a lock of its own: concurrent hatcheries and workers are arbitrated
//! by the store's compare-and-swap transitions.
//!
//! ## Core Components
//!
//! - **DependencyResolver**: pins action and worker model references to
//!   versioned entities, store first, then the repository client
//! - **RegionAuthorizer**: hatcheries entitled to spawn for a region and model
//!   type, through `Spawn` region grants
//! - **WorkflowCrafter**: resolves and authorizes every job of a run and moves
//!   it `Crafting → Building | Fail`
//! - **JobQueue**: queued jobs per region, dependency gating and orphan reclaim
//! - **HatcheryCoordinator**: hatchery side of the claim protocol
//! - **WorkerCoordinator**: worker registration, job payload and results
//! - **RunResultAggregator**: job outputs and variable sets as job contexts
//! - **RunEngine**: aggregate run status, cancellation and new attempts
//! - **Engine**: facade wiring everything to one store and configuration

pub mod dependency_resolver;
pub mod engine;
pub mod hatchery_coordinator;
pub mod job_queue;
pub mod region_authorizer;
pub mod run_engine;
pub mod run_result_aggregator;
pub mod worker_coordinator;
pub mod workflow_crafter;

use std::future::Future;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::state_machine::StateGuard;

// Re-export core types and components for easy access
pub use dependency_resolver::{
    ActionUses, DependencyResolver, EntityReference, RepositoryTarget, ResolutionContext,
    ResolutionPass, ResolvedEntity,
};
pub use engine::Engine;
pub use hatchery_coordinator::HatcheryCoordinator;
pub use job_queue::JobQueue;
pub use region_authorizer::RegionAuthorizer;
pub use run_engine::RunEngine;
pub use run_result_aggregator::{JobContexts, RunResultAggregator, SensitiveData};
pub use worker_coordinator::{JobPayload, WorkerCoordinator};
pub use workflow_crafter::{CraftOutcome, WorkflowCrafter};

/// Bound an external call; elapsing is an [`EngineError::Timeout`]
pub(crate) async fn with_timeout<T, F>(operation: &str, duration: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Run a guard, turning its refusal into [`EngineError::Forbidden`]
pub(crate) fn enforce<T>(guard: &dyn StateGuard<T>, entity: &T) -> Result<()> {
    guard
        .check(entity)
        .map_err(|e| EngineError::Forbidden(e.to_string()))
}
