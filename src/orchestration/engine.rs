//! # Engine
//!
//! Single entry point wiring every component to one [`Store`], one
//! [`RepositoryClient`] and one [`EngineConfig`]. The surrounding service
//! authenticates callers with [`Engine::authenticate_hatchery`] or
//! [`Engine::authenticate_worker`] and forwards the resulting identity.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use super::dependency_resolver::DependencyResolver;
use super::hatchery_coordinator::HatcheryCoordinator;
use super::job_queue::JobQueue;
use super::region_authorizer::RegionAuthorizer;
use super::run_engine::RunEngine;
use super::run_result_aggregator::RunResultAggregator;
use super::worker_coordinator::{JobPayload, WorkerCoordinator};
use super::workflow_crafter::{CraftOutcome, WorkflowCrafter};
use crate::auth::{Authenticator, HatcheryIdentity, SpawnTokenVerifier, WorkerIdentity};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventPublisher, PublishedEvent};
use crate::models::{
    HatcheryStatus, NewRunResult, NewWorkflowRun, RunInfoLevel, RunJob, RunResult, Worker,
    WorkerRegistration, WorkflowRun,
};
use crate::secrets::SecretResolver;
use crate::state_machine::RunJobStatus;
use crate::store::{Store, TimeoutStore};
use crate::vcs::RepositoryClient;

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    authenticator: Arc<dyn Authenticator>,
    events: EventPublisher,
    crafter: WorkflowCrafter,
    queue: Arc<JobQueue>,
    hatcheries: HatcheryCoordinator,
    workers: WorkerCoordinator,
    runs: Arc<RunEngine>,
}

impl Engine {
    /// Validate the configuration and wire the components.
    ///
    /// Every store call goes through a [`TimeoutStore`] bounded by
    /// `crafting.store_timeout_ms`.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        vcs: Arc<dyn RepositoryClient>,
        secrets: Arc<dyn SecretResolver>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let store: Arc<dyn Store> =
            Arc::new(TimeoutStore::new(store, config.crafting.store_timeout()));
        let events = EventPublisher::new(config.queue.event_channel_capacity);
        let default_region = config.crafting.default_region.clone();

        let queue = Arc::new(JobQueue::new(store.clone(), events.clone()));
        let authorizer = Arc::new(RegionAuthorizer::new(store.clone(), default_region.clone()));
        let runs = Arc::new(RunEngine::new(store.clone(), queue.clone()));
        let aggregator = Arc::new(RunResultAggregator::new(store.clone(), secrets));

        let crafter = WorkflowCrafter::new(
            store.clone(),
            DependencyResolver::new(store.clone(), vcs, config.crafting.clone()),
            RegionAuthorizer::new(store.clone(), default_region),
            events.clone(),
        );
        let hatcheries = HatcheryCoordinator::new(
            store.clone(),
            queue.clone(),
            authorizer.clone(),
            runs.clone(),
            config.spawn.clone(),
        );
        let workers = WorkerCoordinator::new(
            store.clone(),
            queue.clone(),
            authorizer,
            aggregator,
            runs.clone(),
            SpawnTokenVerifier::new(config.spawn.token_leeway_secs),
        );

        info!(
            default_region = ?config.crafting.default_region,
            max_spawn_attempts = ?config.spawn.max_attempts,
            "Engine initialized"
        );
        Ok(Self {
            config,
            store,
            authenticator,
            events,
            crafter,
            queue,
            hatcheries,
            workers,
            runs,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }

    // --- Authentication ---

    pub async fn authenticate_hatchery(&self, credential: &str) -> Result<HatcheryIdentity> {
        self.authenticator.authenticate(credential).await?.into_hatchery()
    }

    pub async fn authenticate_worker(&self, credential: &str) -> Result<WorkerIdentity> {
        self.authenticator.authenticate(credential).await?.into_worker()
    }

    // --- Crafting ---

    /// Store a new run in `Crafting`; [`Engine::craft`] picks it up
    pub async fn create_run(&self, new_run: NewWorkflowRun) -> Result<WorkflowRun> {
        let run = WorkflowRun::new(new_run);
        self.store.insert_run(&run).await?;
        info!(run_id = %run.id, workflow = %run.workflow_name, run_number = run.run_number, "Workflow run created");
        Ok(run)
    }

    pub async fn craft(&self, run_id: Uuid) -> Result<CraftOutcome> {
        self.crafter.craft(run_id).await
    }

    pub async fn craft_pending(&self) -> Result<Vec<(Uuid, CraftOutcome)>> {
        self.crafter.craft_pending().await
    }

    // --- Hatcheries ---

    pub async fn list_queued(&self, hatchery: &HatcheryIdentity, region: &str) -> Result<Vec<RunJob>> {
        self.hatcheries.list_queued(hatchery, region).await
    }

    pub async fn take_job(
        &self,
        hatchery: &HatcheryIdentity,
        region: &str,
        run_job_id: Uuid,
    ) -> Result<RunJob> {
        self.hatcheries.take_job(hatchery, region, run_job_id).await
    }

    pub async fn release_job(
        &self,
        hatchery: &HatcheryIdentity,
        region: &str,
        run_job_id: Uuid,
        reason: &str,
    ) -> Result<RunJob> {
        self.hatcheries
            .release_job(hatchery, region, run_job_id, reason)
            .await
    }

    pub async fn heartbeat(&self, hatchery: &HatcheryIdentity, status: &HatcheryStatus) -> Result<()> {
        self.hatcheries.heartbeat(hatchery, status).await
    }

    /// Put back jobs whose worker never registered within `queue.orphan_timeout_secs`
    pub async fn reclaim_orphans(&self) -> Result<Vec<RunJob>> {
        self.queue
            .reclaim_orphans(self.config.queue.orphan_timeout())
            .await
    }

    // --- Workers ---

    pub async fn register_worker(
        &self,
        spawn_token: &str,
        region: &str,
        registration: WorkerRegistration,
    ) -> Result<Worker> {
        self.workers.register(spawn_token, region, registration).await
    }

    pub async fn take_job_payload(&self, worker: &WorkerIdentity, run_job_id: Uuid) -> Result<JobPayload> {
        self.workers.take_job(worker, run_job_id).await
    }

    pub async fn post_run_result(
        &self,
        worker: &WorkerIdentity,
        run_job_id: Uuid,
        result: NewRunResult,
    ) -> Result<RunResult> {
        self.workers.post_run_result(worker, run_job_id, result).await
    }

    pub async fn post_job_result(
        &self,
        worker: &WorkerIdentity,
        run_job_id: Uuid,
        status: RunJobStatus,
        error: Option<String>,
    ) -> Result<RunJob> {
        self.workers
            .post_job_result(worker, run_job_id, status, error)
            .await
    }

    pub async fn post_job_info(
        &self,
        worker: &WorkerIdentity,
        run_job_id: Uuid,
        level: RunInfoLevel,
        message: &str,
    ) -> Result<()> {
        self.workers
            .post_job_info(worker, run_job_id, level, message)
            .await
    }

    pub async fn refresh_worker(&self, worker: &WorkerIdentity) -> Result<()> {
        self.workers.refresh(worker).await
    }

    pub async fn unregister_worker(&self, worker: &WorkerIdentity) -> Result<()> {
        self.workers.unregister(worker).await
    }

    // --- Runs ---

    pub async fn stop_run(&self, run_id: Uuid, reason: &str) -> Result<WorkflowRun> {
        self.runs.stop_run(run_id, reason).await
    }

    pub async fn stop_job(&self, run_job_id: Uuid, reason: &str) -> Result<RunJob> {
        self.runs.stop_job(run_job_id, reason).await
    }

    pub async fn restart_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.runs.restart_run(run_id).await
    }

    pub async fn mark_read_only(&self, run_id: Uuid) -> Result<()> {
        self.runs.mark_read_only(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, StaticAuthenticator};
    use crate::secrets::StaticSecretResolver;
    use crate::store::InMemoryStore;
    use crate::vcs::InMemoryRepositoryClient;

    fn engine(config: EngineConfig) -> Result<Engine> {
        let authenticator = StaticAuthenticator::new();
        authenticator.insert("hatchery-session", Identity::Hatchery(HatcheryIdentity::new("docker-1")));
        Engine::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryRepositoryClient::new()),
            Arc::new(StaticSecretResolver::new()),
            Arc::new(authenticator),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.queue.event_channel_capacity = 0;
        assert!(matches!(engine(config), Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_authenticate_checks_identity_kind() {
        let engine = engine(EngineConfig::default()).unwrap();
        let hatchery = engine.authenticate_hatchery("hatchery-session").await.unwrap();
        assert_eq!(hatchery.name, "docker-1");
        assert!(matches!(
            engine.authenticate_worker("hatchery-session").await,
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            engine.authenticate_hatchery("unknown").await,
            Err(EngineError::Unauthorized(_))
        ));
    }
}
