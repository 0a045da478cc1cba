//! # Hatchery Coordinator
//!
//! Hatchery side of the claim protocol: list the jobs it may spawn workers
//! for, take one, give it back when the spawn fails, and report liveness.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::job_queue::{expect_transition, JobQueue};
use super::region_authorizer::RegionAuthorizer;
use super::run_engine::RunEngine;
use super::enforce;
use crate::auth::HatcheryIdentity;
use crate::config::SpawnConfig;
use crate::error::{EngineError, Result};
use crate::logging::log_queue_event;
use crate::models::{Hatchery, HatcheryStatus, RunInfoLevel, RunJob, RunJobInfo};
use crate::state_machine::{HeldByHatcheryGuard, InRegionGuard, RunJobEvent};
use crate::store::{RunJobTransition, Store};

pub struct HatcheryCoordinator {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    authorizer: Arc<RegionAuthorizer>,
    run_engine: Arc<RunEngine>,
    config: SpawnConfig,
}

impl HatcheryCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<JobQueue>,
        authorizer: Arc<RegionAuthorizer>,
        run_engine: Arc<RunEngine>,
        config: SpawnConfig,
    ) -> Self {
        Self {
            store,
            queue,
            authorizer,
            run_engine,
            config,
        }
    }

    async fn hatchery(&self, identity: &HatcheryIdentity) -> Result<Hatchery> {
        self.store
            .load_hatchery(&identity.name)
            .await?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown hatchery {}", identity.name)))
    }

    async fn run_job(&self, run_job_id: Uuid) -> Result<RunJob> {
        self.store
            .load_run_job(run_job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run job", run_job_id))
    }

    /// Queued jobs of a region the hatchery may spawn workers for
    #[instrument(skip(self, identity), fields(hatchery = %identity.name))]
    pub async fn list_queued(&self, identity: &HatcheryIdentity, region: &str) -> Result<Vec<RunJob>> {
        let hatchery = self.hatchery(identity).await?;
        if !self.authorizer.has_spawn_grant(&hatchery.name, region).await? {
            return Err(EngineError::Forbidden(format!(
                "hatchery {} cannot spawn workers for region {region}",
                hatchery.name
            )));
        }
        self.queue.list_queued(region, &hatchery.model_type).await
    }

    /// Reserve a queued job; exactly one concurrent caller wins the others
    /// get [`EngineError::Conflict`]
    #[instrument(skip(self, identity), fields(hatchery = %identity.name, run_job_id = %run_job_id))]
    pub async fn take_job(
        &self,
        identity: &HatcheryIdentity,
        region: &str,
        run_job_id: Uuid,
    ) -> Result<RunJob> {
        let hatchery = self.hatchery(identity).await?;
        let run_job = self.run_job(run_job_id).await?;
        enforce(&InRegionGuard(region), &run_job)?;
        if !self.authorizer.is_authorized(&hatchery, &run_job).await? {
            return Err(EngineError::Forbidden(format!(
                "hatchery {} is not allowed to run job {run_job_id}",
                hatchery.name
            )));
        }
        self.queue.claim(run_job_id, &hatchery.name).await
    }

    /// Give back a job whose worker could not be spawned.
    ///
    /// The job is queued again unless `spawn.max_attempts` is reached, in
    /// which case it fails and its dependents are gated.
    #[instrument(skip(self, identity), fields(hatchery = %identity.name, run_job_id = %run_job_id))]
    pub async fn release_job(
        &self,
        identity: &HatcheryIdentity,
        region: &str,
        run_job_id: Uuid,
        reason: &str,
    ) -> Result<RunJob> {
        let hatchery = self.hatchery(identity).await?;
        let run_job = self.run_job(run_job_id).await?;
        enforce(&InRegionGuard(region), &run_job)?;
        enforce(&HeldByHatcheryGuard(&hatchery.name), &run_job)?;

        let exhausted = self
            .config
            .max_attempts
            .map_or(false, |max| i64::from(run_job.spawn_attempts) + 1 >= i64::from(max));
        let event = if exhausted {
            RunJobEvent::Abandon(reason.to_string())
        } else {
            RunJobEvent::Release
        };
        let transition = RunJobTransition::for_event(&event)?
            .expect_hatchery(&hatchery.name)
            .counting_spawn_attempt();
        let outcome = self
            .queue
            .transition(run_job_id, &transition, Some(&hatchery.name))
            .await?;
        let released = expect_transition(outcome, run_job_id, "release")?;

        log_queue_event("released", &hatchery.name, Some(run_job_id), Some(reason));
        let level = if exhausted {
            RunInfoLevel::Error
        } else {
            RunInfoLevel::Warning
        };
        self.store
            .insert_run_job_info(&RunJobInfo::new(
                &released,
                level,
                format!("hatchery {} failed to spawn a worker: {reason}", hatchery.name),
            ))
            .await?;

        if exhausted {
            warn!(
                spawn_attempts = released.spawn_attempts,
                "Spawn attempts exhausted, job failed"
            );
            self.queue
                .release_dependents(released.workflow_run_id, released.run_attempt)
                .await?;
            self.run_engine
                .sync_run_status(released.workflow_run_id)
                .await?;
        }
        Ok(released)
    }

    pub async fn heartbeat(&self, identity: &HatcheryIdentity, status: &HatcheryStatus) -> Result<()> {
        if !self
            .store
            .record_heartbeat(&identity.name, Utc::now(), status)
            .await?
        {
            return Err(EngineError::Unauthorized(format!(
                "unknown hatchery {}",
                identity.name
            )));
        }
        info!(
            hatchery = %identity.name,
            spawning = status.spawning,
            capacity = status.capacity,
            "Hatchery heartbeat"
        );
        Ok(())
    }
}
