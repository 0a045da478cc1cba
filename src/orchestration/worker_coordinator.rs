//! # Worker Coordinator
//!
//! Worker side of the protocol. A worker registers with the spawn token its
//! hatchery signed, takes the job payload, posts results while running and
//! finally the job status. Each call is checked against the run job the
//! worker is bound to; a stopped job answers [`EngineError::JobStopped`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::dependency_resolver::ACTIONS_PREFIX;
use super::enforce;
use super::job_queue::{expect_transition, JobQueue};
use super::region_authorizer::RegionAuthorizer;
use super::run_engine::RunEngine;
use super::run_result_aggregator::{JobContexts, RunResultAggregator, SensitiveData};
use crate::auth::{SpawnTokenVerifier, WorkerIdentity};
use crate::error::{EngineError, Result};
use crate::models::{
    ActionDefinition, ActionStep, NewRunResult, RunInfoLevel, RunJob, RunJobInfo, RunResult,
    Worker, WorkerModelDefinition, WorkerRegistration, WorkerStatus,
};
use crate::state_machine::{
    BoundToWorkerGuard, HeldByHatcheryGuard, InRegionGuard, RunJobEvent, RunJobStatus,
};
use crate::store::{CasResult, Holder, RunJobTransition, Store};

/// Everything a worker needs to run its job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub run_job: RunJob,
    pub contexts: JobContexts,
    /// Actions the job's steps use, directly or nested, by complete name
    pub actions: BTreeMap<String, ActionDefinition>,
    pub worker_model: Option<WorkerModelDefinition>,
    pub sensitive_data: SensitiveData,
}

pub struct WorkerCoordinator {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    authorizer: Arc<RegionAuthorizer>,
    aggregator: Arc<RunResultAggregator>,
    run_engine: Arc<RunEngine>,
    verifier: SpawnTokenVerifier,
}

impl WorkerCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<JobQueue>,
        authorizer: Arc<RegionAuthorizer>,
        aggregator: Arc<RunResultAggregator>,
        run_engine: Arc<RunEngine>,
        verifier: SpawnTokenVerifier,
    ) -> Self {
        Self {
            store,
            queue,
            authorizer,
            aggregator,
            run_engine,
            verifier,
        }
    }

    /// Register the worker a spawn token was issued for.
    ///
    /// The same worker registering again gets its existing record back; any
    /// other worker on an already bound job is a [`EngineError::Conflict`].
    #[instrument(skip(self, token, registration))]
    pub async fn register(
        &self,
        token: &str,
        region: &str,
        registration: WorkerRegistration,
    ) -> Result<Worker> {
        let unverified = self
            .verifier
            .peek(token)
            .map_err(|e| EngineError::Unauthorized(format!("invalid spawn token: {e}")))?;
        let hatchery = self
            .store
            .load_hatchery(&unverified.iss)
            .await?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown hatchery {}", unverified.iss)))?;
        let claims = self.verifier.verify(token, &hatchery)?;

        if !self.authorizer.has_spawn_grant(&hatchery.name, region).await? {
            return Err(EngineError::Forbidden(format!(
                "hatchery {} cannot spawn workers for region {region}",
                hatchery.name
            )));
        }

        let run_job = self.load_run_job(claims.run_job_id).await?;
        if run_job.status == RunJobStatus::Stopped {
            return Err(EngineError::JobStopped(run_job.id));
        }
        enforce(&InRegionGuard(region), &run_job)?;
        enforce(&HeldByHatcheryGuard(&hatchery.name), &run_job)?;
        if !run_job.model_name.is_empty() && run_job.model_name != claims.model {
            return Err(EngineError::Forbidden(format!(
                "job {} requires model {}, worker was spawned with {}",
                run_job.id, run_job.model_name, claims.model
            )));
        }

        if run_job.is_bound_to(&claims.sub) {
            if let Some(existing) = self.store.load_worker_by_name(&claims.sub).await? {
                debug!(worker = %existing.name, "Worker registered again");
                return Ok(existing);
            }
        } else {
            let transition = RunJobTransition::bind_worker(&hatchery.name, &claims.sub);
            match self.queue.transition(run_job.id, &transition, Some(&claims.sub)).await? {
                CasResult::Success(_) => {}
                CasResult::StateMismatch { actual } if actual.is_bound_to(&claims.sub) => {}
                CasResult::StateMismatch { actual } => {
                    return Err(EngineError::Conflict(format!(
                        "job {} is {} with worker {}",
                        actual.id,
                        actual.status,
                        actual.worker_name.as_deref().unwrap_or("none")
                    )))
                }
                CasResult::NotFound => return Err(EngineError::not_found("run job", run_job.id)),
            }
        }

        let worker = Worker {
            id: Uuid::new_v4(),
            name: claims.sub.clone(),
            hatchery_name: hatchery.name.clone(),
            run_job_id: run_job.id,
            model_name: claims.model.clone(),
            status: WorkerStatus::Waiting,
            last_beat: Utc::now(),
            os: registration.os,
            arch: registration.arch,
            version: registration.version,
        };
        if let Err(e) = self.store.insert_worker(&worker).await {
            // Another registration of the same worker won the insert.
            if e.is_conflict() {
                if let Some(existing) = self.store.load_worker_by_name(&worker.name).await? {
                    return Ok(existing);
                }
            }
            return Err(e);
        }

        self.store
            .insert_run_job_info(&RunJobInfo::new(
                &run_job,
                RunInfoLevel::Info,
                format!(
                    "worker {} ({}/{}) registered on hatchery {}",
                    worker.name, worker.os, worker.arch, worker.hatchery_name
                ),
            ))
            .await?;
        info!(worker = %worker.name, hatchery = %worker.hatchery_name, run_job_id = %run_job.id, "Worker registered");
        Ok(worker)
    }

    /// `Scheduling → Building` and the job payload
    #[instrument(skip(self, identity), fields(worker = %identity.name, run_job_id = %run_job_id))]
    pub async fn take_job(&self, identity: &WorkerIdentity, run_job_id: Uuid) -> Result<JobPayload> {
        let mut worker = self.worker(identity).await?;
        check_assignment(identity, run_job_id)?;

        let transition = RunJobTransition::for_event(&RunJobEvent::Start(worker.name.clone()))?
            .expect_hatchery(&worker.hatchery_name)
            .expect_worker(Holder::Is(worker.name.clone()));
        let run_job = match self
            .queue
            .transition(run_job_id, &transition, Some(&worker.name))
            .await?
        {
            CasResult::StateMismatch { actual }
                if actual.status == RunJobStatus::Building && actual.is_bound_to(&worker.name) =>
            {
                debug!("Job payload taken again");
                actual
            }
            outcome => expect_transition(outcome, run_job_id, "take")?,
        };

        worker.status = WorkerStatus::Building;
        worker.last_beat = Utc::now();
        self.store.update_worker(&worker).await?;

        let run = self
            .store
            .load_run(run_job.workflow_run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow run", run_job.workflow_run_id))?;
        let (contexts, sensitive_data) = self.aggregator.build_contexts(&run, &run_job).await?;
        let actions = actions_used_by(&run_job.job.steps, &run.workflow_data.actions);
        let worker_model = run
            .workflow_data
            .worker_models
            .get(&run_job.model_name)
            .cloned();

        Ok(JobPayload {
            run_job,
            contexts,
            actions,
            worker_model,
            sensitive_data,
        })
    }

    #[instrument(skip(self, identity, result), fields(worker = %identity.name, run_job_id = %run_job_id))]
    pub async fn post_run_result(
        &self,
        identity: &WorkerIdentity,
        run_job_id: Uuid,
        result: NewRunResult,
    ) -> Result<RunResult> {
        self.worker(identity).await?;
        let run_job = self.running_job(identity, run_job_id).await?;
        self.aggregator.record(&run_job, result).await
    }

    /// `Building → Success | Fail`, then gate dependents and settle the run
    #[instrument(skip(self, identity, error), fields(worker = %identity.name, run_job_id = %run_job_id))]
    pub async fn post_job_result(
        &self,
        identity: &WorkerIdentity,
        run_job_id: Uuid,
        status: RunJobStatus,
        error: Option<String>,
    ) -> Result<RunJob> {
        let mut worker = self.worker(identity).await?;
        check_assignment(identity, run_job_id)?;
        let (event, worker_status) = match status {
            RunJobStatus::Success => (RunJobEvent::Succeed, WorkerStatus::Success),
            RunJobStatus::Fail => (RunJobEvent::Fail(error), WorkerStatus::Fail),
            other => {
                return Err(EngineError::Forbidden(format!(
                    "a worker cannot end a job with status {other}"
                )))
            }
        };

        let transition =
            RunJobTransition::for_event(&event)?.expect_worker(Holder::Is(worker.name.clone()));
        let outcome = self
            .queue
            .transition(run_job_id, &transition, Some(&worker.name))
            .await?;
        let ended = expect_transition(outcome, run_job_id, "end")?;

        if let Some(message) = event.error_message().filter(|m| !m.is_empty()) {
            self.store
                .insert_run_job_info(&RunJobInfo::new(&ended, RunInfoLevel::Error, message))
                .await?;
        }
        worker.status = worker_status;
        worker.last_beat = Utc::now();
        self.store.update_worker(&worker).await?;

        self.queue
            .release_dependents(ended.workflow_run_id, ended.run_attempt)
            .await?;
        self.run_engine.sync_run_status(ended.workflow_run_id).await?;
        Ok(ended)
    }

    pub async fn post_job_info(
        &self,
        identity: &WorkerIdentity,
        run_job_id: Uuid,
        level: RunInfoLevel,
        message: &str,
    ) -> Result<()> {
        self.worker(identity).await?;
        let run_job = self.bound_job(identity, run_job_id).await?;
        self.store
            .insert_run_job_info(&RunJobInfo::new(&run_job, level, message))
            .await
    }

    /// Liveness of a worker; tells it when its job was stopped
    pub async fn refresh(&self, identity: &WorkerIdentity) -> Result<()> {
        let mut worker = self.worker(identity).await?;
        worker.last_beat = Utc::now();
        self.store.update_worker(&worker).await?;
        self.bound_job(identity, worker.run_job_id).await?;
        Ok(())
    }

    /// Disable a worker; its job is left as is
    pub async fn unregister(&self, identity: &WorkerIdentity) -> Result<()> {
        let mut worker = self.worker(identity).await?;
        worker.status = WorkerStatus::Disabled;
        worker.last_beat = Utc::now();
        self.store.update_worker(&worker).await?;
        info!(worker = %worker.name, "Worker unregistered");
        Ok(())
    }

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<RunJob> {
        self.store
            .load_run_job(run_job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run job", run_job_id))
    }

    /// The calling worker, unless unknown or disabled
    async fn worker(&self, identity: &WorkerIdentity) -> Result<Worker> {
        let worker = self
            .store
            .load_worker(identity.worker_id)
            .await?
            .filter(|worker| worker.name == identity.name)
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown worker {}", identity.name)))?;
        if worker.status == WorkerStatus::Disabled {
            return Err(EngineError::Unauthorized(format!(
                "worker {} is disabled",
                worker.name
            )));
        }
        Ok(worker)
    }

    /// The run job the worker is bound to
    async fn bound_job(&self, identity: &WorkerIdentity, run_job_id: Uuid) -> Result<RunJob> {
        check_assignment(identity, run_job_id)?;
        let run_job = self.load_run_job(run_job_id).await?;
        if run_job.status == RunJobStatus::Stopped {
            return Err(EngineError::JobStopped(run_job_id));
        }
        enforce(&BoundToWorkerGuard(&identity.name), &run_job)?;
        Ok(run_job)
    }

    /// The bound run job, which must still be `Building`
    async fn running_job(&self, identity: &WorkerIdentity, run_job_id: Uuid) -> Result<RunJob> {
        let run_job = self.bound_job(identity, run_job_id).await?;
        if run_job.status != RunJobStatus::Building {
            return Err(EngineError::Conflict(format!(
                "job {run_job_id} is {}",
                run_job.status
            )));
        }
        Ok(run_job)
    }
}

fn check_assignment(identity: &WorkerIdentity, run_job_id: Uuid) -> Result<()> {
    if identity.run_job_id != run_job_id {
        return Err(EngineError::Forbidden(format!(
            "worker {} is not assigned to job {run_job_id}",
            identity.name
        )));
    }
    Ok(())
}

/// Crafted actions reachable from the steps, nested ones included.
///
/// Built-in actions have no crafted definition and are left out.
fn actions_used_by(
    steps: &[ActionStep],
    crafted: &BTreeMap<String, ActionDefinition>,
) -> BTreeMap<String, ActionDefinition> {
    let mut used = BTreeMap::new();
    let mut pending: Vec<&str> = steps.iter().filter_map(|s| s.uses.as_deref()).collect();
    let mut seen = BTreeSet::new();
    while let Some(uses) = pending.pop() {
        let name = uses.strip_prefix(ACTIONS_PREFIX).unwrap_or(uses);
        if !seen.insert(name) {
            continue;
        }
        if let Some((name, definition)) = crafted.get_key_value(name) {
            pending.extend(definition.runs.steps.iter().filter_map(|s| s.uses.as_deref()));
            used.insert(name.clone(), definition.clone());
        }
    }
    used
}
