//! In-memory store implementation.
//!
//! Every operation takes the single state lock, so multi-row operations such
//! as [`Store::complete_craft`] are atomic and CAS checks happen under the
//! same write lock as the update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{CasResult, RunJobTransition, Store, UpsertResult};
use crate::error::{EngineError, Result};
use crate::models::{
    Entity, EntityLookup, EntityType, Hatchery, HatcheryStatus, Region, RegionGrant, RunInfo, RunJob,
    RunJobInfo, RunResult, RunResultStatus, VariableSet, Worker, WorkflowRun,
};
use crate::state_machine::{RunJobStatus, WorkflowRunStatus};

#[derive(Debug, Default)]
struct InMemoryState {
    runs: HashMap<Uuid, WorkflowRun>,
    run_infos: Vec<RunInfo>,
    run_jobs: HashMap<Uuid, RunJob>,
    run_job_infos: Vec<RunJobInfo>,
    run_results: Vec<RunResult>,
    hatcheries: HashMap<String, Hatchery>,
    regions: HashMap<String, Region>,
    grants: Vec<RegionGrant>,
    entities: Vec<Entity>,
    variable_sets: HashMap<(String, String), VariableSet>,
    workers: HashMap<Uuid, Worker>,
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cas_run(
    state: &mut InMemoryState,
    run_id: Uuid,
    run_attempt: i32,
    from: &[WorkflowRunStatus],
    update: impl FnOnce(&mut WorkflowRun),
) -> CasResult<WorkflowRun> {
    let Some(run) = state.runs.get_mut(&run_id) else {
        return CasResult::NotFound;
    };
    if run.run_attempt != run_attempt || !from.contains(&run.status) {
        return CasResult::StateMismatch {
            actual: run.clone(),
        };
    }
    update(run);
    run.last_modified = Utc::now();
    CasResult::Success(run.clone())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.state.write().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.state.read().runs.get(&run_id).cloned())
    }

    async fn load_runs_by_status(&self, status: WorkflowRunStatus) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .state
            .read()
            .runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|run| (run.started, run.id));
        Ok(runs)
    }

    async fn complete_craft(
        &self,
        run: &WorkflowRun,
        run_jobs: &[RunJob],
    ) -> Result<CasResult<WorkflowRun>> {
        let mut state = self.state.write();
        let result = cas_run(
            &mut state,
            run.id,
            run.run_attempt,
            &[WorkflowRunStatus::Crafting],
            |stored| {
                stored.workflow_data = run.workflow_data.clone();
                stored.status = WorkflowRunStatus::Building;
            },
        );
        if result.is_success() {
            for run_job in run_jobs {
                state.run_jobs.insert(run_job.id, run_job.clone());
            }
        }
        Ok(result)
    }

    async fn fail_craft(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        info: &RunInfo,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut state = self.state.write();
        let result = cas_run(
            &mut state,
            run_id,
            run_attempt,
            &[WorkflowRunStatus::Crafting],
            |stored| stored.status = WorkflowRunStatus::Fail,
        );
        if result.is_success() {
            state.run_infos.push(info.clone());
        }
        Ok(result)
    }

    async fn cas_run_status(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut state = self.state.write();
        Ok(cas_run(&mut state, run_id, run_attempt, from, |stored| {
            stored.status = to
        }))
    }

    async fn start_run_attempt(
        &self,
        run_id: Uuid,
        expected_attempt: i32,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut state = self.state.write();
        Ok(cas_run(
            &mut state,
            run_id,
            expected_attempt,
            &[
                WorkflowRunStatus::Success,
                WorkflowRunStatus::Fail,
                WorkflowRunStatus::Cancelled,
            ],
            |stored| {
                stored.status = WorkflowRunStatus::Crafting;
                stored.run_attempt += 1;
            },
        ))
    }

    async fn set_run_read_only(&self, run_id: Uuid) -> Result<bool> {
        let mut state = self.state.write();
        match state.runs.get_mut(&run_id) {
            Some(run) => {
                run.read_only = true;
                run.last_modified = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_run_info(&self, info: &RunInfo) -> Result<()> {
        self.state.write().run_infos.push(info.clone());
        Ok(())
    }

    async fn load_run_infos(&self, run_id: Uuid) -> Result<Vec<RunInfo>> {
        Ok(self
            .state
            .read()
            .run_infos
            .iter()
            .filter(|info| info.workflow_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<Option<RunJob>> {
        Ok(self.state.read().run_jobs.get(&run_job_id).cloned())
    }

    async fn load_run_jobs(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>> {
        let mut run_jobs: Vec<RunJob> = self
            .state
            .read()
            .run_jobs
            .values()
            .filter(|job| job.workflow_run_id == run_id && job.run_attempt == run_attempt)
            .cloned()
            .collect();
        run_jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(run_jobs)
    }

    async fn load_run_jobs_by_status(
        &self,
        status: RunJobStatus,
        region: Option<&str>,
    ) -> Result<Vec<RunJob>> {
        let mut run_jobs: Vec<RunJob> = self
            .state
            .read()
            .run_jobs
            .values()
            .filter(|job| job.status == status)
            .filter(|job| region.map_or(true, |region| job.region == region))
            .cloned()
            .collect();
        run_jobs.sort_by_key(|job| (job.queued, job.id));
        Ok(run_jobs)
    }

    async fn transition_run_job(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
    ) -> Result<CasResult<RunJob>> {
        let mut state = self.state.write();
        let Some(run_job) = state.run_jobs.get_mut(&run_job_id) else {
            return Ok(CasResult::NotFound);
        };
        if !transition.matches(run_job) {
            return Ok(CasResult::StateMismatch {
                actual: run_job.clone(),
            });
        }
        transition.apply(run_job, Utc::now());
        Ok(CasResult::Success(run_job.clone()))
    }

    async fn insert_run_job_info(&self, info: &RunJobInfo) -> Result<()> {
        self.state.write().run_job_infos.push(info.clone());
        Ok(())
    }

    async fn load_run_job_infos(&self, run_job_id: Uuid) -> Result<Vec<RunJobInfo>> {
        Ok(self
            .state
            .read()
            .run_job_infos
            .iter()
            .filter(|info| info.run_job_id == run_job_id)
            .cloned()
            .collect())
    }

    async fn upsert_run_result(&self, result: &RunResult) -> Result<UpsertResult> {
        let mut state = self.state.write();
        let position = state
            .run_results
            .iter()
            .position(|existing| existing.same_key(result));
        match position {
            Some(index) => {
                let existing = &mut state.run_results[index];
                if existing.status == RunResultStatus::Completed {
                    return Ok(UpsertResult::Rejected {
                        existing: existing.clone(),
                    });
                }
                existing.status = result.status;
                existing.detail = result.detail.clone();
                existing.issued_at = result.issued_at;
                Ok(UpsertResult::Updated)
            }
            None => {
                state.run_results.push(result.clone());
                Ok(UpsertResult::Inserted)
            }
        }
    }

    async fn load_run_results(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunResult>> {
        Ok(self
            .state
            .read()
            .run_results
            .iter()
            .filter(|result| result.workflow_run_id == run_id && result.run_attempt == run_attempt)
            .cloned()
            .collect())
    }

    async fn insert_hatchery(&self, hatchery: &Hatchery) -> Result<()> {
        let mut state = self.state.write();
        if state.hatcheries.contains_key(&hatchery.name) {
            return Err(EngineError::Conflict(format!(
                "hatchery {} already exists",
                hatchery.name
            )));
        }
        state
            .hatcheries
            .insert(hatchery.name.clone(), hatchery.clone());
        Ok(())
    }

    async fn load_hatchery(&self, name: &str) -> Result<Option<Hatchery>> {
        Ok(self.state.read().hatcheries.get(name).cloned())
    }

    async fn load_hatcheries(&self) -> Result<Vec<Hatchery>> {
        let mut hatcheries: Vec<Hatchery> =
            self.state.read().hatcheries.values().cloned().collect();
        hatcheries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hatcheries)
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        status: &HatcheryStatus,
    ) -> Result<bool> {
        let mut state = self.state.write();
        match state.hatcheries.get_mut(name) {
            Some(hatchery) => {
                hatchery.last_heartbeat = Some(at);
                hatchery.last_status = Some(status.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_region(&self, region: &Region) -> Result<()> {
        self.state
            .write()
            .regions
            .insert(region.name.clone(), region.clone());
        Ok(())
    }

    async fn load_region(&self, name: &str) -> Result<Option<Region>> {
        Ok(self.state.read().regions.get(name).cloned())
    }

    async fn insert_region_grant(&self, grant: &RegionGrant) -> Result<()> {
        let mut state = self.state.write();
        if !state.grants.contains(grant) {
            state.grants.push(grant.clone());
        }
        Ok(())
    }

    async fn delete_region_grant(&self, grant: &RegionGrant) -> Result<bool> {
        let mut state = self.state.write();
        let before = state.grants.len();
        state.grants.retain(|existing| existing != grant);
        Ok(state.grants.len() != before)
    }

    async fn load_region_grants(&self, region: &str) -> Result<Vec<RegionGrant>> {
        Ok(self
            .state
            .read()
            .grants
            .iter()
            .filter(|grant| grant.region == region)
            .cloned()
            .collect())
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.state.write().entities.push(entity.clone());
        Ok(())
    }

    async fn find_entity(&self, lookup: &EntityLookup) -> Result<Option<Entity>> {
        let state = self.state.read();
        let candidates = state.entities.iter().filter(|entity| {
            entity.repository_ref() == lookup.repository
                && entity.entity_type == lookup.entity_type
                && entity.name == lookup.name
                && entity.git_ref == lookup.git_ref
                && lookup
                    .commit
                    .as_ref()
                    .map_or(true, |commit| &entity.commit == commit)
        });
        Ok(candidates.max_by_key(|entity| entity.last_update).cloned())
    }

    async fn find_project_entity(
        &self,
        project_key: &str,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>> {
        let state = self.state.read();
        Ok(state
            .entities
            .iter()
            .filter(|entity| {
                entity.project_key == project_key
                    && entity.entity_type == entity_type
                    && entity.name == name
            })
            .max_by_key(|entity| entity.last_update)
            .cloned())
    }

    async fn insert_variable_set(&self, variable_set: &VariableSet) -> Result<()> {
        self.state.write().variable_sets.insert(
            (variable_set.project_key.clone(), variable_set.name.clone()),
            variable_set.clone(),
        );
        Ok(())
    }

    async fn load_variable_set(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<Option<VariableSet>> {
        Ok(self
            .state
            .read()
            .variable_sets
            .get(&(project_key.to_string(), name.to_string()))
            .cloned())
    }

    async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        let mut state = self.state.write();
        if state.workers.values().any(|existing| existing.name == worker.name) {
            return Err(EngineError::Conflict(format!(
                "worker {} already exists",
                worker.name
            )));
        }
        state.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn load_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        Ok(self.state.read().workers.get(&worker_id).cloned())
    }

    async fn load_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        Ok(self
            .state
            .read()
            .workers
            .values()
            .find(|worker| worker.name == name)
            .cloned())
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let mut state = self.state.write();
        match state.workers.get_mut(&worker.id) {
            Some(existing) => {
                *existing = worker.clone();
                Ok(())
            }
            None => Err(EngineError::not_found("worker", worker.id)),
        }
    }
}
