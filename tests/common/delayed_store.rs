//! Store wrapper delaying chosen operations, used to exercise store timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hatchery_core::models::{
    Entity, EntityLookup, EntityType, Hatchery, HatcheryStatus, Region, RegionGrant, RunInfo,
    RunJob, RunJobInfo, RunResult, VariableSet, Worker, WorkflowRun,
};
use hatchery_core::state_machine::{RunJobStatus, WorkflowRunStatus};
use hatchery_core::store::{CasResult, RunJobTransition, Store, UpsertResult};
use hatchery_core::Result;
use uuid::Uuid;

/// Delegates to `inner`, sleeping `delay` before each operation named in `delayed`
pub struct DelayedStore {
    inner: Arc<dyn Store>,
    delayed: Vec<&'static str>,
    delay: Duration,
}

impl DelayedStore {
    pub fn new(inner: Arc<dyn Store>, delayed: &[&'static str], delay: Duration) -> Self {
        Self {
            inner,
            delayed: delayed.to_vec(),
            delay,
        }
    }

    async fn pace(&self, operation: &str) {
        if self.delayed.iter().any(|delayed| *delayed == operation) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Store for DelayedStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.pace("insert_run").await;
        self.inner.insert_run(run).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        self.pace("load_run").await;
        self.inner.load_run(run_id).await
    }

    async fn load_runs_by_status(&self, status: WorkflowRunStatus) -> Result<Vec<WorkflowRun>> {
        self.pace("load_runs_by_status").await;
        self.inner.load_runs_by_status(status).await
    }

    async fn complete_craft(
        &self,
        run: &WorkflowRun,
        run_jobs: &[RunJob],
    ) -> Result<CasResult<WorkflowRun>> {
        self.pace("complete_craft").await;
        self.inner.complete_craft(run, run_jobs).await
    }

    async fn fail_craft(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        info: &RunInfo,
    ) -> Result<CasResult<WorkflowRun>> {
        self.pace("fail_craft").await;
        self.inner.fail_craft(run_id, run_attempt, info).await
    }

    async fn cas_run_status(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> Result<CasResult<WorkflowRun>> {
        self.pace("cas_run_status").await;
        self.inner.cas_run_status(run_id, run_attempt, from, to).await
    }

    async fn start_run_attempt(
        &self,
        run_id: Uuid,
        expected_attempt: i32,
    ) -> Result<CasResult<WorkflowRun>> {
        self.pace("start_run_attempt").await;
        self.inner.start_run_attempt(run_id, expected_attempt).await
    }

    async fn set_run_read_only(&self, run_id: Uuid) -> Result<bool> {
        self.pace("set_run_read_only").await;
        self.inner.set_run_read_only(run_id).await
    }

    async fn insert_run_info(&self, info: &RunInfo) -> Result<()> {
        self.pace("insert_run_info").await;
        self.inner.insert_run_info(info).await
    }

    async fn load_run_infos(&self, run_id: Uuid) -> Result<Vec<RunInfo>> {
        self.pace("load_run_infos").await;
        self.inner.load_run_infos(run_id).await
    }

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<Option<RunJob>> {
        self.pace("load_run_job").await;
        self.inner.load_run_job(run_job_id).await
    }

    async fn load_run_jobs(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>> {
        self.pace("load_run_jobs").await;
        self.inner.load_run_jobs(run_id, run_attempt).await
    }

    async fn load_run_jobs_by_status(
        &self,
        status: RunJobStatus,
        region: Option<&str>,
    ) -> Result<Vec<RunJob>> {
        self.pace("load_run_jobs_by_status").await;
        self.inner.load_run_jobs_by_status(status, region).await
    }

    async fn transition_run_job(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
    ) -> Result<CasResult<RunJob>> {
        self.pace("transition_run_job").await;
        self.inner.transition_run_job(run_job_id, transition).await
    }

    async fn insert_run_job_info(&self, info: &RunJobInfo) -> Result<()> {
        self.pace("insert_run_job_info").await;
        self.inner.insert_run_job_info(info).await
    }

    async fn load_run_job_infos(&self, run_job_id: Uuid) -> Result<Vec<RunJobInfo>> {
        self.pace("load_run_job_infos").await;
        self.inner.load_run_job_infos(run_job_id).await
    }

    async fn upsert_run_result(&self, result: &RunResult) -> Result<UpsertResult> {
        self.pace("upsert_run_result").await;
        self.inner.upsert_run_result(result).await
    }

    async fn load_run_results(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunResult>> {
        self.pace("load_run_results").await;
        self.inner.load_run_results(run_id, run_attempt).await
    }

    async fn insert_hatchery(&self, hatchery: &Hatchery) -> Result<()> {
        self.pace("insert_hatchery").await;
        self.inner.insert_hatchery(hatchery).await
    }

    async fn load_hatchery(&self, name: &str) -> Result<Option<Hatchery>> {
        self.pace("load_hatchery").await;
        self.inner.load_hatchery(name).await
    }

    async fn load_hatcheries(&self) -> Result<Vec<Hatchery>> {
        self.pace("load_hatcheries").await;
        self.inner.load_hatcheries().await
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        status: &HatcheryStatus,
    ) -> Result<bool> {
        self.pace("record_heartbeat").await;
        self.inner.record_heartbeat(name, at, status).await
    }

    async fn insert_region(&self, region: &Region) -> Result<()> {
        self.pace("insert_region").await;
        self.inner.insert_region(region).await
    }

    async fn load_region(&self, name: &str) -> Result<Option<Region>> {
        self.pace("load_region").await;
        self.inner.load_region(name).await
    }

    async fn insert_region_grant(&self, grant: &RegionGrant) -> Result<()> {
        self.pace("insert_region_grant").await;
        self.inner.insert_region_grant(grant).await
    }

    async fn delete_region_grant(&self, grant: &RegionGrant) -> Result<bool> {
        self.pace("delete_region_grant").await;
        self.inner.delete_region_grant(grant).await
    }

    async fn load_region_grants(&self, region: &str) -> Result<Vec<RegionGrant>> {
        self.pace("load_region_grants").await;
        self.inner.load_region_grants(region).await
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.pace("insert_entity").await;
        self.inner.insert_entity(entity).await
    }

    async fn find_entity(&self, lookup: &EntityLookup) -> Result<Option<Entity>> {
        self.pace("find_entity").await;
        self.inner.find_entity(lookup).await
    }

    async fn find_project_entity(
        &self,
        project_key: &str,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>> {
        self.pace("find_project_entity").await;
        self.inner.find_project_entity(project_key, entity_type, name).await
    }

    async fn insert_variable_set(&self, variable_set: &VariableSet) -> Result<()> {
        self.pace("insert_variable_set").await;
        self.inner.insert_variable_set(variable_set).await
    }

    async fn load_variable_set(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<Option<VariableSet>> {
        self.pace("load_variable_set").await;
        self.inner.load_variable_set(project_key, name).await
    }

    async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        self.pace("insert_worker").await;
        self.inner.insert_worker(worker).await
    }

    async fn load_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        self.pace("load_worker").await;
        self.inner.load_worker(worker_id).await
    }

    async fn load_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        self.pace("load_worker_by_name").await;
        self.inner.load_worker_by_name(name).await
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        self.pace("update_worker").await;
        self.inner.update_worker(worker).await
    }
}
