//! Store decorator bounding every call with a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CasResult, RunJobTransition, Store, UpsertResult};
use crate::error::Result;
use crate::models::{
    Entity, EntityLookup, EntityType, Hatchery, HatcheryStatus, Region, RegionGrant, RunInfo,
    RunJob, RunJobInfo, RunResult, VariableSet, Worker, WorkflowRun,
};
use crate::orchestration::with_timeout;
use crate::state_machine::{RunJobStatus, WorkflowRunStatus};

/// Wraps a store so no call blocks longer than `timeout`.
///
/// An elapsed call fails with `EngineError::Timeout`; the wrapped operation
/// may still have been applied.
pub struct TimeoutStore {
    inner: Arc<dyn Store>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(operation, self.timeout, call).await
    }
}

#[async_trait]
impl Store for TimeoutStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.timed("store.insert_run", self.inner.insert_run(run)).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        self.timed("store.load_run", self.inner.load_run(run_id)).await
    }

    async fn load_runs_by_status(&self, status: WorkflowRunStatus) -> Result<Vec<WorkflowRun>> {
        self.timed("store.load_runs_by_status", self.inner.load_runs_by_status(status)).await
    }

    async fn complete_craft(
        &self,
        run: &WorkflowRun,
        run_jobs: &[RunJob],
    ) -> Result<CasResult<WorkflowRun>> {
        self.timed("store.complete_craft", self.inner.complete_craft(run, run_jobs)).await
    }

    async fn fail_craft(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        info: &RunInfo,
    ) -> Result<CasResult<WorkflowRun>> {
        self.timed("store.fail_craft", self.inner.fail_craft(run_id, run_attempt, info)).await
    }

    async fn cas_run_status(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> Result<CasResult<WorkflowRun>> {
        self.timed(
            "store.cas_run_status",
            self.inner.cas_run_status(run_id, run_attempt, from, to),
        )
        .await
    }

    async fn start_run_attempt(
        &self,
        run_id: Uuid,
        expected_attempt: i32,
    ) -> Result<CasResult<WorkflowRun>> {
        self.timed(
            "store.start_run_attempt",
            self.inner.start_run_attempt(run_id, expected_attempt),
        )
        .await
    }

    async fn set_run_read_only(&self, run_id: Uuid) -> Result<bool> {
        self.timed("store.set_run_read_only", self.inner.set_run_read_only(run_id)).await
    }

    async fn insert_run_info(&self, info: &RunInfo) -> Result<()> {
        self.timed("store.insert_run_info", self.inner.insert_run_info(info)).await
    }

    async fn load_run_infos(&self, run_id: Uuid) -> Result<Vec<RunInfo>> {
        self.timed("store.load_run_infos", self.inner.load_run_infos(run_id)).await
    }

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<Option<RunJob>> {
        self.timed("store.load_run_job", self.inner.load_run_job(run_job_id)).await
    }

    async fn load_run_jobs(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>> {
        self.timed("store.load_run_jobs", self.inner.load_run_jobs(run_id, run_attempt)).await
    }

    async fn load_run_jobs_by_status(
        &self,
        status: RunJobStatus,
        region: Option<&str>,
    ) -> Result<Vec<RunJob>> {
        self.timed(
            "store.load_run_jobs_by_status",
            self.inner.load_run_jobs_by_status(status, region),
        )
        .await
    }

    async fn transition_run_job(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
    ) -> Result<CasResult<RunJob>> {
        self.timed(
            "store.transition_run_job",
            self.inner.transition_run_job(run_job_id, transition),
        )
        .await
    }

    async fn insert_run_job_info(&self, info: &RunJobInfo) -> Result<()> {
        self.timed("store.insert_run_job_info", self.inner.insert_run_job_info(info)).await
    }

    async fn load_run_job_infos(&self, run_job_id: Uuid) -> Result<Vec<RunJobInfo>> {
        self.timed("store.load_run_job_infos", self.inner.load_run_job_infos(run_job_id)).await
    }

    async fn upsert_run_result(&self, result: &RunResult) -> Result<UpsertResult> {
        self.timed("store.upsert_run_result", self.inner.upsert_run_result(result)).await
    }

    async fn load_run_results(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunResult>> {
        self.timed("store.load_run_results", self.inner.load_run_results(run_id, run_attempt)).await
    }

    async fn insert_hatchery(&self, hatchery: &Hatchery) -> Result<()> {
        self.timed("store.insert_hatchery", self.inner.insert_hatchery(hatchery)).await
    }

    async fn load_hatchery(&self, name: &str) -> Result<Option<Hatchery>> {
        self.timed("store.load_hatchery", self.inner.load_hatchery(name)).await
    }

    async fn load_hatcheries(&self) -> Result<Vec<Hatchery>> {
        self.timed("store.load_hatcheries", self.inner.load_hatcheries()).await
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        status: &HatcheryStatus,
    ) -> Result<bool> {
        self.timed("store.record_heartbeat", self.inner.record_heartbeat(name, at, status)).await
    }

    async fn insert_region(&self, region: &Region) -> Result<()> {
        self.timed("store.insert_region", self.inner.insert_region(region)).await
    }

    async fn load_region(&self, name: &str) -> Result<Option<Region>> {
        self.timed("store.load_region", self.inner.load_region(name)).await
    }

    async fn insert_region_grant(&self, grant: &RegionGrant) -> Result<()> {
        self.timed("store.insert_region_grant", self.inner.insert_region_grant(grant)).await
    }

    async fn delete_region_grant(&self, grant: &RegionGrant) -> Result<bool> {
        self.timed("store.delete_region_grant", self.inner.delete_region_grant(grant)).await
    }

    async fn load_region_grants(&self, region: &str) -> Result<Vec<RegionGrant>> {
        self.timed("store.load_region_grants", self.inner.load_region_grants(region)).await
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.timed("store.insert_entity", self.inner.insert_entity(entity)).await
    }

    async fn find_entity(&self, lookup: &EntityLookup) -> Result<Option<Entity>> {
        self.timed("store.find_entity", self.inner.find_entity(lookup)).await
    }

    async fn find_project_entity(
        &self,
        project_key: &str,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>> {
        self.timed(
            "store.find_project_entity",
            self.inner.find_project_entity(project_key, entity_type, name),
        )
        .await
    }

    async fn insert_variable_set(&self, variable_set: &VariableSet) -> Result<()> {
        self.timed("store.insert_variable_set", self.inner.insert_variable_set(variable_set)).await
    }

    async fn load_variable_set(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<Option<VariableSet>> {
        self.timed("store.load_variable_set", self.inner.load_variable_set(project_key, name)).await
    }

    async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        self.timed("store.insert_worker", self.inner.insert_worker(worker)).await
    }

    async fn load_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        self.timed("store.load_worker", self.inner.load_worker(worker_id)).await
    }

    async fn load_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        self.timed("store.load_worker_by_name", self.inner.load_worker_by_name(name)).await
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        self.timed("store.update_worker", self.inner.update_worker(worker)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_calls_pass_through() {
        let store = TimeoutStore::new(Arc::new(InMemoryStore::new()), Duration::from_secs(1));
        store.insert_region(&Region::new("build")).await.unwrap();
        let region = store.load_region("build").await.unwrap();
        assert_eq!(region.map(|r| r.name), Some("build".to_string()));
        assert!(store.load_run(Uuid::new_v4()).await.unwrap().is_none());
    }
}
