//! # Store
//!
//! Persistence capability consumed by the scheduling engine.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: every run and run job status change is a conditional
//!   update on the current status (and holder), so concurrent hatcheries and
//!   workers agree on exactly one winner without any engine-side lock
//! - **Atomic crafting**: the `Crafting` check, workflow data, run jobs and
//!   failure message of a crafting pass are written together
//! - **Testability**: [`memory::InMemoryStore`] for tests and embedding,
//!   [`postgres::PgStore`] for production

pub mod memory;
pub mod postgres;
pub mod timeout;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Entity, EntityLookup, EntityType, Hatchery, HatcheryStatus, Region, RegionGrant, RunInfo, RunJob,
    RunJobInfo, RunResult, VariableSet, Worker, WorkflowRun,
};
use crate::state_machine::{
    RunJobEvent, RunJobStateMachine, RunJobStatus, StateMachineResult, WorkflowRunStatus,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use timeout::TimeoutStore;

/// Result of a compare-and-swap operation
#[derive(Debug, Clone, PartialEq)]
pub enum CasResult<T> {
    /// The update was applied; carries the updated row
    Success(T),
    NotFound,
    /// The row did not match the expectation; carries the current row
    StateMismatch { actual: T },
}

impl<T> CasResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Expected holder of a run job column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    Any,
    Is(String),
    Unassigned,
}

impl Holder {
    pub fn matches(&self, current: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Is(name) => current == Some(name.as_str()),
            Self::Unassigned => current.is_none(),
        }
    }
}

/// Change applied to a run job holder column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Keep,
    Set(String),
    Clear,
}

/// Conditional update of one run job
#[derive(Debug, Clone, PartialEq)]
pub struct RunJobTransition {
    pub from: Vec<RunJobStatus>,
    pub to: RunJobStatus,
    pub expected_hatchery: Holder,
    pub expected_worker: Holder,
    pub hatchery: Assignment,
    pub worker: Assignment,
    pub increment_spawn_attempts: bool,
}

impl RunJobTransition {
    /// Transition for a state machine event, holders derived from the event
    pub fn for_event(event: &RunJobEvent) -> StateMachineResult<Self> {
        let to = RunJobStateMachine::target_state(event)?;
        let (hatchery, worker) = match event {
            RunJobEvent::Claim(hatchery_name) => {
                (Assignment::Set(hatchery_name.clone()), Assignment::Keep)
            }
            RunJobEvent::Release => (Assignment::Clear, Assignment::Clear),
            RunJobEvent::Start(worker_name) => (Assignment::Keep, Assignment::Set(worker_name.clone())),
            _ => (Assignment::Keep, Assignment::Keep),
        };
        Ok(Self {
            from: RunJobStateMachine::source_states(event),
            to,
            expected_hatchery: Holder::Any,
            expected_worker: Holder::Any,
            hatchery,
            worker,
            increment_spawn_attempts: false,
        })
    }

    /// Bind a worker to a job its hatchery holds, without a status change
    pub fn bind_worker(hatchery_name: &str, worker_name: &str) -> Self {
        Self {
            from: vec![RunJobStatus::Scheduling],
            to: RunJobStatus::Scheduling,
            expected_hatchery: Holder::Is(hatchery_name.to_string()),
            expected_worker: Holder::Unassigned,
            hatchery: Assignment::Keep,
            worker: Assignment::Set(worker_name.to_string()),
            increment_spawn_attempts: false,
        }
    }

    pub fn expect_hatchery(mut self, hatchery_name: &str) -> Self {
        self.expected_hatchery = Holder::Is(hatchery_name.to_string());
        self
    }

    pub fn expect_worker(mut self, worker: Holder) -> Self {
        self.expected_worker = worker;
        self
    }

    pub fn counting_spawn_attempt(mut self) -> Self {
        self.increment_spawn_attempts = true;
        self
    }

    /// Check the expectation against the current row
    pub fn matches(&self, run_job: &RunJob) -> bool {
        self.from.contains(&run_job.status)
            && self.expected_hatchery.matches(run_job.hatchery_name.as_deref())
            && self.expected_worker.matches(run_job.worker_name.as_deref())
    }

    /// Apply the change to a row that matched
    pub fn apply(&self, run_job: &mut RunJob, now: DateTime<Utc>) {
        let previous = run_job.status;
        run_job.status = self.to;
        match &self.hatchery {
            Assignment::Keep => {}
            Assignment::Set(name) => run_job.hatchery_name = Some(name.clone()),
            Assignment::Clear => run_job.hatchery_name = None,
        }
        match &self.worker {
            Assignment::Keep => {}
            Assignment::Set(name) => run_job.worker_name = Some(name.clone()),
            Assignment::Clear => run_job.worker_name = None,
        }
        if self.increment_spawn_attempts {
            run_job.spawn_attempts += 1;
        }
        if previous != self.to {
            match self.to {
                RunJobStatus::Scheduling => run_job.scheduled = Some(now),
                RunJobStatus::Waiting => run_job.scheduled = None,
                RunJobStatus::Building => run_job.started = Some(now),
                status if status.is_terminal() => run_job.ended = Some(now),
                _ => {}
            }
        }
    }
}

/// Outcome of a run result upsert keyed by `(run_job_id, kind, name)`
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertResult {
    Inserted,
    Updated,
    /// The stored result is `Completed` and was left untouched
    Rejected { existing: RunResult },
}

/// Storage abstraction for the scheduling engine.
///
/// All methods are `Send + Sync` to support concurrent access from many
/// hatchery and worker requests.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Workflow runs ---

    async fn insert_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;

    async fn load_runs_by_status(&self, status: WorkflowRunStatus) -> Result<Vec<WorkflowRun>>;

    /// Crafting succeeded: `Crafting → Building` for the run's attempt,
    /// storing its workflow data and inserting its run jobs atomically
    async fn complete_craft(
        &self,
        run: &WorkflowRun,
        run_jobs: &[RunJob],
    ) -> Result<CasResult<WorkflowRun>>;

    /// Crafting failed: `Crafting → Fail` and the single explanatory info
    async fn fail_craft(&self, run_id: Uuid, run_attempt: i32, info: &RunInfo)
        -> Result<CasResult<WorkflowRun>>;

    async fn cas_run_status(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> Result<CasResult<WorkflowRun>>;

    /// Terminal run → `Crafting` with the attempt incremented
    async fn start_run_attempt(
        &self,
        run_id: Uuid,
        expected_attempt: i32,
    ) -> Result<CasResult<WorkflowRun>>;

    async fn set_run_read_only(&self, run_id: Uuid) -> Result<bool>;

    async fn insert_run_info(&self, info: &RunInfo) -> Result<()>;

    async fn load_run_infos(&self, run_id: Uuid) -> Result<Vec<RunInfo>>;

    // --- Run jobs ---

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<Option<RunJob>>;

    async fn load_run_jobs(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>>;

    /// Run jobs in a status, oldest queued first, optionally in one region
    async fn load_run_jobs_by_status(
        &self,
        status: RunJobStatus,
        region: Option<&str>,
    ) -> Result<Vec<RunJob>>;

    /// Conditional update; the single correctness-critical primitive
    async fn transition_run_job(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
    ) -> Result<CasResult<RunJob>>;

    async fn insert_run_job_info(&self, info: &RunJobInfo) -> Result<()>;

    async fn load_run_job_infos(&self, run_job_id: Uuid) -> Result<Vec<RunJobInfo>>;

    // --- Run results ---

    async fn upsert_run_result(&self, result: &RunResult) -> Result<UpsertResult>;

    async fn load_run_results(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunResult>>;

    // --- Hatcheries and RBAC ---

    async fn insert_hatchery(&self, hatchery: &Hatchery) -> Result<()>;

    async fn load_hatchery(&self, name: &str) -> Result<Option<Hatchery>>;

    async fn load_hatcheries(&self) -> Result<Vec<Hatchery>>;

    async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        status: &HatcheryStatus,
    ) -> Result<bool>;

    async fn insert_region(&self, region: &Region) -> Result<()>;

    async fn load_region(&self, name: &str) -> Result<Option<Region>>;

    async fn insert_region_grant(&self, grant: &RegionGrant) -> Result<()>;

    async fn delete_region_grant(&self, grant: &RegionGrant) -> Result<bool>;

    async fn load_region_grants(&self, region: &str) -> Result<Vec<RegionGrant>>;

    // --- Entities ---

    async fn insert_entity(&self, entity: &Entity) -> Result<()>;

    async fn find_entity(&self, lookup: &EntityLookup) -> Result<Option<Entity>>;

    /// Most recent entity of that type and name anywhere in a project
    async fn find_project_entity(
        &self,
        project_key: &str,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>>;

    // --- Variable sets ---

    async fn insert_variable_set(&self, variable_set: &VariableSet) -> Result<()>;

    async fn load_variable_set(&self, project_key: &str, name: &str)
        -> Result<Option<VariableSet>>;

    // --- Workers ---

    async fn insert_worker(&self, worker: &Worker) -> Result<()>;

    async fn load_worker(&self, worker_id: Uuid) -> Result<Option<Worker>>;

    async fn load_worker_by_name(&self, name: &str) -> Result<Option<Worker>>;

    async fn update_worker(&self, worker: &Worker) -> Result<()>;
}
