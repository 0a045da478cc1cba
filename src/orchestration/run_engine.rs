//! # Run Engine
//!
//! Aggregate status of a run attempt and the operations acting on a whole
//! run: cancellation, new attempts and the read-only flag.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use super::job_queue::{expect_transition, JobQueue};
use crate::error::{EngineError, Result};
use crate::events::QueueEvent;
use crate::logging::log_run_operation;
use crate::models::{RunInfo, RunInfoLevel, RunJob, RunJobInfo, WorkflowRun};
use crate::state_machine::{
    RunJobEvent, RunJobStatus, RunStateMachine, RunStatusEvent, WorkflowRunStatus,
};
use crate::store::{CasResult, RunJobTransition, Store};

/// Status of a run attempt from the status of its jobs
pub fn compute_run_status(jobs: &[RunJob]) -> WorkflowRunStatus {
    if jobs.iter().any(|job| !job.status.is_terminal()) {
        return WorkflowRunStatus::Building;
    }
    if jobs
        .iter()
        .any(|job| job.status == RunJobStatus::Fail && !job.job.continue_on_error)
    {
        return WorkflowRunStatus::Fail;
    }
    if jobs.iter().any(|job| job.status == RunJobStatus::Stopped) {
        return WorkflowRunStatus::Cancelled;
    }
    WorkflowRunStatus::Success
}

pub struct RunEngine {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
}

impl RunEngine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow run", run_id))
    }

    /// Settle a `Building` run once every job ended.
    ///
    /// Returns the run when this call moved it to its final status.
    #[instrument(skip(self))]
    pub async fn sync_run_status(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let run = self.load_run(run_id).await?;
        if run.status != WorkflowRunStatus::Building {
            return Ok(None);
        }

        let jobs = self.store.load_run_jobs(run.id, run.run_attempt).await?;
        let status = compute_run_status(&jobs);
        if !status.is_terminal() {
            return Ok(None);
        }

        let event = RunStatusEvent::Settle(status);
        let updated = self
            .store
            .cas_run_status(
                run.id,
                run.run_attempt,
                &RunStateMachine::source_states(&event),
                RunStateMachine::determine_target_state(run.status, &event)?,
            )
            .await?;
        match updated {
            CasResult::Success(run) => {
                self.run_ended(&run, None);
                Ok(Some(run))
            }
            CasResult::StateMismatch { .. } | CasResult::NotFound => Ok(None),
        }
    }

    /// Stop every unfinished job of the current attempt and cancel the run
    #[instrument(skip(self))]
    pub async fn stop_run(&self, run_id: Uuid, reason: &str) -> Result<WorkflowRun> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        let transition = RunJobTransition::for_event(&RunJobEvent::Stop)?;
        for job in self.store.load_run_jobs(run.id, run.run_attempt).await? {
            if job.status.is_terminal() {
                continue;
            }
            if let CasResult::Success(stopped) = self.queue.transition(job.id, &transition, None).await? {
                self.store
                    .insert_run_job_info(&RunJobInfo::new(&stopped, RunInfoLevel::Warning, reason))
                    .await?;
            }
        }

        let cancelled = self
            .store
            .cas_run_status(
                run.id,
                run.run_attempt,
                &RunStateMachine::source_states(&RunStatusEvent::Cancel),
                WorkflowRunStatus::Cancelled,
            )
            .await?;
        match cancelled {
            CasResult::Success(run) => {
                self.store
                    .insert_run_info(&RunInfo::new(&run, RunInfoLevel::Warning, reason))
                    .await?;
                self.run_ended(&run, Some(reason));
                Ok(run)
            }
            CasResult::StateMismatch { actual } => Err(EngineError::Conflict(format!(
                "run {run_id} is already {}",
                actual.status
            ))),
            CasResult::NotFound => Err(EngineError::not_found("workflow run", run_id)),
        }
    }

    /// Stop one job; its dependents are skipped and the run settles when
    /// nothing else is running
    #[instrument(skip(self))]
    pub async fn stop_job(&self, run_job_id: Uuid, reason: &str) -> Result<RunJob> {
        let transition = RunJobTransition::for_event(&RunJobEvent::Stop)?;
        let outcome = self.queue.transition(run_job_id, &transition, None).await?;
        let stopped = expect_transition(outcome, run_job_id, "stop")?;
        self.store
            .insert_run_job_info(&RunJobInfo::new(&stopped, RunInfoLevel::Warning, reason))
            .await?;

        self.queue
            .release_dependents(stopped.workflow_run_id, stopped.run_attempt)
            .await?;
        self.sync_run_status(stopped.workflow_run_id).await?;
        Ok(stopped)
    }

    /// Start a new attempt of an ended run; it goes through crafting again
    #[instrument(skip(self))]
    pub async fn restart_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let run = self.load_run(run_id).await?;
        if run.read_only {
            return Err(EngineError::Forbidden(format!("run {run_id} is read-only")));
        }
        RunStateMachine::determine_target_state(run.status, &RunStatusEvent::Restart)?;

        match self.store.start_run_attempt(run.id, run.run_attempt).await? {
            CasResult::Success(run) => {
                log_run_operation(
                    "restart",
                    run.id,
                    Some(&run.workflow_name),
                    run.status.as_str(),
                    Some(&format!("attempt {}", run.run_attempt)),
                );
                Ok(run)
            }
            CasResult::StateMismatch { actual } => Err(EngineError::Conflict(format!(
                "run {run_id} changed concurrently: attempt {} is {}",
                actual.run_attempt, actual.status
            ))),
            CasResult::NotFound => Err(EngineError::not_found("workflow run", run_id)),
        }
    }

    /// Flag a run whose secret snapshot was purged; it can no longer restart
    pub async fn mark_read_only(&self, run_id: Uuid) -> Result<()> {
        if !self.store.set_run_read_only(run_id).await? {
            return Err(EngineError::not_found("workflow run", run_id));
        }
        info!(run_id = %run_id, "Run marked read-only");
        Ok(())
    }

    fn run_ended(&self, run: &WorkflowRun, details: Option<&str>) {
        log_run_operation(
            "end",
            run.id,
            Some(&run.workflow_name),
            run.status.as_str(),
            details,
        );
        self.queue.events().publish(QueueEvent::RunEnded {
            workflow_run_id: run.id,
            status: run.status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::models::{JobDefinition, NewWorkflowRun, RunEvent, WorkflowDefinition};
    use crate::store::InMemoryStore;
    use proptest::prelude::*;

    fn run() -> WorkflowRun {
        WorkflowRun::new(NewWorkflowRun {
            project_key: "PROJ".to_string(),
            vcs_server: "github".to_string(),
            repository: "ovh/app".to_string(),
            workflow_ref: "refs/heads/main".to_string(),
            workflow_sha: "sha".to_string(),
            run_number: 1,
            workflow: WorkflowDefinition::default(),
            event: RunEvent::default(),
        })
    }

    fn job_with(run: &WorkflowRun, id: &str, need: Option<&str>, status: RunJobStatus) -> RunJob {
        let definition = JobDefinition {
            needs: need.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };
        let mut job = RunJob::from_job(run, id, &definition, "build", "");
        job.status = status;
        job
    }

    async fn setup(
        jobs: &[(&str, Option<&str>, RunJobStatus)],
    ) -> (Arc<InMemoryStore>, RunEngine, WorkflowRun) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), EventPublisher::default()));
        let engine = RunEngine::new(store.clone(), queue);
        let run = run();
        store.insert_run(&run).await.unwrap();
        let run_jobs: Vec<RunJob> = jobs
            .iter()
            .map(|(id, need, status)| job_with(&run, id, *need, *status))
            .collect();
        let CasResult::Success(run) = store.complete_craft(&run, &run_jobs).await.unwrap() else {
            panic!("run should be crafting");
        };
        (store, engine, run)
    }

    #[test]
    fn test_compute_run_status() {
        let run = run();
        let success = job_with(&run, "a", None, RunJobStatus::Success);
        let mut failed = job_with(&run, "b", None, RunJobStatus::Fail);
        let stopped = job_with(&run, "c", None, RunJobStatus::Stopped);
        let building = job_with(&run, "d", None, RunJobStatus::Building);

        assert_eq!(compute_run_status(&[success.clone()]), WorkflowRunStatus::Success);
        assert_eq!(
            compute_run_status(&[success.clone(), building]),
            WorkflowRunStatus::Building
        );
        assert_eq!(
            compute_run_status(&[failed.clone(), stopped.clone()]),
            WorkflowRunStatus::Fail
        );
        assert_eq!(
            compute_run_status(&[success.clone(), stopped]),
            WorkflowRunStatus::Cancelled
        );

        failed.job.continue_on_error = true;
        assert_eq!(compute_run_status(&[success, failed]), WorkflowRunStatus::Success);
    }

    proptest! {
        #[test]
        fn prop_run_is_building_while_any_job_is_active(
            statuses in proptest::collection::vec(0usize..RunJobStatus::ALL.len(), 1..12)
        ) {
            let run = run();
            let jobs: Vec<RunJob> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| job_with(&run, &format!("job-{i}"), None, RunJobStatus::ALL[*s]))
                .collect();
            let status = compute_run_status(&jobs);
            let any_active = jobs.iter().any(|j| !j.status.is_terminal());
            prop_assert_eq!(status == WorkflowRunStatus::Building, any_active);
            if !any_active {
                let any_fail = jobs.iter().any(|j| j.status == RunJobStatus::Fail);
                prop_assert_eq!(status == WorkflowRunStatus::Fail, any_fail);
            }
        }
    }

    #[tokio::test]
    async fn test_sync_settles_only_when_every_job_ended() {
        let (store, engine, run) = setup(&[
            ("build", None, RunJobStatus::Success),
            ("test", None, RunJobStatus::Building),
        ])
        .await;
        assert_eq!(engine.sync_run_status(run.id).await.unwrap(), None);

        let test = store
            .load_run_jobs(run.id, run.run_attempt)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.job_id == "test")
            .unwrap();
        let succeed = RunJobTransition::for_event(&RunJobEvent::Succeed).unwrap();
        store.transition_run_job(test.id, &succeed).await.unwrap();

        let settled = engine.sync_run_status(run.id).await.unwrap().unwrap();
        assert_eq!(settled.status, WorkflowRunStatus::Success);
        assert_eq!(engine.sync_run_status(run.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_run_stops_unfinished_jobs() {
        let (store, engine, run) = setup(&[
            ("build", None, RunJobStatus::Success),
            ("test", None, RunJobStatus::Building),
            ("deploy", Some("test"), RunJobStatus::Blocked),
        ])
        .await;

        let cancelled = engine.stop_run(run.id, "stopped by admin").await.unwrap();
        assert_eq!(cancelled.status, WorkflowRunStatus::Cancelled);

        let jobs = store.load_run_jobs(run.id, run.run_attempt).await.unwrap();
        let status_of = |id: &str| jobs.iter().find(|j| j.job_id == id).unwrap().status;
        assert_eq!(status_of("build"), RunJobStatus::Success);
        assert_eq!(status_of("test"), RunJobStatus::Stopped);
        assert_eq!(status_of("deploy"), RunJobStatus::Stopped);

        assert!(matches!(
            engine.stop_run(run.id, "again").await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_job_skips_dependents_and_settles() {
        let (store, engine, run) = setup(&[
            ("test", None, RunJobStatus::Building),
            ("deploy", Some("test"), RunJobStatus::Blocked),
        ])
        .await;
        let test = store.load_run_jobs(run.id, run.run_attempt).await.unwrap()[1].clone();
        assert_eq!(test.job_id, "test");

        engine.stop_job(test.id, "flaky").await.unwrap();

        let jobs = store.load_run_jobs(run.id, run.run_attempt).await.unwrap();
        assert_eq!(jobs[0].job_id, "deploy");
        assert_eq!(jobs[0].status, RunJobStatus::Skipped);
        let settled = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(settled.status, WorkflowRunStatus::Cancelled);

        assert!(matches!(
            engine.stop_job(test.id, "again").await,
            Err(EngineError::JobStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_requires_ended_writable_run() {
        let (store, engine, run) = setup(&[("build", None, RunJobStatus::Building)]).await;
        assert!(engine.restart_run(run.id).await.is_err());

        engine.stop_run(run.id, "cancel").await.unwrap();
        let restarted = engine.restart_run(run.id).await.unwrap();
        assert_eq!(restarted.status, WorkflowRunStatus::Crafting);
        assert_eq!(restarted.run_attempt, 2);

        store
            .cas_run_status(
                run.id,
                2,
                &[WorkflowRunStatus::Crafting],
                WorkflowRunStatus::Fail,
            )
            .await
            .unwrap();
        engine.mark_read_only(run.id).await.unwrap();
        assert!(matches!(
            engine.restart_run(run.id).await,
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            engine.mark_read_only(Uuid::new_v4()).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
