//! # Job Queue
//!
//! Authoritative view of claimable run jobs. All state changes are store
//! compare-and-swap transitions: under contention exactly one caller wins and
//! the others observe [`EngineError::Conflict`].
//!
//! Dependency gating also lives here: once a job ends, `Blocked` dependents
//! become `Waiting` when their needs are satisfied, or `Skipped` when one of
//! them can no longer be.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{EventPublisher, QueueEvent};
use crate::logging::{log_job_transition, log_queue_event};
use crate::models::RunJob;
use crate::state_machine::{RunJobEvent, RunJobStatus};
use crate::store::{CasResult, Holder, RunJobTransition, Store};

pub struct JobQueue {
    store: Arc<dyn Store>,
    events: EventPublisher,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// `Waiting` jobs of a region a hatchery of `model_type` can run,
    /// oldest first
    pub async fn list_queued(&self, region: &str, model_type: &str) -> Result<Vec<RunJob>> {
        let mut jobs: Vec<RunJob> = self
            .store
            .load_run_jobs_by_status(RunJobStatus::Waiting, Some(region))
            .await?
            .into_iter()
            .filter(|job| job.accepts_model_type(model_type))
            .collect();
        jobs.sort_by(|a, b| a.queued.cmp(&b.queued).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Apply a transition, logging and publishing what changed
    pub async fn transition(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
        actor: Option<&str>,
    ) -> Result<CasResult<RunJob>> {
        let outcome = self.store.transition_run_job(run_job_id, transition).await?;
        if let CasResult::Success(job) = &outcome {
            let from = transition
                .from
                .iter()
                .map(RunJobStatus::as_str)
                .collect::<Vec<_>>()
                .join("|");
            log_job_transition(job.id, &job.job_id, &from, job.status.as_str(), actor);
            self.publish_for(job, transition, actor);
        }
        Ok(outcome)
    }

    /// `Waiting → Scheduling` for one hatchery
    #[instrument(skip(self), fields(run_job_id = %run_job_id, hatchery = %hatchery_name))]
    pub async fn claim(&self, run_job_id: Uuid, hatchery_name: &str) -> Result<RunJob> {
        let transition = RunJobTransition::for_event(&RunJobEvent::Claim(hatchery_name.to_string()))?;
        let outcome = self.transition(run_job_id, &transition, Some(hatchery_name)).await?;
        if let CasResult::StateMismatch { actual } = &outcome {
            // Queue contention, not an error: the caller re-polls.
            debug!(
                status = %actual.status,
                holder = ?actual.hatchery_name,
                "Job already taken"
            );
        }
        expect_transition(outcome, run_job_id, "take")
    }

    /// Jobs left in `Scheduling` without a registered worker for longer than
    /// `timeout` go back to `Waiting`
    pub async fn reclaim_orphans(&self, timeout: Duration) -> Result<Vec<RunJob>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| EngineError::Configuration(format!("invalid orphan timeout: {e}")))?;
        let cutoff = Utc::now() - timeout;

        let mut reclaimed = Vec::new();
        for job in self
            .store
            .load_run_jobs_by_status(RunJobStatus::Scheduling, None)
            .await?
        {
            let orphaned = job.worker_name.is_none()
                && job.scheduled.map_or(false, |scheduled| scheduled <= cutoff);
            let Some(hatchery_name) = job.hatchery_name.as_deref().filter(|_| orphaned) else {
                continue;
            };

            let transition = RunJobTransition::for_event(&RunJobEvent::Release)?
                .expect_hatchery(hatchery_name)
                .expect_worker(Holder::Unassigned);
            if let CasResult::Success(job) = self.transition(job.id, &transition, None).await? {
                info!(
                    run_job_id = %job.id,
                    hatchery = %hatchery_name,
                    "Reclaimed orphaned job"
                );
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    /// Gate the `Blocked` jobs of a run attempt until nothing changes.
    ///
    /// Returns every job that was unblocked or skipped.
    #[instrument(skip(self))]
    pub async fn release_dependents(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>> {
        let mut changed = Vec::new();
        loop {
            let jobs = self.store.load_run_jobs(run_id, run_attempt).await?;
            let decisions: Vec<(Uuid, RunJobEvent)> = jobs
                .iter()
                .filter_map(|job| gate_decision(job, &jobs).map(|event| (job.id, event)))
                .collect();
            if decisions.is_empty() {
                break;
            }

            let mut progressed = false;
            for (run_job_id, event) in decisions {
                let transition = RunJobTransition::for_event(&event)?;
                if let CasResult::Success(job) = self.transition(run_job_id, &transition, None).await? {
                    progressed = true;
                    changed.push(job);
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(changed)
    }

    fn publish_for(&self, job: &RunJob, transition: &RunJobTransition, actor: Option<&str>) {
        let event = match job.status {
            RunJobStatus::Waiting if transition.from.contains(&RunJobStatus::Scheduling) => {
                let hatchery = match &transition.expected_hatchery {
                    Holder::Is(name) => name.clone(),
                    _ => actor.unwrap_or_default().to_string(),
                };
                QueueEvent::JobReleased {
                    run_job_id: job.id,
                    hatchery,
                    spawn_attempts: job.spawn_attempts,
                }
            }
            RunJobStatus::Waiting => QueueEvent::JobQueued {
                run_job_id: job.id,
                workflow_run_id: job.workflow_run_id,
                job_id: job.job_id.clone(),
                region: job.region.clone(),
            },
            RunJobStatus::Scheduling if transition.from.contains(&RunJobStatus::Waiting) => {
                let hatchery = job.hatchery_name.clone().unwrap_or_default();
                log_queue_event("taken", &hatchery, Some(job.id), None);
                QueueEvent::JobTaken {
                    run_job_id: job.id,
                    hatchery,
                }
            }
            RunJobStatus::Building => QueueEvent::JobStarted {
                run_job_id: job.id,
                worker: job.worker_name.clone().unwrap_or_default(),
            },
            status if status.is_terminal() => QueueEvent::JobEnded {
                run_job_id: job.id,
                workflow_run_id: job.workflow_run_id,
                status,
            },
            _ => return,
        };
        self.events.publish(event);
    }
}

/// Gating event for a `Blocked` job given the jobs of its run attempt
pub fn gate_decision(job: &RunJob, run_jobs: &[RunJob]) -> Option<RunJobEvent> {
    if job.status != RunJobStatus::Blocked {
        return None;
    }

    let by_id: HashMap<&str, &RunJob> = run_jobs.iter().map(|j| (j.job_id.as_str(), j)).collect();
    let mut all_satisfied = true;
    for need in &job.job.needs {
        let Some(dependency) = by_id.get(need.as_str()) else {
            all_satisfied = false;
            continue;
        };
        let satisfied = match dependency.status {
            RunJobStatus::Success => true,
            RunJobStatus::Fail => dependency.job.continue_on_error,
            RunJobStatus::Skipped => job.job.continue_on_skip,
            _ => false,
        };
        if satisfied {
            continue;
        }
        if dependency.status.is_terminal() {
            return Some(RunJobEvent::SkipForDependency);
        }
        all_satisfied = false;
    }

    all_satisfied.then_some(RunJobEvent::Unblock)
}

/// Map a transition outcome to the job, or the error its caller reports
pub(crate) fn expect_transition(
    outcome: CasResult<RunJob>,
    run_job_id: Uuid,
    action: &str,
) -> Result<RunJob> {
    match outcome {
        CasResult::Success(job) => Ok(job),
        CasResult::NotFound => Err(EngineError::not_found("run job", run_job_id)),
        CasResult::StateMismatch { actual } if actual.status == RunJobStatus::Stopped => {
            Err(EngineError::JobStopped(run_job_id))
        }
        CasResult::StateMismatch { actual } => Err(EngineError::Conflict(format!(
            "unable to {action} job {run_job_id}: job is {}",
            actual.status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobDefinition, NewWorkflowRun, RunEvent, WorkflowDefinition, WorkflowRun};
    use crate::store::InMemoryStore;

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

    fn job(run: &WorkflowRun, id: &str, needs: &[&str], status: RunJobStatus) -> RunJob {
        let definition = JobDefinition {
            needs: needs.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };
        let mut job = RunJob::from_job(run, id, &definition, "build", "docker");
        job.status = status;
        job
    }

    #[test]
    fn test_gate_decision() {
        let run = run();
        let mut build = job(&run, "build", &[], RunJobStatus::Building);
        let test = job(&run, "test", &["build"], RunJobStatus::Blocked);

        assert_eq!(gate_decision(&test, &[build.clone(), test.clone()]), None);

        build.status = RunJobStatus::Success;
        assert_eq!(
            gate_decision(&test, &[build.clone(), test.clone()]),
            Some(RunJobEvent::Unblock)
        );

        build.status = RunJobStatus::Fail;
        assert_eq!(
            gate_decision(&test, &[build.clone(), test.clone()]),
            Some(RunJobEvent::SkipForDependency)
        );

        build.job.continue_on_error = true;
        assert_eq!(
            gate_decision(&test, &[build.clone(), test.clone()]),
            Some(RunJobEvent::Unblock)
        );
    }

    #[test]
    fn test_continue_on_skip() {
        let run = run();
        let lint = job(&run, "lint", &[], RunJobStatus::Skipped);
        let mut report = job(&run, "report", &["lint"], RunJobStatus::Blocked);
        assert_eq!(
            gate_decision(&report, &[lint.clone(), report.clone()]),
            Some(RunJobEvent::SkipForDependency)
        );

        report.job.continue_on_skip = true;
        assert_eq!(
            gate_decision(&report, &[lint, report.clone()]),
            Some(RunJobEvent::Unblock)
        );
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_transitively() {
        let store = Arc::new(InMemoryStore::new());
        let queue = JobQueue::new(store.clone(), EventPublisher::default());
        let run = run();
        store.insert_run(&run).await.unwrap();

        let build = job(&run, "build", &[], RunJobStatus::Fail);
        let test = job(&run, "test", &["build"], RunJobStatus::Blocked);
        let deploy = job(&run, "deploy", &["test"], RunJobStatus::Blocked);
        let docs = job(&run, "docs", &[], RunJobStatus::Waiting);
        let jobs = vec![build, test, deploy, docs];
        store.complete_craft(&run, &jobs).await.unwrap();

        let changed = queue.release_dependents(run.id, run.run_attempt).await.unwrap();
        assert_eq!(changed.len(), 2);

        let statuses: HashMap<String, RunJobStatus> = store
            .load_run_jobs(run.id, run.run_attempt)
            .await
            .unwrap()
            .into_iter()
            .map(|j| (j.job_id, j.status))
            .collect();
        assert_eq!(statuses["test"], RunJobStatus::Skipped);
        assert_eq!(statuses["deploy"], RunJobStatus::Skipped);
        assert_eq!(statuses["docs"], RunJobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_publishes() {
        let store = Arc::new(InMemoryStore::new());
        let queue = JobQueue::new(store.clone(), EventPublisher::new(8));
        let mut events = queue.events().subscribe();
        let run = run();
        store.insert_run(&run).await.unwrap();
        let waiting = job(&run, "build", &[], RunJobStatus::Waiting);
        store.complete_craft(&run, &[waiting.clone()]).await.unwrap();

        let taken = queue.claim(waiting.id, "hatch-1").await.unwrap();
        assert_eq!(taken.status, RunJobStatus::Scheduling);
        assert_eq!(taken.hatchery_name.as_deref(), Some("hatch-1"));

        let lost = queue.claim(waiting.id, "hatch-2").await;
        assert!(matches!(lost, Err(EngineError::Conflict(_))));

        let published = events.recv().await.unwrap();
        assert_eq!(
            published.event,
            QueueEvent::JobTaken {
                run_job_id: waiting.id,
                hatchery: "hatch-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_list_queued_filters_model_type_and_orders_fifo() {
        let store = Arc::new(InMemoryStore::new());
        let queue = JobQueue::new(store.clone(), EventPublisher::default());
        let run = run();
        store.insert_run(&run).await.unwrap();

        let mut first = job(&run, "first", &[], RunJobStatus::Waiting);
        let mut second = job(&run, "second", &[], RunJobStatus::Waiting);
        let mut vm = job(&run, "vm", &[], RunJobStatus::Waiting);
        first.queued = Utc::now() - chrono::Duration::seconds(10);
        second.queued = Utc::now();
        vm.model_type = "openstack".to_string();
        store
            .complete_craft(&run, &[second.clone(), vm, first.clone()])
            .await
            .unwrap();

        let queued = queue.list_queued("build", "docker").await.unwrap();
        let ids: Vec<&str> = queued.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert!(queue.list_queued("other", "docker").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_orphans_only_touches_unregistered_stale_claims() {
        let store = Arc::new(InMemoryStore::new());
        let queue = JobQueue::new(store.clone(), EventPublisher::default());
        let run = run();
        store.insert_run(&run).await.unwrap();
        let stale = job(&run, "stale", &[], RunJobStatus::Waiting);
        let fresh = job(&run, "fresh", &[], RunJobStatus::Waiting);
        store
            .complete_craft(&run, &[stale.clone(), fresh.clone()])
            .await
            .unwrap();
        queue.claim(stale.id, "hatch-1").await.unwrap();

        assert!(queue
            .reclaim_orphans(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        let reclaimed = queue.reclaim_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale.id);
        assert_eq!(reclaimed[0].status, RunJobStatus::Waiting);
        assert_eq!(reclaimed[0].hatchery_name, None);
    }
}
