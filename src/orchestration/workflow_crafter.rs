//! # Workflow Crafter
//!
//! Turns a run in `Crafting` into a schedulable run: jobs built `from` a
//! workflow template are expanded, every job graph reference is pinned, every
//! job is authorized, then the run moves to `Building` together with its run
//! jobs in one store operation.
//!
//! A crafting failure moves the run to `Fail` with exactly one [`RunInfo`]
//! naming the job at fault. Both outcomes are conditional on the run still
//! being in `Crafting`, so a second concurrent pass is a no-op.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::dependency_resolver::{DependencyResolver, ResolutionContext, ResolutionPass};
use super::region_authorizer::RegionAuthorizer;
use crate::error::{EngineError, Result};
use crate::events::{EventPublisher, QueueEvent};
use crate::logging::{log_error, log_run_operation};
use crate::models::{EntityType, RunInfo, RunJob, WorkflowData, WorkflowDefinition, WorkflowRun};
use crate::state_machine::{RunJobStatus, WorkflowRunStatus};
use crate::store::{CasResult, Store};

/// What a crafting pass did to a run
#[derive(Debug, Clone, PartialEq)]
pub enum CraftOutcome {
    /// The run is `Building`; carries the crafted run
    Crafted(WorkflowRun),
    /// The run is `Fail`; carries the message recorded on it
    Failed(RunInfo),
    /// The run was not (or no longer) in `Crafting`
    Skipped,
}

/// Crafted workflow data and run jobs, not yet persisted
struct CraftedRun {
    run: WorkflowRun,
    run_jobs: Vec<RunJob>,
}

enum Prepared {
    Crafted(CraftedRun),
    /// The workflow cannot run; carries the failure message
    Rejected(String),
}

pub struct WorkflowCrafter {
    store: Arc<dyn Store>,
    resolver: DependencyResolver,
    authorizer: RegionAuthorizer,
    events: EventPublisher,
}

impl WorkflowCrafter {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: DependencyResolver,
        authorizer: RegionAuthorizer,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            resolver,
            authorizer,
            events,
        }
    }

    /// Run one crafting pass on a run
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn craft(&self, run_id: Uuid) -> Result<CraftOutcome> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow run", run_id))?;

        if run.status != WorkflowRunStatus::Crafting || run.read_only {
            debug!(status = %run.status, read_only = run.read_only, "Run is not craftable");
            return Ok(CraftOutcome::Skipped);
        }

        match self.prepare(&run).await? {
            Prepared::Crafted(crafted) => self.complete(crafted).await,
            Prepared::Rejected(message) => self.fail(&run, message).await,
        }
    }

    /// Craft every run still in `Crafting`, oldest first.
    ///
    /// A run whose pass errors is logged and left for the next sweep.
    pub async fn craft_pending(&self) -> Result<Vec<(Uuid, CraftOutcome)>> {
        let mut outcomes = Vec::new();
        for run in self
            .store
            .load_runs_by_status(WorkflowRunStatus::Crafting)
            .await?
        {
            match self.craft(run.id).await {
                Ok(outcome) => outcomes.push((run.id, outcome)),
                Err(e) => log_error(
                    "WorkflowCrafter",
                    "craft_pending",
                    &e.to_string(),
                    Some(&format!("run_id={}", run.id)),
                ),
            }
        }
        Ok(outcomes)
    }

    /// Expand templates, validate, resolve and authorize every job.
    ///
    /// An `Err` is an infrastructure error that leaves the run in `Crafting`.
    async fn prepare(&self, run: &WorkflowRun) -> Result<Prepared> {
        let mut data = WorkflowData::new(run.workflow_data.workflow.clone());
        let mut resolved_jobs = Vec::with_capacity(data.workflow.jobs.len());
        {
            let WorkflowData {
                workflow,
                actions,
                worker_models,
            } = &mut data;
            let mut pass = self.resolver.begin_pass(run);

            let mut contexts = HashMap::new();
            if let Some(message) = expand_templates(&mut pass, workflow, &mut contexts).await? {
                return Ok(Prepared::Rejected(message));
            }
            if let Some(message) = self.validate(&run.project_key, workflow).await? {
                return Ok(Prepared::Rejected(message));
            }

            for (job_id, job) in workflow.jobs.iter_mut() {
                let context = contexts
                    .get(job_id)
                    .cloned()
                    .unwrap_or_else(|| pass.root().clone());
                if let Err(e) = pass.resolve_steps_from(&context, &mut job.steps, actions).await {
                    return job_failure(job_id, e);
                }
                let model_type = match pass
                    .resolve_worker_model_from(&context, &job.runs_on.model)
                    .await
                {
                    Ok(Some((complete_name, model))) => {
                        let model_type = model.model_type.clone();
                        job.runs_on.model = complete_name.clone();
                        worker_models.insert(complete_name, model);
                        model_type
                    }
                    Ok(None) => String::new(),
                    Err(e) => return job_failure(job_id, e),
                };
                if let Some(region) = self.authorizer.effective_region(&job.region) {
                    job.region = region;
                }
                resolved_jobs.push((job_id.clone(), model_type));
            }

            for (job_id, model_type) in &resolved_jobs {
                let job = &workflow.jobs[job_id];
                if let Err(e) = self
                    .authorizer
                    .authorize(job_id, &job.region, model_type, &job.runs_on.model)
                    .await
                {
                    return job_failure(job_id, e);
                }
            }
        }

        let mut crafted = run.clone();
        crafted.workflow_data = data;
        let run_jobs = resolved_jobs
            .iter()
            .map(|(job_id, model_type)| {
                let job = &crafted.workflow_data.workflow.jobs[job_id];
                RunJob::from_job(&crafted, job_id, job, &job.region, model_type)
            })
            .collect();

        Ok(Prepared::Crafted(CraftedRun {
            run: crafted,
            run_jobs,
        }))
    }

    /// Graph and variable set checks; `Some` is the rejection message
    async fn validate(
        &self,
        project_key: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<Option<String>> {
        if workflow.jobs.is_empty() {
            let error = EngineError::InvalidWorkflow(format!("workflow {} has no job", workflow.name));
            return Ok(Some(error.to_string()));
        }

        for (job_id, job) in &workflow.jobs {
            if let Some(unknown) = job.needs.iter().find(|need| !workflow.jobs.contains_key(*need)) {
                return rejection(
                    job_id,
                    EngineError::InvalidWorkflow(format!("needs unknown job {unknown}")),
                )
                .map(Some);
            }
        }

        if let Some(job_id) = workflow.find_cycle() {
            return rejection(
                &job_id,
                EngineError::InvalidWorkflow("dependency cycle detected".to_string()),
            )
            .map(Some);
        }

        for (job_id, job) in &workflow.jobs {
            let names: BTreeSet<&String> = workflow
                .variable_sets
                .iter()
                .chain(job.variable_sets.iter())
                .collect();
            for name in names {
                match self.store.load_variable_set(project_key, name).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return rejection(
                            job_id,
                            EngineError::InvalidWorkflow(format!("variable set {name} not found")),
                        )
                        .map(Some)
                    }
                    Err(e) => return rejection(job_id, e).map(Some),
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, crafted: CraftedRun) -> Result<CraftOutcome> {
        let CraftedRun { run, run_jobs } = crafted;
        match self.store.complete_craft(&run, &run_jobs).await? {
            CasResult::Success(run) => {
                for job in run_jobs.iter().filter(|j| j.status == RunJobStatus::Waiting) {
                    self.events.publish(QueueEvent::JobQueued {
                        run_job_id: job.id,
                        workflow_run_id: job.workflow_run_id,
                        job_id: job.job_id.clone(),
                        region: job.region.clone(),
                    });
                }
                log_run_operation(
                    "craft",
                    run.id,
                    Some(&run.workflow_name),
                    run.status.as_str(),
                    Some(&format!("{} jobs", run_jobs.len())),
                );
                Ok(CraftOutcome::Crafted(run))
            }
            CasResult::StateMismatch { actual } => {
                debug!(status = %actual.status, "Run crafted concurrently");
                Ok(CraftOutcome::Skipped)
            }
            CasResult::NotFound => Err(EngineError::not_found("workflow run", run.id)),
        }
    }

    async fn fail(&self, run: &WorkflowRun, message: String) -> Result<CraftOutcome> {
        let info = RunInfo::error(run, message);
        match self.store.fail_craft(run.id, run.run_attempt, &info).await? {
            CasResult::Success(run) => {
                warn!(run_id = %run.id, message = %info.message, "Crafting failed");
                log_run_operation(
                    "craft",
                    run.id,
                    Some(&run.workflow_name),
                    run.status.as_str(),
                    Some(&info.message),
                );
                Ok(CraftOutcome::Failed(info))
            }
            CasResult::StateMismatch { actual } => {
                info!(status = %actual.status, "Run left crafting before its failure was recorded");
                Ok(CraftOutcome::Skipped)
            }
            CasResult::NotFound => Err(EngineError::not_found("workflow run", run.id)),
        }
    }
}

/// Replace every job with a `from` template by the jobs of the template.
///
/// Root jobs of the template inherit the needs of the replaced job, and jobs
/// needing the replaced job need the template's final jobs instead. Template
/// jobs resolve their own references from the template's repository, recorded
/// in `contexts`. `Some` is the rejection message.
async fn expand_templates(
    pass: &mut ResolutionPass<'_>,
    workflow: &mut WorkflowDefinition,
    contexts: &mut HashMap<String, ResolutionContext>,
) -> Result<Option<String>> {
    let templated: Vec<String> = workflow
        .jobs
        .iter()
        .filter(|(_, job)| job.from.is_some())
        .map(|(job_id, _)| job_id.clone())
        .collect();

    for job_id in templated {
        let Some(job) = workflow.jobs.remove(&job_id) else {
            continue;
        };
        let Some(reference) = job.from.as_deref() else {
            continue;
        };

        let resolved = match pass.resolve(reference, EntityType::WorkflowTemplate).await {
            Ok(resolved) => resolved,
            Err(e) => return rejection(&job_id, e).map(Some),
        };
        let template = match resolved.entity.workflow_template_definition(&job.parameters) {
            Ok(template) => template,
            Err(e) => return rejection(&job_id, e).map(Some),
        };
        if template.jobs.is_empty() {
            let error = EngineError::InvalidWorkflow(format!("template {reference} has no job"));
            return rejection(&job_id, error).map(Some);
        }
        for (template_job_id, template_job) in &template.jobs {
            let problem = if *template_job_id == job_id || workflow.jobs.contains_key(template_job_id) {
                format!("job {template_job_id} defined in template {reference} already exists in the workflow")
            } else if template_job.from.is_some() {
                format!("job {template_job_id} of template {reference} uses another template")
            } else {
                continue;
            };
            return rejection(&job_id, EngineError::InvalidWorkflow(problem)).map(Some);
        }

        let final_jobs = template.final_jobs();
        for parent in workflow.jobs.values_mut() {
            if let Some(position) = parent.needs.iter().position(|need| *need == job_id) {
                parent.needs.remove(position);
                parent.needs.extend(final_jobs.iter().cloned());
            }
        }

        let context = ResolutionContext::of_entity(&resolved.entity);
        for (template_job_id, mut template_job) in template.jobs {
            if template_job.needs.is_empty() {
                template_job.needs = job.needs.clone();
            }
            contexts.insert(template_job_id.clone(), context.clone());
            workflow.jobs.insert(template_job_id, template_job);
        }
        debug!(job_id = %job_id, template = %resolved.complete_name, "Expanded workflow template");
    }
    Ok(None)
}

fn job_failure(job_id: &str, error: EngineError) -> Result<Prepared> {
    rejection(job_id, error).map(Prepared::Rejected)
}

/// The rejection message for one job, or the error itself when it is not a
/// crafting failure
fn rejection(job_id: &str, error: EngineError) -> Result<String> {
    if error.is_crafting_failure() || matches!(error, EngineError::Serialization(_)) {
        Ok(format!("job {job_id}: {error}"))
    } else {
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CraftingConfig;
    use crate::models::{
        Entity, EntityType, Hatchery, NewWorkflowRun, Region, RegionGrant, RepositoryRef,
        RunEvent, VariableSet, WorkflowDefinition,
    };
    use crate::store::InMemoryStore;
    use crate::vcs::InMemoryRepositoryClient;

    const WORKFLOW: &str = r#"
name: app-ci
jobs:
  build:
    region: build
    runs-on:
      model: debian
    steps:
      - uses: actions/checkout
      - uses: actions/compile
  test:
    region: build
    needs: [build]
    steps:
      - run: make test
"#;

    fn app() -> RepositoryRef {
        RepositoryRef::new("PROJ", "github", "ovh/app")
    }

    async fn setup() -> (Arc<InMemoryStore>, WorkflowCrafter) {
        let store = Arc::new(InMemoryStore::new());
        store.insert_region(&Region::new("build")).await.unwrap();
        store
            .insert_hatchery(&Hatchery::new("docker-1", "docker", "key"))
            .await
            .unwrap();
        store
            .insert_region_grant(&RegionGrant::spawn("build", "docker-1"))
            .await
            .unwrap();
        store
            .insert_entity(&Entity::new(
                &app(),
                EntityType::Action,
                "compile",
                "refs/heads/main",
                "app-sha",
                "name: compile\nruns:\n  steps:\n    - run: cargo build\n",
            ))
            .await
            .unwrap();
        store
            .insert_entity(&Entity::new(
                &app(),
                EntityType::WorkerModel,
                "debian",
                "refs/heads/main",
                "app-sha",
                "name: debian\ntype: docker\n",
            ))
            .await
            .unwrap();

        let vcs = Arc::new(InMemoryRepositoryClient::new());
        let resolver = DependencyResolver::new(store.clone(), vcs, CraftingConfig::default());
        let authorizer = RegionAuthorizer::new(store.clone(), None);
        let crafter = WorkflowCrafter::new(store.clone(), resolver, authorizer, EventPublisher::default());
        (store, crafter)
    }

    async fn insert_run(store: &InMemoryStore, workflow: &str) -> WorkflowRun {
        let workflow: WorkflowDefinition = serde_yaml::from_str(workflow).unwrap();
        let run = WorkflowRun::new(NewWorkflowRun {
            project_key: "PROJ".to_string(),
            vcs_server: "github".to_string(),
            repository: "ovh/app".to_string(),
            workflow_ref: "refs/heads/main".to_string(),
            workflow_sha: "app-sha".to_string(),
            run_number: 1,
            workflow,
            event: RunEvent::default(),
        });
        store.insert_run(&run).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_craft_pins_references_and_materializes_jobs() {
        let (store, crafter) = setup().await;
        let run = insert_run(&store, WORKFLOW).await;

        let CraftOutcome::Crafted(crafted) = crafter.craft(run.id).await.unwrap() else {
            panic!("run should be crafted");
        };
        assert_eq!(crafted.status, WorkflowRunStatus::Building);

        let data = &crafted.workflow_data;
        let build = &data.workflow.jobs["build"];
        assert_eq!(build.runs_on.model, "PROJ/github/ovh/app/debian@refs/heads/main");
        assert_eq!(build.steps[0].uses.as_deref(), Some("actions/checkout"));
        assert_eq!(
            build.steps[1].uses.as_deref(),
            Some("actions/PROJ/github/ovh/app/compile@refs/heads/main")
        );
        assert!(data.actions.contains_key("PROJ/github/ovh/app/compile@refs/heads/main"));
        assert_eq!(
            data.worker_models["PROJ/github/ovh/app/debian@refs/heads/main"].model_type,
            "docker"
        );

        let jobs = store.load_run_jobs(run.id, 1).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "build");
        assert_eq!(jobs[0].status, RunJobStatus::Waiting);
        assert_eq!(jobs[0].model_type, "docker");
        assert_eq!(jobs[1].job_id, "test");
        assert_eq!(jobs[1].status, RunJobStatus::Blocked);
        assert_eq!(jobs[1].model_type, "");
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (store, crafter) = setup().await;
        let run = insert_run(&store, WORKFLOW).await;

        assert!(matches!(crafter.craft(run.id).await.unwrap(), CraftOutcome::Crafted(_)));
        assert_eq!(crafter.craft(run.id).await.unwrap(), CraftOutcome::Skipped);
        assert_eq!(store.load_run_jobs(run.id, 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_with_one_info() {
        let (store, crafter) = setup().await;
        let workflow = WORKFLOW.replace("actions/compile", "actions/package");
        let run = insert_run(&store, &workflow).await;

        let CraftOutcome::Failed(info) = crafter.craft(run.id).await.unwrap() else {
            panic!("crafting should fail");
        };
        assert_eq!(
            info.message,
            "job build: obsolete workflow dependency used: actions/package"
        );

        let stored = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowRunStatus::Fail);
        assert_eq!(store.load_run_infos(run.id).await.unwrap(), vec![info]);
        assert!(store.load_run_jobs(run.id, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_model_fails_crafting() {
        let (store, crafter) = setup().await;
        store
            .insert_entity(&Entity::new(
                &app(),
                EntityType::WorkerModel,
                "ubuntu-vm",
                "refs/heads/main",
                "app-sha",
                "name: ubuntu-vm\ntype: openstack\n",
            ))
            .await
            .unwrap();
        let workflow = WORKFLOW.replace("model: debian", "model: ubuntu-vm");
        let run = insert_run(&store, &workflow).await;

        let CraftOutcome::Failed(info) = crafter.craft(run.id).await.unwrap() else {
            panic!("crafting should fail");
        };
        assert_eq!(
            info.message,
            "job build: wrong configuration on job \"build\". No hatchery can run it with model [PROJ/github/ovh/app/ubuntu-vm@refs/heads/main]"
        );
    }

    #[tokio::test]
    async fn test_graph_and_variable_sets_are_validated() {
        let (store, crafter) = setup().await;

        let cyclic = WORKFLOW.replace("region: build\n    runs-on:", "region: build\n    needs: [test]\n    runs-on:");
        let run = insert_run(&store, &cyclic).await;
        let CraftOutcome::Failed(info) = crafter.craft(run.id).await.unwrap() else {
            panic!("cycle should fail crafting");
        };
        assert!(info.message.contains("dependency cycle"));

        let dangling = WORKFLOW.replace("needs: [build]", "needs: [compile]");
        let run = insert_run(&store, &dangling).await;
        let CraftOutcome::Failed(info) = crafter.craft(run.id).await.unwrap() else {
            panic!("unknown need should fail crafting");
        };
        assert_eq!(info.message, "job test: invalid workflow: needs unknown job compile");

        let with_vars = format!("vars: [deploy]\n{WORKFLOW}");
        let run = insert_run(&store, &with_vars).await;
        let CraftOutcome::Failed(info) = crafter.craft(run.id).await.unwrap() else {
            panic!("missing variable set should fail crafting");
        };
        assert_eq!(info.message, "job build: invalid workflow: variable set deploy not found");

        store
            .insert_variable_set(&VariableSet::new("PROJ", "deploy", vec![]))
            .await
            .unwrap();
        let run = insert_run(&store, &with_vars).await;
        assert!(matches!(crafter.craft(run.id).await.unwrap(), CraftOutcome::Crafted(_)));
    }

    #[tokio::test]
    async fn test_craft_pending_crafts_every_crafting_run() {
        let (store, crafter) = setup().await;
        let first = insert_run(&store, WORKFLOW).await;
        let second = insert_run(&store, WORKFLOW).await;
        store.set_run_read_only(second.id).await.unwrap();

        let outcomes = crafter.craft_pending().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        for (run_id, outcome) in outcomes {
            if run_id == first.id {
                assert!(matches!(outcome, CraftOutcome::Crafted(_)));
            } else {
                assert_eq!(outcome, CraftOutcome::Skipped);
            }
        }
    }
}
