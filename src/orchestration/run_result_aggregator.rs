//! # Run Result Aggregator
//!
//! Stores the results posted by workers and assembles the contexts handed to
//! a job when its worker takes it:
//!
//! - `cds`: run and job identity
//! - `git`: repository, ref and commit of the run
//! - `env`: workflow env overridden by job env
//! - `jobs`: status and `Variable` outputs of every ended job of the attempt
//! - `needs`: the `jobs` entries of the job's dependencies
//! - `vars`: declared variable sets, secrets revealed
//!
//! Every revealed secret also lands in [`SensitiveData`] so the worker can mask
//! it in logs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    NewRunResult, RunJob, RunResult, RunResultDetail, VariableSetItemType, WorkflowRun,
};
use crate::secrets::SecretResolver;
use crate::state_machine::RunJobStatus;
use crate::store::{Store, UpsertResult};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CdsContext {
    pub project_key: String,
    pub workflow: String,
    pub run_id: Uuid,
    pub run_number: i64,
    pub run_attempt: i32,
    pub job: String,
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GitContext {
    pub server: String,
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

/// Outcome of an ended job as seen by later jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultContext {
    pub result: RunJobStatus,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobContexts {
    pub cds: CdsContext,
    pub git: GitContext,
    pub env: BTreeMap<String, String>,
    pub jobs: BTreeMap<String, JobResultContext>,
    pub needs: BTreeMap<String, JobResultContext>,
    pub vars: BTreeMap<String, serde_json::Value>,
}

/// Values a worker must mask in its output
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitiveData(BTreeSet<String>);

impl SensitiveData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, each of its lines and its one-line form
    pub fn add(&mut self, value: &str) {
        let variants = value
            .split('\n')
            .chain(value.split("\\n"))
            .map(str::to_string)
            .chain(std::iter::once(value.replace('\n', "\\n")));
        self.0.extend(variants.filter(|v| !v.is_empty()));
    }

    /// Add a JSON secret: its serialized form and every scalar it holds
    pub fn add_json(&mut self, value: &serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                self.0.insert(value.to_string());
                map.values().for_each(|v| self.add_json(v));
            }
            serde_json::Value::Array(items) => {
                self.0.insert(value.to_string());
                items.iter().for_each(|v| self.add_json(v));
            }
            serde_json::Value::String(s) => self.add(s),
            serde_json::Value::Null => {}
            scalar => self.add(&scalar.to_string()),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct RunResultAggregator {
    store: Arc<dyn Store>,
    secrets: Arc<dyn SecretResolver>,
}

impl RunResultAggregator {
    pub fn new(store: Arc<dyn Store>, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { store, secrets }
    }

    /// Store a result of a job.
    ///
    /// A `Completed` result is final: posting it again unchanged returns the
    /// stored one, posting a different one is a [`EngineError::Conflict`].
    pub async fn record(&self, run_job: &RunJob, new_result: NewRunResult) -> Result<RunResult> {
        let result = RunResult::new(run_job, new_result);
        match self.store.upsert_run_result(&result).await? {
            UpsertResult::Inserted | UpsertResult::Updated => Ok(result),
            UpsertResult::Rejected { existing } if existing.detail == result.detail => {
                debug!(
                    run_job_id = %run_job.id,
                    kind = %result.kind(),
                    name = %result.name(),
                    "Completed result posted again"
                );
                Ok(existing)
            }
            UpsertResult::Rejected { existing } => Err(EngineError::Conflict(format!(
                "{} result {} of job {} is already completed",
                existing.kind(),
                existing.name(),
                run_job.job_id
            ))),
        }
    }

    /// `Variable` outputs of the attempt, per run job
    pub async fn variable_outputs(
        &self,
        run_id: Uuid,
        run_attempt: i32,
    ) -> Result<HashMap<Uuid, BTreeMap<String, String>>> {
        let mut outputs: HashMap<Uuid, BTreeMap<String, String>> = HashMap::new();
        for result in self.store.load_run_results(run_id, run_attempt).await? {
            if let RunResultDetail::Variable { name, value } = result.detail {
                outputs.entry(result.run_job_id).or_default().insert(name, value);
            }
        }
        Ok(outputs)
    }

    /// Contexts and values to mask for the job a worker is taking
    pub async fn build_contexts(
        &self,
        run: &WorkflowRun,
        run_job: &RunJob,
    ) -> Result<(JobContexts, SensitiveData)> {
        let workflow = &run.workflow_data.workflow;
        let mut sensitive = SensitiveData::new();

        let cds = CdsContext {
            project_key: run.project_key.clone(),
            workflow: run.workflow_name.clone(),
            run_id: run.id,
            run_number: run.run_number,
            run_attempt: run.run_attempt,
            job: run_job.job_id.clone(),
            event_name: run.event.hook_type.clone(),
        };
        let git = GitContext {
            server: run.vcs_server.clone(),
            repository: run.repository.clone(),
            git_ref: run.workflow_ref.clone(),
            sha: run.workflow_sha.clone(),
        };

        let mut env = workflow.env.clone();
        env.extend(run_job.job.env.clone());

        let mut outputs = self.variable_outputs(run.id, run.run_attempt).await?;
        let jobs: BTreeMap<String, JobResultContext> = self
            .store
            .load_run_jobs(run.id, run.run_attempt)
            .await?
            .into_iter()
            .filter(|job| job.status.is_terminal())
            .map(|job| {
                let context = JobResultContext {
                    result: job.status,
                    outputs: outputs.remove(&job.id).unwrap_or_default(),
                };
                (job.job_id, context)
            })
            .collect();

        let needs = run_job
            .job
            .needs
            .iter()
            .filter_map(|need| {
                let mut context = jobs.get(need)?.clone();
                let continue_on_error = workflow
                    .jobs
                    .get(need)
                    .map_or(false, |job| job.continue_on_error);
                if context.result == RunJobStatus::Fail && continue_on_error {
                    context.result = RunJobStatus::Success;
                }
                Some((need.clone(), context))
            })
            .collect();

        let set_names: BTreeSet<&String> = workflow
            .variable_sets
            .iter()
            .chain(run_job.job.variable_sets.iter())
            .collect();
        let mut vars = BTreeMap::new();
        for name in set_names {
            let variable_set = self
                .store
                .load_variable_set(&run.project_key, name)
                .await?
                .ok_or_else(|| EngineError::not_found("variable set", name))?;

            let mut items = serde_json::Map::new();
            for item in &variable_set.items {
                let is_secret = item.item_type == VariableSetItemType::Secret;
                let value = if is_secret {
                    self.secrets.reveal(&variable_set, item).await?
                } else {
                    item.value.clone()
                };
                let parsed = parse_structured(&value);
                if is_secret {
                    sensitive.add(&value);
                    if let Some(json) = &parsed {
                        sensitive.add_json(json);
                    }
                }
                items.insert(
                    item.name.clone(),
                    parsed.unwrap_or(serde_json::Value::String(value)),
                );
            }
            vars.insert(name.clone(), serde_json::Value::Object(items));
        }

        let contexts = JobContexts {
            cds,
            git,
            env,
            jobs,
            needs,
            vars,
        };
        Ok((contexts, sensitive))
    }
}

/// JSON object or array values are exposed structured
fn parse_structured(value: &str) -> Option<serde_json::Value> {
    let trimmed = value.trim();
    let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !looks_structured {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
