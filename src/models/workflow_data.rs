//! # Workflow Data
//!
//! The job graph of a run as handed to the engine once the workflow file has
//! been parsed. Crafting pins every external reference in place and records
//! the resolved actions and worker models next to the graph, keyed by their
//! complete name (`project/vcs/owner/repo/name@ref`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, Result};

/// The job graph plus everything crafting resolved for it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowData {
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDefinition>,
    #[serde(default, rename = "worker_models")]
    pub worker_models: BTreeMap<String, WorkerModelDefinition>,
}

impl WorkflowData {
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            workflow,
            actions: BTreeMap::new(),
            worker_models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
    /// Variable sets available to every job
    #[serde(default, rename = "vars")]
    pub variable_sets: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Detect a dependency cycle, returning one job that belongs to it
    pub fn find_cycle(&self) -> Option<String> {
        fn visit<'a>(
            job_id: &'a str,
            jobs: &'a BTreeMap<String, JobDefinition>,
            visiting: &mut BTreeSet<&'a str>,
            done: &mut BTreeSet<&'a str>,
        ) -> Option<String> {
            if done.contains(job_id) {
                return None;
            }
            if !visiting.insert(job_id) {
                return Some(job_id.to_string());
            }
            if let Some(job) = jobs.get(job_id) {
                for need in &job.needs {
                    if let Some(cycle) = visit(need, jobs, visiting, done) {
                        return Some(cycle);
                    }
                }
            }
            visiting.remove(job_id);
            done.insert(job_id);
            None
        }

        let mut visiting = BTreeSet::new();
        let mut done = BTreeSet::new();
        self.jobs
            .keys()
            .find_map(|job_id| visit(job_id, &self.jobs, &mut visiting, &mut done))
    }
}

/// A job of the workflow graph
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub runs_on: RunsOn,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default, rename = "vars")]
    pub variable_sets: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// A failure of this job still satisfies its dependents
    #[serde(default)]
    pub continue_on_error: bool,
    /// Skipped dependencies do not skip this job
    #[serde(default)]
    pub continue_on_skip: bool,
    /// Workflow template whose jobs replace this one at crafting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Values for the parameters of the `from` template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunsOn {
    /// Worker model reference, empty when any worker will do
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
}

/// A reusable action, as stored in an action entity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, ActionInput>,
    #[serde(default)]
    pub runs: ActionRuns,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionRuns {
    #[serde(default)]
    pub steps: Vec<ActionStep>,
}

/// A worker model, as stored in a worker-model entity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerModelDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    #[serde(default, rename = "osarch")]
    pub os_arch: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A reusable group of jobs, as stored in a workflow-template entity.
///
/// Job fields may embed `${{ parameters.<key> }}` placeholders.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowTemplateDefinition {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

impl WorkflowTemplateDefinition {
    /// Parse a template and substitute its declared parameters.
    ///
    /// A declared parameter without a value renders empty, unless it is
    /// required.
    pub fn render(source: &str, parameters: &BTreeMap<String, String>) -> Result<Self> {
        let declared: Self = serde_yaml::from_str(source)?;
        if let Some(missing) = declared
            .parameters
            .iter()
            .find(|p| p.required && !parameters.contains_key(&p.key))
        {
            return Err(EngineError::InvalidWorkflow(format!(
                "required parameter {} of template {} is missing",
                missing.key, declared.name
            )));
        }

        let mut rendered = source.to_string();
        for parameter in &declared.parameters {
            let value = parameters.get(&parameter.key).map_or("", String::as_str);
            for placeholder in [
                format!("${{{{ parameters.{} }}}}", parameter.key),
                format!("${{{{parameters.{}}}}}", parameter.key),
            ] {
                rendered = rendered.replace(&placeholder, value);
            }
        }
        Ok(serde_yaml::from_str(&rendered)?)
    }

    /// Jobs no other template job depends on
    pub fn final_jobs(&self) -> Vec<String> {
        self.jobs
            .keys()
            .filter(|id| !self.jobs.values().any(|job| job.needs.contains(id)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(needs: &[&str]) -> JobDefinition {
        JobDefinition {
            needs: needs.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_cycle() {
        let mut workflow = WorkflowDefinition::default();
        workflow.jobs.insert("build".to_string(), job(&[]));
        workflow.jobs.insert("test".to_string(), job(&["build"]));
        workflow.jobs.insert("deploy".to_string(), job(&["build", "test"]));
        assert_eq!(workflow.find_cycle(), None);

        workflow.jobs.insert("build".to_string(), job(&["deploy"]));
        assert!(workflow.find_cycle().is_some());
    }

    const TEMPLATE: &str = r#"
name: deploy-template
parameters:
  - key: environment
    required: true
  - key: channel
jobs:
  package:
    steps:
      - run: make package
  publish:
    needs: [package]
    env:
      TARGET: ${{ parameters.environment }}
      CHANNEL: "${{parameters.channel}}"
    steps:
      - run: publish
"#;

    #[test]
    fn test_template_render_substitutes_parameters() {
        let mut parameters = BTreeMap::new();
        parameters.insert("environment".to_string(), "staging".to_string());
        let template = WorkflowTemplateDefinition::render(TEMPLATE, &parameters).unwrap();

        assert_eq!(template.jobs["publish"].env["TARGET"], "staging");
        assert_eq!(template.jobs["publish"].env["CHANNEL"], "");
        assert_eq!(template.final_jobs(), vec!["publish".to_string()]);
    }

    #[test]
    fn test_template_render_requires_parameters() {
        let err = WorkflowTemplateDefinition::render(TEMPLATE, &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid workflow: required parameter environment of template deploy-template is missing"
        );
    }

    #[test]
    fn test_job_definition_from_yaml() {
        let yaml = r#"
region: build
runs-on:
  model: docker-debian
needs: [compile]
vars: [deploy-secrets]
continue-on-error: true
steps:
  - uses: actions/checkout
  - run: make test
"#;
        let job: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.region, "build");
        assert_eq!(job.runs_on.model, "docker-debian");
        assert_eq!(job.needs, vec!["compile".to_string()]);
        assert_eq!(job.variable_sets, vec!["deploy-secrets".to_string()]);
        assert!(job.continue_on_error);
        assert!(!job.continue_on_skip);
        assert_eq!(job.steps[0].uses.as_deref(), Some("actions/checkout"));
        assert_eq!(job.steps[1].run.as_deref(), Some("make test"));
    }
}
