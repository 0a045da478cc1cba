use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::workflow_data::{ActionDefinition, WorkerModelDefinition, WorkflowTemplateDefinition};
use crate::error::Result;

/// A repository as addressed by the engine: `project/vcs/owner/repo`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub project_key: String,
    pub vcs_server: String,
    /// `owner/name`
    pub repository: String,
}

impl RepositoryRef {
    pub fn new(project_key: &str, vcs_server: &str, repository: &str) -> Self {
        Self {
            project_key: project_key.to_string(),
            vcs_server: vcs_server.to_string(),
            repository: repository.to_string(),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_key, self.vcs_server, self.repository
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Action,
    WorkerModel,
    WorkflowTemplate,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "Action",
            Self::WorkerModel => "WorkerModel",
            Self::WorkflowTemplate => "WorkflowTemplate",
        }
    }

    /// Directory of the repository holding entities of this type
    pub fn directory(&self) -> &'static str {
        match self {
            Self::Action => ".hatchery/actions/",
            Self::WorkerModel => ".hatchery/worker-models/",
            Self::WorkflowTemplate => ".hatchery/workflow-templates/",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Action" => Ok(Self::Action),
            "WorkerModel" => Ok(Self::WorkerModel),
            "WorkflowTemplate" => Ok(Self::WorkflowTemplate),
            _ => Err(format!("Invalid entity type: {s}")),
        }
    }
}

/// A versioned artifact analyzed from a repository at a ref and commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub project_key: String,
    pub vcs_server: String,
    pub repository: String,
    pub entity_type: EntityType,
    pub name: String,
    pub git_ref: String,
    pub commit: String,
    pub file_path: String,
    /// YAML content of the entity file
    pub data: String,
    pub last_update: DateTime<Utc>,
}

impl Entity {
    /// Entity analyzed now at `git_ref`/`commit`, stored under the type's directory
    pub fn new(
        repository: &RepositoryRef,
        entity_type: EntityType,
        name: &str,
        git_ref: &str,
        commit: &str,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_key: repository.project_key.clone(),
            vcs_server: repository.vcs_server.clone(),
            repository: repository.repository.clone(),
            entity_type,
            name: name.to_string(),
            git_ref: git_ref.to_string(),
            commit: commit.to_string(),
            file_path: format!("{}{name}.yml", entity_type.directory()),
            data: data.into(),
            last_update: Utc::now(),
        }
    }

    pub fn repository_ref(&self) -> RepositoryRef {
        RepositoryRef::new(&self.project_key, &self.vcs_server, &self.repository)
    }

    /// Pinned name recorded in crafted workflow data
    pub fn complete_name(&self) -> String {
        format!("{}/{}@{}", self.repository_ref(), self.name, self.git_ref)
    }

    pub fn action_definition(&self) -> Result<ActionDefinition> {
        Ok(serde_yaml::from_str(&self.data)?)
    }

    pub fn worker_model_definition(&self) -> Result<WorkerModelDefinition> {
        Ok(serde_yaml::from_str(&self.data)?)
    }

    pub fn workflow_template_definition(
        &self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<WorkflowTemplateDefinition> {
        WorkflowTemplateDefinition::render(&self.data, parameters)
    }
}

/// Store lookup key for an entity.
///
/// `commit: None` selects the most recently analyzed entity of the ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityLookup {
    pub repository: RepositoryRef,
    pub entity_type: EntityType,
    pub name: String,
    pub git_ref: String,
    pub commit: Option<String>,
}
