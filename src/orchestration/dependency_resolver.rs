//! # Dependency Resolver
//!
//! Resolves symbolic references to actions, worker models and workflow
//! templates into concrete entities, pinning each reference to its complete
//! name `project/vcs/owner/repo/name@ref`.
//!
//! Reference forms, path split on `/` with an optional `@ref` suffix:
//!
//! | segments | form                          | repository                      |
//! |----------|-------------------------------|---------------------------------|
//! | 1        | `name`                        | the caller's, at the caller ref |
//! | 2        | `library/name`                | found in the library project    |
//! | 3        | `owner/repo/name`             | caller project and vcs          |
//! | 4        | `vcs/owner/repo/name`         | caller project                  |
//! | 5        | `project/vcs/owner/repo/name` | fully qualified                 |
//!
//! A [`ResolutionPass`] holds the caches of one crafting pass (default branch
//! per repository, named refs, resolved entities). It is never shared between
//! runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::with_timeout;
use crate::config::CraftingConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    ActionDefinition, ActionStep, Entity, EntityLookup, EntityType, RepositoryRef,
    WorkerModelDefinition, WorkflowRun,
};
use crate::store::Store;
use crate::vcs::{Branch, RepositoryClient, BRANCH_REF_PREFIX, TAG_REF_PREFIX};

pub const ACTIONS_PREFIX: &str = "actions/";
pub const LIBRARY_SEGMENT: &str = "library";

/// Repository part of a parsed reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryTarget {
    /// The calling repository
    Embedded,
    /// Whichever repository of the library project holds the entity
    Library,
    /// Missing project or vcs default to the caller's
    Repository {
        project_key: Option<String>,
        vcs_server: Option<String>,
        repository: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReference {
    pub target: RepositoryTarget,
    pub name: String,
    pub git_ref: Option<String>,
}

impl EntityReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidWorkflow(format!("unable to parse reference {reference}"));

        let (path, git_ref) = match reference.split_once('@') {
            Some((_, "")) => return Err(invalid()),
            Some((path, git_ref)) => (path, Some(git_ref.to_string())),
            None => (reference, None),
        };

        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid());
        }

        let (target, name) = match segments.as_slice() {
            [name] => (RepositoryTarget::Embedded, *name),
            [LIBRARY_SEGMENT, name] => (RepositoryTarget::Library, *name),
            [_, _] => {
                return Err(EngineError::InvalidWorkflow(format!(
                    "unable to get repository from {path}"
                )))
            }
            [owner, repo, name] => (
                RepositoryTarget::Repository {
                    project_key: None,
                    vcs_server: None,
                    repository: format!("{owner}/{repo}"),
                },
                *name,
            ),
            [vcs, owner, repo, name] => (
                RepositoryTarget::Repository {
                    project_key: None,
                    vcs_server: Some(vcs.to_string()),
                    repository: format!("{owner}/{repo}"),
                },
                *name,
            ),
            [project, vcs, owner, repo, name] => (
                RepositoryTarget::Repository {
                    project_key: Some(project.to_string()),
                    vcs_server: Some(vcs.to_string()),
                    repository: format!("{owner}/{repo}"),
                },
                *name,
            ),
            _ => return Err(invalid()),
        };

        Ok(Self {
            target,
            name: name.to_string(),
            git_ref,
        })
    }
}

/// What a step's `uses` points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionUses {
    /// `actions/<name>`, shipped with the worker
    Builtin(String),
    /// Entity reference with the `actions/` prefix removed
    Entity(String),
}

impl ActionUses {
    /// A single `actions/<name>` segment is built-in when listed in `builtins`,
    /// otherwise an action embedded in the caller's repository
    pub fn parse(uses: &str, builtins: &[String]) -> Self {
        match uses.strip_prefix(ACTIONS_PREFIX) {
            Some(name) if builtins.iter().any(|builtin| builtin == name) => {
                Self::Builtin(name.to_string())
            }
            Some(reference) => Self::Entity(reference.to_string()),
            None => Self::Entity(uses.to_string()),
        }
    }
}

/// Repository, ref and commit that relative references are resolved against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    pub repository: RepositoryRef,
    pub git_ref: String,
    pub commit: String,
}

impl ResolutionContext {
    pub fn of_run(run: &WorkflowRun) -> Self {
        Self {
            repository: run.repository_ref(),
            git_ref: run.workflow_ref.clone(),
            commit: run.workflow_sha.clone(),
        }
    }

    /// References inside an entity are relative to where the entity lives
    pub fn of_entity(entity: &Entity) -> Self {
        Self {
            repository: entity.repository_ref(),
            git_ref: entity.git_ref.clone(),
            commit: entity.commit.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntity {
    pub complete_name: String,
    pub entity: Entity,
}

pub struct DependencyResolver {
    store: Arc<dyn Store>,
    vcs: Arc<dyn RepositoryClient>,
    config: CraftingConfig,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn Store>, vcs: Arc<dyn RepositoryClient>, config: CraftingConfig) -> Self {
        Self { store, vcs, config }
    }

    /// Start a crafting pass for a run, with empty caches
    pub fn begin_pass(&self, run: &WorkflowRun) -> ResolutionPass<'_> {
        ResolutionPass {
            resolver: self,
            root: ResolutionContext::of_run(run),
            default_branches: HashMap::new(),
            named_refs: HashMap::new(),
            resolved: HashMap::new(),
        }
    }
}

pub struct ResolutionPass<'a> {
    resolver: &'a DependencyResolver,
    root: ResolutionContext,
    default_branches: HashMap<RepositoryRef, Branch>,
    named_refs: HashMap<(RepositoryRef, String), (String, Option<String>)>,
    resolved: HashMap<(EntityType, String), ResolvedEntity>,
}

impl ResolutionPass<'_> {
    pub fn root(&self) -> &ResolutionContext {
        &self.root
    }

    /// Resolve a reference relative to the run's own repository
    pub async fn resolve(&mut self, reference: &str, entity_type: EntityType) -> Result<ResolvedEntity> {
        let root = self.root.clone();
        self.resolve_from(&root, reference, entity_type).await
    }

    pub async fn resolve_from(
        &mut self,
        caller: &ResolutionContext,
        reference: &str,
        entity_type: EntityType,
    ) -> Result<ResolvedEntity> {
        let resolver = self.resolver;
        let parsed = EntityReference::parse(reference)?;
        let not_found = || EngineError::DependencyNotFound {
            reference: reference.to_string(),
        };

        let repository = match &parsed.target {
            RepositoryTarget::Embedded => caller.repository.clone(),
            RepositoryTarget::Library => {
                let library = resolver
                    .config
                    .library_project_key
                    .as_deref()
                    .ok_or_else(not_found)?;
                resolver
                    .store
                    .find_project_entity(library, entity_type, &parsed.name)
                    .await?
                    .ok_or_else(not_found)?
                    .repository_ref()
            }
            RepositoryTarget::Repository {
                project_key,
                vcs_server,
                repository,
            } => RepositoryRef {
                project_key: project_key
                    .clone()
                    .unwrap_or_else(|| caller.repository.project_key.clone()),
                vcs_server: vcs_server
                    .clone()
                    .unwrap_or_else(|| caller.repository.vcs_server.clone()),
                repository: repository.clone(),
            },
        };

        let same_repository = repository == caller.repository;
        let (git_ref, commit) = self
            .resolve_ref(caller, &repository, same_repository, parsed.git_ref.as_deref(), reference)
            .await?;

        let complete_name = format!("{repository}/{}@{git_ref}", parsed.name);
        let cache_key = (entity_type, complete_name.clone());
        if let Some(hit) = self.resolved.get(&cache_key) {
            return Ok(hit.clone());
        }

        let pinned_to_caller = same_repository && git_ref == caller.git_ref;
        let entity = self
            .lookup(&repository, entity_type, &parsed.name, &git_ref, commit, pinned_to_caller)
            .await?
            .ok_or_else(not_found)?;

        debug!(
            reference = %reference,
            complete_name = %complete_name,
            commit = %entity.commit,
            "Resolved workflow dependency"
        );

        let resolved = ResolvedEntity {
            complete_name,
            entity,
        };
        self.resolved.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    /// Pin the `uses` of every step, resolving nested actions too.
    ///
    /// Resolved action definitions are added to `actions` keyed by complete
    /// name, with their own steps pinned.
    pub async fn resolve_steps(
        &mut self,
        steps: &mut [ActionStep],
        actions: &mut BTreeMap<String, ActionDefinition>,
    ) -> Result<()> {
        let root = self.root.clone();
        self.resolve_steps_from(&root, steps, actions).await
    }

    /// [`Self::resolve_steps`] for steps that live in another repository,
    /// such as the jobs of a workflow template
    pub async fn resolve_steps_from(
        &mut self,
        caller: &ResolutionContext,
        steps: &mut [ActionStep],
        actions: &mut BTreeMap<String, ActionDefinition>,
    ) -> Result<()> {
        let mut pending: Vec<(ResolvedEntity, usize)> = self
            .pin_steps(caller, steps)
            .await?
            .into_iter()
            .map(|resolved| (resolved, 1))
            .collect();

        let max_depth = self.resolver.config.max_action_depth;
        while let Some((resolved, depth)) = pending.pop() {
            if actions.contains_key(&resolved.complete_name) {
                continue;
            }
            if depth > max_depth {
                return Err(EngineError::InvalidWorkflow(format!(
                    "action {} exceeds the maximum nesting depth of {max_depth}",
                    resolved.complete_name
                )));
            }

            let mut definition = resolved.entity.action_definition()?;
            let context = ResolutionContext::of_entity(&resolved.entity);
            let nested = self.pin_steps(&context, &mut definition.runs.steps).await?;
            actions.insert(resolved.complete_name, definition);
            pending.extend(nested.into_iter().map(|nested| (nested, depth + 1)));
        }
        Ok(())
    }

    /// Resolve a `runs-on` model; an empty reference needs no model
    pub async fn resolve_worker_model(
        &mut self,
        model: &str,
    ) -> Result<Option<(String, WorkerModelDefinition)>> {
        let root = self.root.clone();
        self.resolve_worker_model_from(&root, model).await
    }

    pub async fn resolve_worker_model_from(
        &mut self,
        caller: &ResolutionContext,
        model: &str,
    ) -> Result<Option<(String, WorkerModelDefinition)>> {
        if model.is_empty() {
            return Ok(None);
        }
        let resolved = self
            .resolve_from(caller, model, EntityType::WorkerModel)
            .await?;
        let definition = resolved.entity.worker_model_definition()?;
        Ok(Some((resolved.complete_name, definition)))
    }

    async fn pin_steps(
        &mut self,
        caller: &ResolutionContext,
        steps: &mut [ActionStep],
    ) -> Result<Vec<ResolvedEntity>> {
        let mut resolved = Vec::new();
        for step in steps.iter_mut() {
            let Some(uses) = step.uses.clone() else {
                continue;
            };
            match ActionUses::parse(&uses, &self.resolver.config.builtin_actions) {
                ActionUses::Builtin(_) => {}
                ActionUses::Entity(reference) => {
                    let action = self
                        .resolve_from(caller, &reference, EntityType::Action)
                        .await
                        .map_err(|e| match e {
                            EngineError::DependencyNotFound { .. } => {
                                EngineError::DependencyNotFound {
                                    reference: uses.clone(),
                                }
                            }
                            other => other,
                        })?;
                    step.uses = Some(format!("{ACTIONS_PREFIX}{}", action.complete_name));
                    resolved.push(action);
                }
            }
        }
        Ok(resolved)
    }

    /// Turn the requested ref into `(ref, known commit)`
    async fn resolve_ref(
        &mut self,
        caller: &ResolutionContext,
        repository: &RepositoryRef,
        same_repository: bool,
        requested: Option<&str>,
        reference: &str,
    ) -> Result<(String, Option<String>)> {
        let resolver = self.resolver;

        let Some(requested) = requested else {
            if same_repository {
                return Ok((caller.git_ref.clone(), Some(caller.commit.clone())));
            }
            if let Some(branch) = self.default_branches.get(repository) {
                return Ok((branch.git_ref(), Some(branch.latest_commit.clone())));
            }
            let branch = with_timeout(
                "vcs.get_default_branch",
                resolver.config.vcs_timeout(),
                resolver.vcs.get_default_branch(repository),
            )
            .await?;
            let resolved = (branch.git_ref(), Some(branch.latest_commit.clone()));
            self.default_branches.insert(repository.clone(), branch);
            return Ok(resolved);
        };

        if requested.starts_with(BRANCH_REF_PREFIX) || requested.starts_with(TAG_REF_PREFIX) {
            let commit = (same_repository && requested == caller.git_ref).then(|| caller.commit.clone());
            return Ok((requested.to_string(), commit));
        }

        if same_repository {
            for candidate in [
                format!("{BRANCH_REF_PREFIX}{requested}"),
                format!("{TAG_REF_PREFIX}{requested}"),
            ] {
                if candidate == caller.git_ref {
                    return Ok((candidate, Some(caller.commit.clone())));
                }
            }
        }

        let cache_key = (repository.clone(), requested.to_string());
        if let Some(hit) = self.named_refs.get(&cache_key) {
            return Ok(hit.clone());
        }

        let branch = with_timeout(
            "vcs.get_branch",
            resolver.config.vcs_timeout(),
            resolver.vcs.get_branch(repository, requested),
        )
        .await?;
        let resolved = match branch {
            Some(branch) => (branch.git_ref(), Some(branch.latest_commit)),
            None => {
                let tag = with_timeout(
                    "vcs.get_tag",
                    resolver.config.vcs_timeout(),
                    resolver.vcs.get_tag(repository, requested),
                )
                .await?;
                match tag {
                    Some(tag) => (tag.git_ref(), Some(tag.commit)),
                    None => {
                        return Err(EngineError::DependencyNotFound {
                            reference: reference.to_string(),
                        })
                    }
                }
            }
        };
        self.named_refs.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    /// Store lookup at the known commit, then at the ref head.
    ///
    /// Entities of the caller's own ref are only taken at the caller's commit.
    async fn lookup(
        &self,
        repository: &RepositoryRef,
        entity_type: EntityType,
        name: &str,
        git_ref: &str,
        commit: Option<String>,
        pinned_to_caller: bool,
    ) -> Result<Option<Entity>> {
        let store = &self.resolver.store;
        let mut lookup = EntityLookup {
            repository: repository.clone(),
            entity_type,
            name: name.to_string(),
            git_ref: git_ref.to_string(),
            commit,
        };

        if lookup.commit.is_some() {
            let found = store.find_entity(&lookup).await?;
            if found.is_some() || pinned_to_caller {
                return Ok(found);
            }
            lookup.commit = None;
        }
        store.find_entity(&lookup).await
    }
}
