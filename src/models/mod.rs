pub mod entity;
pub mod hatchery;
pub mod run_job;
pub mod run_result;
pub mod variable_set;
pub mod worker;
pub mod workflow_data;
pub mod workflow_run;

// Re-export core models for easy access
pub use entity::{Entity, EntityLookup, EntityType, RepositoryRef};
pub use hatchery::{Hatchery, HatcheryStatus, Region, RegionGrant, RegionRole};
pub use run_job::{RunJob, RunJobInfo};
pub use run_result::{NewRunResult, RunResult, RunResultDetail, RunResultKind, RunResultStatus};
pub use variable_set::{VariableSet, VariableSetItem, VariableSetItemType};
pub use worker::{Worker, WorkerRegistration, WorkerStatus};
pub use workflow_data::{
    ActionDefinition, ActionInput, ActionRuns, ActionStep, JobDefinition, RunsOn,
    TemplateParameter, WorkerModelDefinition, WorkflowData, WorkflowDefinition,
    WorkflowTemplateDefinition,
};
pub use workflow_run::{NewWorkflowRun, RunEvent, RunInfo, RunInfoLevel, WorkflowRun};
