use super::errors::{StateMachineError, StateMachineResult};
use super::events::RunStatusEvent;
use super::states::WorkflowRunStatus;

/// Transition table for workflow runs
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn determine_target_state(
        current_state: WorkflowRunStatus,
        event: &RunStatusEvent,
    ) -> StateMachineResult<WorkflowRunStatus> {
        let target = match (current_state, event) {
            (WorkflowRunStatus::Crafting, RunStatusEvent::Crafted) => WorkflowRunStatus::Building,
            (WorkflowRunStatus::Crafting, RunStatusEvent::CraftFailed(_)) => {
                WorkflowRunStatus::Fail
            }

            (WorkflowRunStatus::Building, RunStatusEvent::Settle(status))
                if status.is_terminal() =>
            {
                *status
            }

            (state, RunStatusEvent::Cancel) if !state.is_terminal() => WorkflowRunStatus::Cancelled,

            (state, RunStatusEvent::Restart) if state.is_terminal() => WorkflowRunStatus::Crafting,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from_state.to_string()),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    pub fn source_states(event: &RunStatusEvent) -> Vec<WorkflowRunStatus> {
        WorkflowRunStatus::ALL
            .into_iter()
            .filter(|status| Self::determine_target_state(*status, event).is_ok())
            .collect()
    }
}
