use super::errors::{StateMachineError, StateMachineResult};
use super::events::RunJobEvent;
use super::states::RunJobStatus;

/// Transition table for run jobs.
///
/// The store applies transitions as compare-and-swap updates, so the table
/// answers two questions: what a job becomes on an event, and from which
/// statuses the event may be applied at all.
pub struct RunJobStateMachine;

impl RunJobStateMachine {
    /// Determine the target state for an event from the current state
    pub fn determine_target_state(
        current_state: RunJobStatus,
        event: &RunJobEvent,
    ) -> StateMachineResult<RunJobStatus> {
        let target = match (current_state, event) {
            // Dependency gating
            (RunJobStatus::Blocked, RunJobEvent::Unblock) => RunJobStatus::Waiting,
            (RunJobStatus::Blocked, RunJobEvent::SkipForDependency) => RunJobStatus::Skipped,

            // Hatchery claim protocol
            (RunJobStatus::Waiting, RunJobEvent::Claim(_)) => RunJobStatus::Scheduling,
            (RunJobStatus::Scheduling, RunJobEvent::Release) => RunJobStatus::Waiting,
            (RunJobStatus::Scheduling, RunJobEvent::Abandon(_)) => RunJobStatus::Fail,

            // Worker execution
            (RunJobStatus::Scheduling, RunJobEvent::Start(_)) => RunJobStatus::Building,
            (RunJobStatus::Building, RunJobEvent::Succeed) => RunJobStatus::Success,
            (RunJobStatus::Building, RunJobEvent::Fail(_)) => RunJobStatus::Fail,

            // Cancellation from any non-terminal state
            (state, RunJobEvent::Stop) if !state.is_terminal() => RunJobStatus::Stopped,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from_state.to_string()),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Statuses from which the event is a valid transition
    pub fn source_states(event: &RunJobEvent) -> Vec<RunJobStatus> {
        RunJobStatus::ALL
            .into_iter()
            .filter(|status| Self::determine_target_state(*status, event).is_ok())
            .collect()
    }

    /// Single target state of an event, whatever the source
    pub fn target_state(event: &RunJobEvent) -> StateMachineResult<RunJobStatus> {
        let sources = Self::source_states(event);
        match sources.first() {
            Some(source) => Self::determine_target_state(*source, event),
            None => Err(StateMachineError::InvalidTransition {
                from: None,
                event: event.event_type().to_string(),
            }),
        }
    }
}
