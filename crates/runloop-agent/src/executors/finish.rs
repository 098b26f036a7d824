use super::StepResult;
use crate::RunPhase;
use chrono::{DateTime, Utc};
use runloop_state::{AgentEvent, AgentRunState, FinishPayload, RunStatus};

/// Ends the run. Touches nothing outside the returned state: the status moves
/// to `done` (an `error` state stays `error`), `last_modified` advances and
/// `step_count` is left alone.
pub fn execute_finish(
    payload: &FinishPayload,
    state: &AgentRunState,
    now: DateTime<Utc>,
) -> StepResult {
    let mut new_state = state.next_revision(now);
    if !new_state.status.is_terminal() {
        new_state.status = RunStatus::Done;
    }

    let mut result = StepResult::new(new_state, RunPhase::Finished);
    result.events.push(AgentEvent::Done {
        reason: payload.reason.clone(),
        reason_detail: payload.reason_detail.clone(),
        final_state: Box::new(result.new_state.clone()),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::{Clock, ManualClock, finish_reason};

    #[test]
    fn finish_on_error_state_keeps_error_status() {
        let clock = ManualClock::from_millis(1_000);
        let mut state = AgentRunState::new("s1", clock.now());
        state.status = RunStatus::Error;

        let result = execute_finish(
            &FinishPayload {
                reason: finish_reason::ERROR.to_string(),
                reason_detail: None,
            },
            &state,
            clock.now(),
        );
        assert_eq!(result.new_state.status, RunStatus::Error);
        assert!(result.new_state.last_modified > state.last_modified);
    }

    #[test]
    fn finish_keeps_empty_reason_and_long_detail_verbatim() {
        let clock = ManualClock::from_millis(1_000);
        let state = AgentRunState::new("s1", clock.now());
        let detail = "x".repeat(10_000);

        let result = execute_finish(
            &FinishPayload {
                reason: String::new(),
                reason_detail: Some(detail.clone()),
            },
            &state,
            clock.now(),
        );
        match &result.events[..] {
            [AgentEvent::Done {
                reason,
                reason_detail,
                ..
            }] => {
                assert_eq!(reason, "");
                assert_eq!(reason_detail.as_deref(), Some(detail.as_str()));
            }
            other => panic!("expected one done event, got {other:?}"),
        }
    }
}
