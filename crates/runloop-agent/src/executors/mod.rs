//! One executor per instruction kind.
//!
//! Every executor reads the current state by shared reference and returns a
//! fresh [`StepResult`]; the input state is never mutated. Side effects go
//! through the message store, the operation registry and the tool or model
//! seams on the [`ExecutorContext`].

mod ask_human;
mod call_tool;
mod finish;
mod human_response;
mod resolve_aborted;
mod send_message;

pub use ask_human::execute_ask_human;
pub use call_tool::{TOOL_ERROR_KIND, execute_call_tool, execute_call_tools_batch};
pub use finish::execute_finish;
pub use human_response::{DEFAULT_REJECTION_CONTENT, execute_human_response};
pub(crate) use send_message::carry_failed_turn;
pub use resolve_aborted::{ABORTED_TOOL_CONTENT, execute_resolve_aborted_tools};
pub use send_message::{MODEL_ERROR_KIND, execute_send_message};

use crate::{AgentError, ExecutorContext, MessageStore, RunPhase, ValidationError};
use runloop_state::{
    AgentEvent, AgentRunState, CostLimitAction, Instruction, MessagePatch, RunStatus,
    finish_reason,
};

/// Outcome of one applied instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub new_state: AgentRunState,
    pub events: Vec<AgentEvent>,
    pub phase: RunPhase,
    /// Instructions the driver applies next, ahead of anything queued.
    pub follow_ups: Vec<Instruction>,
}

impl StepResult {
    pub fn new(new_state: AgentRunState, phase: RunPhase) -> Self {
        Self {
            new_state,
            events: Vec::new(),
            phase,
            follow_ups: Vec::new(),
        }
    }
}

/// Dispatches `instruction` to its executor.
pub async fn execute(
    instruction: &Instruction,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    validate(instruction, state)?;
    tracing::debug!(
        session_id = %state.session_id,
        instruction = instruction.kind(),
        step = state.step_count,
        "instruction_started"
    );

    let mut result = match instruction {
        Instruction::Finish(payload) => {
            return Ok(execute_finish(payload, state, context.clock.now()));
        }
        Instruction::SendMessage(payload) => execute_send_message(payload, state, context).await?,
        Instruction::CallTool(payload) => execute_call_tool(payload, state, context).await?,
        Instruction::CallToolsBatch(payload) => {
            execute_call_tools_batch(payload, state, context).await?
        }
        Instruction::AskHuman(payload) => execute_ask_human(payload, state, context).await?,
        Instruction::HumanResponse(payload) => {
            execute_human_response(payload, state, context).await?
        }
        Instruction::ResolveAbortedTools(payload) => {
            execute_resolve_aborted_tools(payload, state, context).await?
        }
    };
    apply_cost_limit(state, &mut result);
    Ok(result)
}

/// Checks that `instruction` may be applied to `state`. Runs before any side
/// effect.
pub fn validate(instruction: &Instruction, state: &AgentRunState) -> Result<(), ValidationError> {
    let kind = instruction.kind();
    match (state.status, instruction) {
        (_, Instruction::Finish(_)) => Ok(()),
        (RunStatus::Done | RunStatus::Error, _) => Err(ValidationError::WrongStatus {
            instruction: kind,
            status: state.status.to_string(),
        }),
        (RunStatus::WaitingForHuman, Instruction::HumanResponse(payload)) => {
            let pending = state
                .pending_human
                .as_ref()
                .ok_or(ValidationError::NoPendingRequest)?;
            if payload.response.answers(&pending.request) {
                Ok(())
            } else {
                Err(ValidationError::ResponseMismatch {
                    response: payload.response.kind().to_string(),
                })
            }
        }
        (RunStatus::WaitingForHuman, Instruction::ResolveAbortedTools(_)) => Ok(()),
        (RunStatus::WaitingForHuman, _) => Err(ValidationError::WrongStatus {
            instruction: kind,
            status: state.status.to_string(),
        }),
        (RunStatus::Running, Instruction::HumanResponse(_)) => {
            Err(ValidationError::NoPendingRequest)
        }
        (RunStatus::Running, _) => Ok(()),
    }
}

fn apply_cost_limit(previous: &AgentRunState, result: &mut StepResult) {
    if result.new_state.is_terminal() || result.new_state.cost.total <= previous.cost.total {
        return;
    }
    let Some(limit) = result.new_state.cost_limit_exceeded().cloned() else {
        return;
    };
    let total = result.new_state.cost.total;
    tracing::warn!(
        session_id = %result.new_state.session_id,
        total,
        limit = limit.max_total_cost,
        "cost_limit_exceeded"
    );
    match limit.on_exceeded {
        CostLimitAction::Stop => result.follow_ups.insert(
            0,
            Instruction::finish(
                finish_reason::COST_LIMIT_EXCEEDED,
                Some(format!(
                    "Cost {total:.4} {} exceeded limit {:.4}",
                    limit.currency, limit.max_total_cost
                )),
            ),
        ),
        CostLimitAction::Warn => result.events.push(AgentEvent::CostWarning {
            total,
            limit: limit.max_total_cost,
            currency: limit.currency,
        }),
    }
}

/// Sends `patch` to the store through the matching optimistic update.
pub(crate) async fn store_patch(
    store: &dyn MessageStore,
    message_id: &str,
    patch: &MessagePatch,
) -> Result<(), AgentError> {
    match patch {
        MessagePatch::Content(content) => {
            store
                .optimistic_update_message_content(message_id, content.clone())
                .await
        }
        MessagePatch::Reasoning(reasoning) => {
            store
                .optimistic_update_message_reasoning(message_id, reasoning.clone())
                .await
        }
        MessagePatch::PluginState(plugin_state) => {
            store
                .optimistic_update_message_plugin(message_id, plugin_state.clone())
                .await
        }
        MessagePatch::PluginError(error) => {
            store
                .optimistic_update_message_plugin_error(message_id, error.clone())
                .await
        }
        MessagePatch::AddToolCall(tool_call) => {
            store
                .optimistic_add_tool_to_assistant_message(message_id, tool_call.clone())
                .await
        }
        MessagePatch::Intervention(status) => {
            store
                .optimistic_update_message_intervention(message_id, *status)
                .await
        }
    }
}

/// Applies `patch` to the store and to the transcript copy in `state`.
pub(crate) async fn patch_transcript(
    store: &dyn MessageStore,
    state: &mut AgentRunState,
    message_id: &str,
    patch: MessagePatch,
) -> Result<(), AgentError> {
    store_patch(store, message_id, &patch).await?;
    state.apply_patch(message_id, &patch);
    Ok(())
}

pub(crate) fn require_non_empty(
    instruction: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { instruction, field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::{
        Clock, HumanRequest, HumanResponse, HumanResponsePayload, ManualClock,
        PendingHumanRequest,
    };

    fn waiting_state() -> AgentRunState {
        let clock = ManualClock::from_millis(0);
        let mut state = AgentRunState::new("s1", clock.now());
        state.status = RunStatus::WaitingForHuman;
        state.pending_human = Some(PendingHumanRequest {
            operation_id: "op_1".to_string(),
            request: HumanRequest::Prompt {
                prompt: "name?".to_string(),
                metadata: None,
            },
            requested_at: state.created_at.clone(),
        });
        state
    }

    #[test]
    fn validate_waiting_state_rejects_tool_calls_and_mismatched_answers() {
        let state = waiting_state();
        let error = validate(&Instruction::user_message("hi"), &state)
            .expect_err("send_message should be rejected while waiting");
        assert!(matches!(error, ValidationError::WrongStatus { .. }));

        let approve = Instruction::HumanResponse(HumanResponsePayload {
            response: HumanResponse::Approved,
        });
        assert_eq!(
            validate(&approve, &state),
            Err(ValidationError::ResponseMismatch {
                response: "approved".to_string()
            })
        );

        let prompted = Instruction::HumanResponse(HumanResponsePayload {
            response: HumanResponse::Prompted {
                text: "ada".to_string(),
            },
        });
        assert_eq!(validate(&prompted, &state), Ok(()));
    }

    #[test]
    fn validate_terminal_state_allows_only_finish() {
        let mut state = waiting_state();
        state.status = RunStatus::Done;
        assert!(validate(&Instruction::user_message("hi"), &state).is_err());
        assert!(validate(&Instruction::finish(finish_reason::COMPLETED, None), &state).is_ok());
    }

    #[test]
    fn validate_running_state_without_request_rejects_human_response() {
        let mut state = waiting_state();
        state.status = RunStatus::Running;
        state.pending_human = None;
        let response = Instruction::HumanResponse(HumanResponsePayload {
            response: HumanResponse::Approved,
        });
        assert_eq!(
            validate(&response, &state),
            Err(ValidationError::NoPendingRequest)
        );
    }
}
