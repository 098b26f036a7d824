use super::{StepResult, patch_transcript};
use crate::{AgentError, ExecutorContext, RunPhase, ValidationError};
use runloop_state::{
    AgentEvent, AgentRunState, HumanRequest, HumanResponse, HumanResponsePayload, Instruction,
    InterventionStatus, MessagePatch, MessageRole, RunStatus, ToolCallPayload, elapsed_ms,
};

pub const DEFAULT_REJECTION_CONTENT: &str = "Tool call rejected by user.";

/// Applies the human's answer to the open request and resumes the run.
pub async fn execute_human_response(
    payload: &HumanResponsePayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    let pending = state
        .pending_human
        .clone()
        .ok_or(ValidationError::NoPendingRequest)?;
    if !payload.response.answers(&pending.request) {
        return Err(ValidationError::ResponseMismatch {
            response: payload.response.kind().to_string(),
        }
        .into());
    }

    // A resumed run may carry a request whose operation lived in another
    // registry.
    if let Err(error) = context
        .operations
        .complete_operation(&pending.operation_id, None)
    {
        tracing::debug!(error = %error, "human_wait_operation_missing");
    }

    let now = context.clock.now();
    let waited_ms = elapsed_ms(&pending.requested_at, now);
    let mut new_state = state.next_revision(now);
    new_state.usage.human_interaction.record_wait(waited_ms);
    new_state.pending_human = None;
    new_state.transition_to(RunStatus::Running)?;
    new_state.step_count += 1;

    let store = context.message_store.as_ref();
    let mut events = vec![AgentEvent::HumanResponded {
        session_id: state.session_id.clone(),
        operation_id: pending.operation_id.clone(),
        response: payload.response.clone(),
        waited_ms,
    }];
    let mut follow_ups = Vec::new();
    let phase = match (&payload.response, &pending.request) {
        (HumanResponse::Approved, HumanRequest::Approve { tool_calls }) => {
            for tool_call in tool_calls {
                let parent_message_id = parent_for(&new_state, tool_call);
                if let Some(message_id) = tool_message_id(&new_state, tool_call) {
                    patch_transcript(
                        store,
                        &mut new_state,
                        &message_id,
                        MessagePatch::Intervention(InterventionStatus::Approved),
                    )
                    .await?;
                }
                follow_ups.push(Instruction::call_tool(tool_call.clone(), parent_message_id));
            }
            RunPhase::HumanResponded {
                response: payload.response.clone(),
            }
        }
        (HumanResponse::Rejected { reason }, HumanRequest::Approve { tool_calls }) => {
            let content = reason
                .clone()
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REJECTION_CONTENT.to_string());
            for tool_call in tool_calls {
                let Some(message_id) = tool_message_id(&new_state, tool_call) else {
                    continue;
                };
                for patch in [
                    MessagePatch::Intervention(InterventionStatus::Rejected),
                    MessagePatch::Content(content.clone()),
                ] {
                    patch_transcript(store, &mut new_state, &message_id, patch).await?;
                }
            }
            RunPhase::HumanResponded {
                response: payload.response.clone(),
            }
        }
        (HumanResponse::Prompted { text }, _) => {
            add_user_answer(&mut new_state, context, text.clone(), &mut events).await?
        }
        (HumanResponse::Selected { values }, _) => {
            add_user_answer(&mut new_state, context, values.join(", "), &mut events).await?
        }
        (response, _) => {
            return Err(ValidationError::ResponseMismatch {
                response: response.kind().to_string(),
            }
            .into());
        }
    };

    tracing::info!(
        session_id = %state.session_id,
        operation_id = %pending.operation_id,
        response = payload.response.kind(),
        waited_ms,
        "human_input_received"
    );

    let mut result = StepResult::new(new_state, phase);
    result.events = events;
    result.follow_ups = follow_ups;
    Ok(result)
}

fn tool_message_id(state: &AgentRunState, tool_call: &ToolCallPayload) -> Option<String> {
    state
        .tool_message_for(&tool_call.id)
        .map(|message| message.id.clone())
}

fn parent_for(state: &AgentRunState, tool_call: &ToolCallPayload) -> String {
    state
        .tool_message_for(&tool_call.id)
        .and_then(|message| message.parent_id.clone())
        .or_else(|| {
            state
                .last_assistant_message()
                .map(|message| message.id.clone())
        })
        .unwrap_or_default()
}

async fn add_user_answer(
    state: &mut AgentRunState,
    context: &ExecutorContext,
    content: String,
    events: &mut Vec<AgentEvent>,
) -> Result<RunPhase, AgentError> {
    let mut params = context.message_params(state, MessageRole::User, content);
    params.parent_id = state.messages.last().map(|message| message.id.clone());
    let message = context.message_store.optimistic_create_message(params).await?;
    let message_id = message.id.clone();
    events.push(AgentEvent::MessageCreated {
        message_id: message_id.clone(),
        role: MessageRole::User,
    });
    state.messages.push(message);
    Ok(RunPhase::UserInput { message_id })
}
