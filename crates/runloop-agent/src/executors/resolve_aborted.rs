use super::{StepResult, patch_transcript, require_non_empty};
use crate::{AgentError, ExecutorContext, RunPhase};
use runloop_state::{
    AgentEvent, AgentRunState, InterventionStatus, MessagePatch, MessageRole,
    ResolveAbortedToolsPayload, RunStatus,
};

pub const ABORTED_TOOL_CONTENT: &str = "Tool execution was aborted by user.";

const HUMAN_WAIT_ABORTED_REASON: &str = "Run interrupted while waiting for a human";

/// Gives every listed tool call an `aborted` tool message so the transcript
/// has no dangling calls. A run parked on a human request resumes `running`.
pub async fn execute_resolve_aborted_tools(
    payload: &ResolveAbortedToolsPayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    for tool_call in &payload.tool_calls {
        require_non_empty("resolve_aborted_tools", "tool_calls.id", &tool_call.id)?;
    }

    let store = context.message_store.as_ref();
    let mut new_state = state.next_revision(context.clock.now());
    let mut events = Vec::new();
    for tool_call in &payload.tool_calls {
        let existing = new_state
            .tool_message_for(&tool_call.id)
            .map(|message| message.id.clone());
        let message_id = match existing {
            Some(message_id) => {
                for patch in [
                    MessagePatch::Content(ABORTED_TOOL_CONTENT.to_string()),
                    MessagePatch::Intervention(InterventionStatus::Aborted),
                ] {
                    patch_transcript(store, &mut new_state, &message_id, patch).await?;
                }
                message_id
            }
            None => {
                let mut params =
                    context.message_params(&new_state, MessageRole::Tool, ABORTED_TOOL_CONTENT);
                params.tool_call_id = Some(tool_call.id.clone());
                params.plugin = Some(tool_call.clone());
                params.plugin_intervention = Some(InterventionStatus::Aborted);
                if !payload.parent_message_id.is_empty() {
                    params.parent_id = Some(payload.parent_message_id.clone());
                }
                let message = store.optimistic_create_message(params).await?;
                let message_id = message.id.clone();
                new_state.messages.push(message);
                message_id
            }
        };
        events.push(AgentEvent::ToolAborted {
            tool_call_id: tool_call.id.clone(),
            message_id,
        });
    }

    if new_state.status == RunStatus::WaitingForHuman {
        if let Some(pending) = new_state.pending_human.take() {
            if let Err(error) = context
                .operations
                .cancel_operation(&pending.operation_id, HUMAN_WAIT_ABORTED_REASON)
            {
                tracing::debug!(error = %error, "human_wait_operation_missing");
            }
        }
        new_state.transition_to(RunStatus::Running)?;
    }
    new_state.step_count += 1;

    tracing::info!(
        session_id = %state.session_id,
        count = payload.tool_calls.len(),
        "tool_calls_resolved_as_aborted"
    );
    let mut result = StepResult::new(new_state, RunPhase::Interrupted);
    result.events = events;
    Ok(result)
}
