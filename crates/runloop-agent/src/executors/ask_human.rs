use super::{StepResult, patch_transcript, require_non_empty};
use crate::{AgentError, ExecutorContext, RunPhase, ValidationError};
use runloop_ops::{OperationFailure, OperationType, StartOperation};
use runloop_state::{
    AgentEvent, AgentRunState, AskHumanPayload, HumanRequest, InterventionStatus, MessagePatch,
    MessageRole, PendingHumanRequest, RunStatus,
};
use std::collections::HashSet;

/// Opens a human request and parks the run in `waiting_for_human`. Returns
/// immediately; the driver decides how to wait.
pub async fn execute_ask_human(
    payload: &AskHumanPayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    validate_request(&payload.request)?;
    let assistant_id = match &payload.request {
        HumanRequest::Approve { .. } => Some(
            state
                .last_assistant_message()
                .map(|message| message.id.clone())
                .ok_or_else(|| ValidationError::Invalid {
                    instruction: "ask_human",
                    message: "approval requires an assistant message".to_string(),
                })?,
        ),
        HumanRequest::Prompt { .. } | HumanRequest::Select { .. } => None,
    };

    let handle = context.operations.start_operation(
        StartOperation::new(OperationType::HumanWait)
            .context(context.operation_context(state, assistant_id.as_deref()))
            .parent(context.run_operation_id.clone())
            .label(payload.request.interaction_kind().as_str()),
    );

    let mut new_state = state.next_revision(context.clock.now());
    let mut events = Vec::new();
    if let (HumanRequest::Approve { tool_calls }, Some(assistant_id)) =
        (&payload.request, assistant_id.as_deref())
    {
        if let Err(error) = mark_pending(&mut new_state, context, assistant_id, tool_calls).await {
            if let Err(fail_error) = context.operations.fail_operation(
                &handle.operation_id,
                OperationFailure::new("internal", error.to_string()),
            ) {
                tracing::debug!(error = %fail_error, "human_wait_operation_missing");
            }
            return Err(error);
        }
        events.push(AgentEvent::ToolPending {
            tool_calls: tool_calls.clone(),
        });
    }

    new_state
        .usage
        .human_interaction
        .record_request(payload.request.interaction_kind());
    new_state.pending_human = Some(PendingHumanRequest {
        operation_id: handle.operation_id.clone(),
        request: payload.request.clone(),
        requested_at: context.now_timestamp(),
    });
    new_state.transition_to(RunStatus::WaitingForHuman)?;
    new_state.step_count += 1;

    tracing::info!(
        session_id = %state.session_id,
        operation_id = %handle.operation_id,
        request = payload.request.interaction_kind().as_str(),
        "human_input_requested"
    );
    events.insert(
        0,
        AgentEvent::WaitingForHuman {
            session_id: state.session_id.clone(),
            operation_id: handle.operation_id,
            request: payload.request.clone(),
        },
    );

    let mut result = StepResult::new(new_state, RunPhase::WaitingForHuman);
    result.events = events;
    Ok(result)
}

/// Creates (or flips) one `pending` tool message per call awaiting approval.
async fn mark_pending(
    state: &mut AgentRunState,
    context: &ExecutorContext,
    assistant_id: &str,
    tool_calls: &[runloop_state::ToolCallPayload],
) -> Result<(), AgentError> {
    let store = context.message_store.as_ref();
    for tool_call in tool_calls {
        let existing = state.tool_message_for(&tool_call.id).map(|message| message.id.clone());
        match existing {
            Some(message_id) => {
                patch_transcript(
                    store,
                    state,
                    &message_id,
                    MessagePatch::Intervention(InterventionStatus::Pending),
                )
                .await?;
            }
            None => {
                let mut params = context.message_params(state, MessageRole::Tool, "");
                params.tool_call_id = Some(tool_call.id.clone());
                params.plugin = Some(tool_call.clone());
                params.parent_id = Some(assistant_id.to_string());
                params.plugin_intervention = Some(InterventionStatus::Pending);
                let message = store.optimistic_create_message(params).await?;
                state.messages.push(message);
            }
        }
    }
    Ok(())
}

fn validate_request(request: &HumanRequest) -> Result<(), ValidationError> {
    match request {
        HumanRequest::Approve { tool_calls } => {
            if tool_calls.is_empty() {
                return Err(ValidationError::MissingField {
                    instruction: "ask_human",
                    field: "tool_calls",
                });
            }
            for tool_call in tool_calls {
                require_non_empty("ask_human", "tool_calls.id", &tool_call.id)?;
            }
            Ok(())
        }
        HumanRequest::Prompt { prompt, .. } => require_non_empty("ask_human", "prompt", prompt),
        HumanRequest::Select {
            prompt, options, ..
        } => {
            require_non_empty("ask_human", "prompt", prompt)?;
            if options.is_empty() {
                return Err(ValidationError::MissingField {
                    instruction: "ask_human",
                    field: "options",
                });
            }
            let mut seen = HashSet::new();
            for option in options {
                require_non_empty("ask_human", "options.value", &option.value)?;
                if !seen.insert(option.value.as_str()) {
                    return Err(ValidationError::Invalid {
                        instruction: "ask_human",
                        message: format!("duplicate option value `{}`", option.value),
                    });
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::SelectOption;

    fn option(value: &str) -> SelectOption {
        SelectOption {
            label: value.to_uppercase(),
            value: value.to_string(),
        }
    }

    #[test]
    fn validate_request_select_rejects_duplicate_and_missing_options() {
        let duplicate = HumanRequest::Select {
            prompt: "pick".to_string(),
            options: vec![option("a"), option("a")],
            multi: false,
            metadata: None,
        };
        assert!(matches!(
            validate_request(&duplicate),
            Err(ValidationError::Invalid { .. })
        ));

        let empty = HumanRequest::Select {
            prompt: "pick".to_string(),
            options: Vec::new(),
            multi: true,
            metadata: None,
        };
        assert_eq!(
            validate_request(&empty),
            Err(ValidationError::MissingField {
                instruction: "ask_human",
                field: "options",
            })
        );
    }

    #[test]
    fn validate_request_blank_prompt_expected_missing_field() {
        let request = HumanRequest::Prompt {
            prompt: "   ".to_string(),
            metadata: None,
        };
        assert_eq!(
            validate_request(&request),
            Err(ValidationError::MissingField {
                instruction: "ask_human",
                field: "prompt",
            })
        );
    }
}
