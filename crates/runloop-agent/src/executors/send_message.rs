use super::{StepResult, require_non_empty};
use crate::{AgentError, ExecutorContext, ModelRequest, RunPhase, ValidationError, spawn_model_call};
use runloop_ops::{MetadataPatch, OperationFailure, OperationType, StartOperation};
use runloop_state::{
    AgentEvent, AgentRunState, LlmAccumulation, Message, MessagePatch, MessageRole,
    ModelSelection, ModelUsage, PluginError, SendMessagePayload, UsageCounter,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub const MODEL_ERROR_KIND: &str = "model_error";

pub async fn execute_send_message(
    payload: &SendMessagePayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    match payload.role {
        MessageRole::Tool => Err(ValidationError::Invalid {
            instruction: "send_message",
            message: "tool messages are only created by call_tool".to_string(),
        }
        .into()),
        MessageRole::User | MessageRole::System => {
            let content = payload
                .content
                .as_deref()
                .ok_or(ValidationError::MissingField {
                    instruction: "send_message",
                    field: "content",
                })?;
            require_non_empty("send_message", "content", content)?;
            let message = create_message(payload, state, context, content).await?;
            let phase = match payload.role {
                MessageRole::User => RunPhase::UserInput {
                    message_id: message.id.clone(),
                },
                _ => RunPhase::Init,
            };
            Ok(append_message(state, context, message, phase))
        }
        MessageRole::Assistant => {
            let model = payload
                .model
                .clone()
                .or_else(|| match payload.content {
                    None => context.config.default_model.clone(),
                    Some(_) => None,
                });
            match (model, payload.content.as_deref()) {
                (Some(model), _) => call_model(payload, &model, state, context).await,
                (None, Some(content)) => {
                    let message = create_message(payload, state, context, content).await?;
                    let phase = RunPhase::LlmResult {
                        message_id: message.id.clone(),
                        tool_calls: Vec::new(),
                    };
                    Ok(append_message(state, context, message, phase))
                }
                (None, None) => Err(ValidationError::MissingField {
                    instruction: "send_message",
                    field: "content",
                }
                .into()),
            }
        }
    }
}

async fn create_message(
    payload: &SendMessagePayload,
    state: &AgentRunState,
    context: &ExecutorContext,
    content: &str,
) -> Result<Message, AgentError> {
    let mut params = context.message_params(state, payload.role, content);
    params.parent_id = payload.parent_message_id.clone();
    context.message_store.optimistic_create_message(params).await
}

fn append_message(
    state: &AgentRunState,
    context: &ExecutorContext,
    message: Message,
    phase: RunPhase,
) -> StepResult {
    let mut new_state = state.next_revision(context.clock.now());
    new_state.step_count += 1;
    let event = AgentEvent::MessageCreated {
        message_id: message.id.clone(),
        role: message.role,
    };
    new_state.messages.push(message);
    let mut result = StepResult::new(new_state, phase);
    result.events.push(event);
    result
}

/// Assistant turns whose model call failed stay in the transcript but are not
/// sent back to the model.
pub(crate) fn is_failed_turn(message: &Message) -> bool {
    message.role == MessageRole::Assistant
        && message
            .plugin_error
            .as_ref()
            .is_some_and(|error| error.kind == MODEL_ERROR_KIND)
}

/// Appends a failed turn to the transcript without counting a step.
pub(crate) fn carry_failed_turn(
    state: &AgentRunState,
    message: Message,
    now: DateTime<Utc>,
) -> AgentRunState {
    let mut carried = state.next_revision(now);
    carried.messages.push(message);
    carried
}

/// Streams one assistant turn from the model provider into a fresh message.
async fn call_model(
    payload: &SendMessagePayload,
    model: &ModelSelection,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    let provider = context.model.clone().ok_or_else(|| {
        AgentError::InvalidConfiguration(
            "send_message with a model requires a model provider".to_string(),
        )
    })?;

    let mut params = context.message_params(state, MessageRole::Assistant, "");
    params.parent_id = payload
        .parent_message_id
        .clone()
        .or_else(|| state.messages.last().map(|message| message.id.clone()));
    params.model = Some(model.model.clone());
    params.provider = Some(model.provider.clone());
    let mut message = context.message_store.optimistic_create_message(params).await?;

    let mut events = vec![
        AgentEvent::MessageCreated {
            message_id: message.id.clone(),
            role: MessageRole::Assistant,
        },
        AgentEvent::LlmStart {
            message_id: message.id.clone(),
            model: model.model.clone(),
            provider: model.provider.clone(),
        },
    ];

    let handle = context.operations.start_operation(
        StartOperation::new(OperationType::ModelCall)
            .context(context.operation_context(state, Some(&message.id)))
            .parent(context.run_operation_id.clone())
            .label(format!("{}/{}", model.provider, model.model)),
    );
    tracing::debug!(
        session_id = %state.session_id,
        message_id = %message.id,
        operation_id = %handle.operation_id,
        model = %model.model,
        provider = %model.provider,
        "model_call_started"
    );

    let request = ModelRequest {
        session_id: state.session_id.clone(),
        model: model.clone(),
        messages: state
            .messages
            .iter()
            .filter(|message| !is_failed_turn(message))
            .cloned()
            .collect(),
        tools: context.tools.manifests(),
    };
    let started = Instant::now();
    let call = spawn_model_call(
        provider,
        Arc::clone(&context.message_store),
        request,
        message.id.clone(),
        handle.operation_id.clone(),
        handle.abort.clone(),
    );
    let operation_id = call.operation_id.clone();

    let outcome = match call.join().await {
        Ok(outcome) => outcome,
        Err(error) => {
            if let Err(fail_error) = context.operations.fail_operation(
                &operation_id,
                OperationFailure::new(MODEL_ERROR_KIND, error.to_string()),
            ) {
                tracing::debug!(error = %fail_error, "model_call_operation_missing");
            }
            let plugin_error = PluginError::new(MODEL_ERROR_KIND, error.to_string());
            if let Err(annotate_error) = context
                .message_store
                .optimistic_update_message_plugin_error(&message.id, plugin_error.clone())
                .await
            {
                tracing::warn!(error = %annotate_error, "model_error_annotation_failed");
            }
            message.apply(&MessagePatch::PluginError(plugin_error));
            tracing::warn!(
                session_id = %state.session_id,
                message_id = %message.id,
                error = %error,
                retryable = error.is_retryable(),
                "model_call_failed"
            );
            return Err(AgentError::FailedTurn {
                message: Box::new(message),
                source: Box::new(error),
            });
        }
    };
    let processing_time_ms = started.elapsed().as_millis() as u64;

    for patch in &outcome.patches {
        message.apply(patch);
    }
    let mut new_state = state.next_revision(context.clock.now());
    new_state.step_count += 1;
    let message_id = message.id.clone();
    new_state.messages.push(message);

    events.extend(outcome.chunks.iter().cloned().map(|chunk| AgentEvent::LlmStream {
        message_id: message_id.clone(),
        chunk,
    }));

    if outcome.cancelled {
        tracing::info!(
            session_id = %state.session_id,
            message_id = %message_id,
            "model_call_interrupted"
        );
        let mut result = StepResult::new(new_state, RunPhase::Interrupted);
        result.events = events;
        return Ok(result);
    }

    context.operations.complete_operation(
        &operation_id,
        Some(MetadataPatch::extra(
            "processing_time_ms",
            json!(processing_time_ms),
        )),
    )?;

    let call_usage = outcome.usage.clone().unwrap_or_else(ModelUsage::default);
    let calculated_at = new_state.last_modified.clone();
    let accumulated = UsageCounter::accumulate_llm(
        &new_state.usage,
        &new_state.cost,
        LlmAccumulation {
            model: &model.model,
            provider: &model.provider,
            usage: &call_usage,
            processing_time_ms,
        },
        &calculated_at,
    );
    new_state.usage = accumulated.usage;
    new_state.cost = accumulated.cost;

    events.push(AgentEvent::LlmResult {
        message_id: message_id.clone(),
        content: outcome.content.clone(),
        reasoning: outcome.reasoning.clone(),
        tool_calls: outcome.tool_calls.clone(),
        usage: outcome.usage.clone(),
    });
    tracing::debug!(
        session_id = %state.session_id,
        message_id = %message_id,
        tool_calls = outcome.tool_calls.len(),
        processing_time_ms,
        "model_call_completed"
    );

    let mut result = StepResult::new(
        new_state,
        RunPhase::LlmResult {
            message_id,
            tool_calls: outcome.tool_calls,
        },
    );
    result.events = events;
    Ok(result)
}

