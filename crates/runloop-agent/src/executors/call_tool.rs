use super::{ABORTED_TOOL_CONTENT, StepResult, require_non_empty, store_patch};
use crate::{
    AgentError, ExecutorContext, RunPhase, ToolError, ToolInvocationContext, ToolOutput,
    ValidationError,
};
use futures::future::join_all;
use runloop_ops::{MetadataPatch, OperationFailure, OperationHandle, OperationType, StartOperation};
use runloop_state::{
    AgentEvent, AgentRunState, CallToolPayload, CallToolsBatchPayload, ErrorKind, Instruction,
    InterventionStatus, Message, MessagePatch, MessageRole, PluginError, ToolAccumulation,
    ToolCallPayload, UsageCounter, finish_reason,
};
use serde_json::{Value, json};
use std::future::Future;
use std::time::{Duration, Instant};

pub const TOOL_ERROR_KIND: &str = "tool_error";

const TOOL_CANCELLED_REASON: &str = "Tool execution cancelled";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ToolCallOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Everything one tool invocation did, ready to be folded into a state.
#[derive(Clone, Debug)]
pub(crate) struct ToolCallRecord {
    pub tool_name: String,
    pub message: Message,
    pub outcome: ToolCallOutcome,
    pub execution_time_ms: u64,
    pub events: Vec<AgentEvent>,
}

pub async fn execute_call_tool(
    payload: &CallToolPayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    validate_tool_call("call_tool", &payload.tool_call, &payload.parent_message_id)?;

    let record = run_tool_call(
        &payload.tool_call,
        &payload.parent_message_id,
        state,
        context,
    )
    .await?;

    let mut new_state = state.next_revision(context.clock.now());
    new_state.step_count += 1;
    let calculated_at = new_state.last_modified.clone();
    let cancelled = record.outcome == ToolCallOutcome::Cancelled;
    let events = record.events.clone();
    let fatal = fold_record(&mut new_state, record, context, &calculated_at);

    let phase = if cancelled {
        RunPhase::Interrupted
    } else {
        RunPhase::ToolResult {
            parent_message_id: payload.parent_message_id.clone(),
        }
    };
    let mut result = StepResult::new(new_state, phase);
    result.events = events;
    result.follow_ups.extend(fatal);
    Ok(result)
}

/// Runs every call concurrently from the same base state, then folds the
/// records in request order as a single step.
pub async fn execute_call_tools_batch(
    payload: &CallToolsBatchPayload,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<StepResult, AgentError> {
    if payload.tool_calls.is_empty() {
        return Err(ValidationError::Invalid {
            instruction: "call_tools_batch",
            message: "tool_calls must not be empty".to_string(),
        }
        .into());
    }
    for tool_call in &payload.tool_calls {
        validate_tool_call("call_tools_batch", tool_call, &payload.parent_message_id)?;
    }

    tracing::debug!(
        session_id = %state.session_id,
        count = payload.tool_calls.len(),
        "tool_batch_started"
    );
    let records = join_all(
        payload
            .tool_calls
            .iter()
            .map(|tool_call| run_tool_call(tool_call, &payload.parent_message_id, state, context)),
    )
    .await;

    let mut new_state = state.next_revision(context.clock.now());
    new_state.step_count += 1;
    let calculated_at = new_state.last_modified.clone();
    let mut events = Vec::new();
    let mut fatal = None;
    let mut cancelled = false;
    for record in records {
        let record = record?;
        cancelled |= record.outcome == ToolCallOutcome::Cancelled;
        events.extend(record.events.iter().cloned());
        let follow_up = fold_record(&mut new_state, record, context, &calculated_at);
        if fatal.is_none() {
            fatal = follow_up;
        }
    }

    let phase = if cancelled {
        RunPhase::Interrupted
    } else {
        RunPhase::ToolResult {
            parent_message_id: payload.parent_message_id.clone(),
        }
    };
    let mut result = StepResult::new(new_state, phase);
    result.events = events;
    result.follow_ups.extend(fatal);
    Ok(result)
}

fn validate_tool_call(
    instruction: &'static str,
    tool_call: &ToolCallPayload,
    parent_message_id: &str,
) -> Result<(), ValidationError> {
    require_non_empty(instruction, "tool_call.id", &tool_call.id)?;
    require_non_empty(instruction, "tool_call.identifier", &tool_call.identifier)?;
    require_non_empty(instruction, "tool_call.api_name", &tool_call.api_name)?;
    require_non_empty(instruction, "parent_message_id", parent_message_id)
}

/// Folds a record into `state`: the tool message replaces its transcript copy
/// (or is appended) and usage and cost grow for every call that actually
/// ran. Returns a `finish(error)` follow-up when the failure is fatal.
fn fold_record(
    state: &mut AgentRunState,
    record: ToolCallRecord,
    context: &ExecutorContext,
    calculated_at: &str,
) -> Option<Instruction> {
    match state.message_mut(&record.message.id) {
        Some(slot) => *slot = record.message.clone(),
        None => state.messages.push(record.message.clone()),
    }

    let success = match &record.outcome {
        ToolCallOutcome::Cancelled => return None,
        ToolCallOutcome::Succeeded => true,
        ToolCallOutcome::Failed(_) => false,
    };
    let accumulated = UsageCounter::accumulate_tool(
        &state.usage,
        &state.cost,
        ToolAccumulation {
            tool_name: &record.tool_name,
            execution_time_ms: record.execution_time_ms,
            success,
            unit_price: context.config.tool_price(&record.tool_name),
        },
        calculated_at,
    );
    state.usage = accumulated.usage;
    state.cost = accumulated.cost;

    match record.outcome {
        ToolCallOutcome::Failed(message) if context.config.is_fatal_tool_failure(&record.tool_name) => {
            Some(Instruction::finish(
                finish_reason::ERROR,
                Some(format!("Tool {} failed: {message}", record.tool_name)),
            ))
        }
        _ => None,
    }
}

/// Runs one tool call under its own `tool_call` operation and records the
/// result on the tool message.
pub(crate) async fn run_tool_call(
    tool_call: &ToolCallPayload,
    parent_message_id: &str,
    state: &AgentRunState,
    context: &ExecutorContext,
) -> Result<ToolCallRecord, AgentError> {
    let tool_name = tool_call.tool_name();
    let handle = context.operations.start_operation(
        StartOperation::new(OperationType::ToolCall)
            .context(context.operation_context(state, Some(parent_message_id)))
            .parent(context.run_operation_id.clone())
            .label(tool_name.clone()),
    );
    tracing::debug!(
        session_id = %state.session_id,
        tool_call_id = %tool_call.id,
        tool_name = %tool_name,
        operation_id = %handle.operation_id,
        "tool_call_started"
    );

    let operation_id = handle.operation_id.clone();
    let result = drive_tool_call(tool_call, tool_name, parent_message_id, state, context, handle).await;
    if let Err(error) = &result {
        if let Err(fail_error) = context.operations.fail_operation(
            &operation_id,
            OperationFailure::new("internal", error.to_string()),
        ) {
            tracing::debug!(error = %fail_error, "tool_call_operation_missing");
        }
    }
    result
}

async fn drive_tool_call(
    tool_call: &ToolCallPayload,
    tool_name: String,
    parent_message_id: &str,
    state: &AgentRunState,
    context: &ExecutorContext,
    handle: OperationHandle,
) -> Result<ToolCallRecord, AgentError> {
    let started = Instant::now();
    let store = context.message_store.as_ref();

    let mut message = match state.tool_message_for(&tool_call.id) {
        Some(existing) => existing.clone(),
        None => {
            let mut params = context.message_params(state, MessageRole::Tool, "");
            params.tool_call_id = Some(tool_call.id.clone());
            params.plugin = Some(tool_call.clone());
            params.parent_id = Some(parent_message_id.to_string());
            store.optimistic_create_message(params).await?
        }
    };
    context
        .operations
        .associate_message_with_operation(&message.id, &handle.operation_id)?;

    let invoked = if handle.abort.is_cancelled() {
        Err(ToolError::Cancelled)
    } else {
        match parse_arguments(&tool_call.arguments) {
            Err(error) => Err(error),
            Ok(arguments) => {
                let invocation = ToolInvocationContext {
                    session_id: state.session_id.clone(),
                    message_id: message.id.clone(),
                    operation_id: handle.operation_id.clone(),
                    cancellation: handle.abort.clone(),
                };
                let call = context.tools.invoke(tool_call, arguments, invocation);
                tokio::select! {
                    biased;
                    _ = handle.abort.cancelled() => Err(ToolError::Cancelled),
                    result = with_timeout(context.config.tool_timeout_ms, call) => result,
                }
            }
        }
    };
    let execution_time_ms = started.elapsed().as_millis() as u64;

    let mut events = Vec::new();
    let outcome = match invoked {
        Ok(output) => {
            record_success(store, &mut message, output).await?;
            context.operations.complete_operation(
                &handle.operation_id,
                Some(MetadataPatch::extra("execution_time_ms", json!(execution_time_ms))),
            )?;
            tracing::debug!(
                tool_call_id = %tool_call.id,
                tool_name = %tool_name,
                execution_time_ms,
                "tool_call_completed"
            );
            events.push(AgentEvent::ToolResult {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_name.clone(),
                message_id: message.id.clone(),
                content: message.content.clone(),
                is_error: false,
                execution_time_ms,
            });
            ToolCallOutcome::Succeeded
        }
        Err(ToolError::Cancelled) => {
            for patch in [
                MessagePatch::Content(ABORTED_TOOL_CONTENT.to_string()),
                MessagePatch::Intervention(InterventionStatus::Aborted),
            ] {
                store_patch(store, &message.id, &patch).await?;
                message.apply(&patch);
            }
            context
                .operations
                .cancel_operation(&handle.operation_id, TOOL_CANCELLED_REASON)?;
            tracing::info!(
                tool_call_id = %tool_call.id,
                tool_name = %tool_name,
                "tool_call_aborted"
            );
            events.push(AgentEvent::ToolAborted {
                tool_call_id: tool_call.id.clone(),
                message_id: message.id.clone(),
            });
            ToolCallOutcome::Cancelled
        }
        Err(error) => {
            let error_message = error.to_string();
            context.operations.fail_operation(
                &handle.operation_id,
                OperationFailure::new(failure_kind(&error), error_message.clone()),
            )?;
            let patch = MessagePatch::PluginError(PluginError {
                kind: TOOL_ERROR_KIND.to_string(),
                message: error_message.clone(),
                body: Some(json!({ "tool": tool_name, "tool_call_id": tool_call.id })),
            });
            store_patch(store, &message.id, &patch).await?;
            message.apply(&patch);
            tracing::warn!(
                tool_call_id = %tool_call.id,
                tool_name = %tool_name,
                error = %error_message,
                "tool_call_failed"
            );
            events.push(AgentEvent::ToolResult {
                tool_call_id: tool_call.id.clone(),
                tool_name: tool_name.clone(),
                message_id: message.id.clone(),
                content: error_message.clone(),
                is_error: true,
                execution_time_ms,
            });
            events.push(AgentEvent::error(
                ErrorKind::Tool,
                format!("{tool_name}: {error_message}"),
            ));
            ToolCallOutcome::Failed(error_message)
        }
    };

    Ok(ToolCallRecord {
        tool_name,
        message,
        outcome,
        execution_time_ms,
        events,
    })
}

async fn record_success(
    store: &dyn crate::MessageStore,
    message: &mut Message,
    output: ToolOutput,
) -> Result<(), AgentError> {
    let mut patches = vec![MessagePatch::Content(output.content)];
    if let Some(plugin_state) = output.state {
        patches.push(MessagePatch::PluginState(plugin_state));
    }
    for patch in patches {
        store_patch(store, &message.id, &patch).await?;
        message.apply(&patch);
    }
    Ok(())
}

fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|error| ToolError::InvalidArguments(error.to_string()))
}

async fn with_timeout<F>(timeout_ms: u64, call: F) -> Result<ToolOutput, ToolError>
where
    F: Future<Output = Result<ToolOutput, ToolError>>,
{
    if timeout_ms == 0 {
        return call.await;
    }
    tokio::time::timeout(Duration::from_millis(timeout_ms), call)
        .await
        .unwrap_or(Err(ToolError::Timeout(timeout_ms)))
}

fn failure_kind(error: &ToolError) -> &'static str {
    match error {
        ToolError::Unknown(_) => "unknown_tool",
        ToolError::InvalidArguments(_) => "invalid_arguments",
        ToolError::Failed(_) => "tool_failed",
        ToolError::Timeout(_) => "timeout",
        ToolError::Cancelled => "cancelled",
    }
}
