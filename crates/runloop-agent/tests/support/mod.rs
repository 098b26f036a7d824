#![allow(dead_code)]

use runloop_agent::testing::TestHarness;
use runloop_agent::{
    MessageStore, RetryBackoffConfig, RetryPolicy, RunEvent, RunEventBus, RunnerConfig,
};
use runloop_state::{
    AgentEvent, AgentRunState, CreateMessageParams, MessagePatch, MessageRole, ModelSelection,
    ToolCallPayload,
};
use std::sync::{Arc, Mutex};

pub fn model() -> ModelSelection {
    ModelSelection {
        model: "gpt-x".to_string(),
        provider: "openai".to_string(),
    }
}

/// Creates a message through the harness store and appends it to `state`.
pub async fn seed_message(
    harness: &TestHarness,
    state: &mut AgentRunState,
    role: MessageRole,
    content: &str,
    tool_calls: Vec<ToolCallPayload>,
) -> String {
    let mut message = harness
        .store
        .optimistic_create_message(CreateMessageParams::new(
            role,
            content,
            state.session_id.clone(),
        ))
        .await
        .expect("seed message should be created");
    for tool_call in tool_calls {
        harness
            .store
            .optimistic_add_tool_to_assistant_message(&message.id, tool_call.clone())
            .await
            .expect("seed tool call should be added");
        message.apply(&MessagePatch::AddToolCall(tool_call));
    }
    let message_id = message.id.clone();
    state.messages.push(message);
    message_id
}

pub fn collecting_bus() -> (RunEventBus, Arc<Mutex<Vec<RunEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback_seen = Arc::clone(&seen);
    let bus = RunEventBus::new();
    bus.on_event(move |event| {
        callback_seen
            .lock()
            .expect("event mutex should lock")
            .push(event.clone());
    });
    (bus, seen)
}

pub fn event_kinds(events: &Arc<Mutex<Vec<RunEvent>>>) -> Vec<&'static str> {
    events
        .lock()
        .expect("event mutex should lock")
        .iter()
        .map(|event| event.event.kind())
        .collect()
}

/// Final states carried by every `done` event seen so far.
pub fn done_states(events: &Arc<Mutex<Vec<RunEvent>>>) -> Vec<AgentRunState> {
    events
        .lock()
        .expect("event mutex should lock")
        .iter()
        .filter_map(|event| match &event.event {
            AgentEvent::Done { final_state, .. } => Some(final_state.as_ref().clone()),
            _ => None,
        })
        .collect()
}

pub fn fast_retry_config() -> RunnerConfig {
    RunnerConfig {
        model_retry: RetryPolicy {
            max_attempts: 3,
            backoff: RetryBackoffConfig {
                initial_delay_ms: 1,
                backoff_factor: 1.0,
                max_delay_ms: 1,
                jitter: false,
            },
        },
        ..RunnerConfig::default()
    }
}
