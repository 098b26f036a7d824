mod support;

use runloop_agent::executors::execute;
use runloop_agent::testing::{TestHarness, tool_registry};
use runloop_agent::{RunPhase, StepResult};
use runloop_state::{AgentEvent, FinishPayload, Instruction, RunStatus, finish_reason};

#[tokio::test(flavor = "current_thread")]
async fn finish_completed_with_detail_marks_done_and_keeps_step_count() {
    let harness = TestHarness::new(tool_registry([]));
    let mut state = harness.state("s1");
    state.step_count = 5;
    let before = state.clone();

    let result = execute(
        &Instruction::finish(
            finish_reason::COMPLETED,
            Some("All tasks finished".to_string()),
        ),
        &state,
        &harness.context,
    )
    .await
    .expect("finish should apply");

    assert_eq!(state, before);
    assert_eq!(result.new_state.status, RunStatus::Done);
    assert_eq!(result.new_state.step_count, 5);
    assert_eq!(result.phase, RunPhase::Finished);
    assert!(result.follow_ups.is_empty());
    match result.events.as_slice() {
        [
            AgentEvent::Done {
                reason,
                reason_detail,
                final_state,
            },
        ] => {
            assert_eq!(reason, "completed");
            assert_eq!(reason_detail.as_deref(), Some("All tasks finished"));
            assert_eq!(final_state.as_ref(), &result.new_state);
        }
        other => panic!("expected exactly one done event, got {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn finish_without_detail_leaves_detail_absent() {
    let harness = TestHarness::new(tool_registry([]));
    let state = harness.state("s1");

    let result = execute(
        &Instruction::Finish(FinishPayload {
            reason: finish_reason::MAX_TURNS_REACHED.to_string(),
            reason_detail: None,
        }),
        &state,
        &harness.context,
    )
    .await
    .expect("finish should apply");

    let serialized = serde_json::to_value(&result.events[0]).expect("event should serialize");
    assert!(serialized.get("reason_detail").is_none());
    assert!(matches!(
        &result.events[0],
        AgentEvent::Done { reason_detail: None, .. }
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn finish_touches_neither_store_nor_registry() {
    let harness = TestHarness::new(tool_registry([]));
    let state = harness.state("s1");

    let first = execute(
        &Instruction::finish(finish_reason::COMPLETED, None),
        &state,
        &harness.context,
    )
    .await
    .expect("finish should apply");
    let second = execute(
        &Instruction::finish(finish_reason::COMPLETED, None),
        &state,
        &harness.context,
    )
    .await
    .expect("finish should apply again");

    harness.store.flush().await;
    assert_eq!(harness.persistence.write_count(), 0);
    assert!(harness.operations.is_empty());
    assert_eq!(first.new_state.status, second.new_state.status);
    assert_eq!(first.new_state.messages, second.new_state.messages);
    assert!(first.new_state.last_modified > state.last_modified);
}

/// Blanks every `last_modified` so two results can be compared structurally.
fn without_timestamps(mut result: StepResult) -> StepResult {
    result.new_state.last_modified.clear();
    for event in &mut result.events {
        if let AgentEvent::Done { final_state, .. } = event {
            final_state.last_modified.clear();
        }
    }
    result
}

#[tokio::test(flavor = "current_thread")]
async fn finish_twice_on_same_input_returns_equal_results_apart_from_timestamp() {
    let harness = TestHarness::new(tool_registry([]));
    let mut state = harness.state("s1");
    state.step_count = 3;
    let before = state.clone();
    let instruction = Instruction::finish(finish_reason::ERROR, Some("boom".to_string()));

    let first = execute(&instruction, &state, &harness.context)
        .await
        .expect("finish should apply");
    harness.clock.advance_ms(250);
    let second = execute(&instruction, &state, &harness.context)
        .await
        .expect("finish should apply again");

    assert_eq!(state, before);
    assert!(second.new_state.last_modified > first.new_state.last_modified);
    assert_eq!(without_timestamps(first), without_timestamps(second));
}

#[tokio::test(flavor = "current_thread")]
async fn terminal_state_rejects_everything_but_finish() {
    let harness = TestHarness::new(tool_registry([]));
    let state = harness.state("s1");
    let done = execute(
        &Instruction::finish(finish_reason::COMPLETED, None),
        &state,
        &harness.context,
    )
    .await
    .expect("finish should apply")
    .new_state;

    let error = execute(&Instruction::user_message("again"), &done, &harness.context)
        .await
        .expect_err("terminal state should reject new work");
    assert!(matches!(error, runloop_agent::AgentError::Validation(_)));

    let refinished = execute(
        &Instruction::finish(finish_reason::ERROR, None),
        &done,
        &harness.context,
    )
    .await
    .expect("finish on a terminal state should still apply");
    assert_eq!(refinished.new_state.status, RunStatus::Done);
}
