use runloop_state::{
    AgentRunState, Clock, CreateMessageParams, Instruction, ManualClock, MessageRole,
    RunCheckpoint, StateError, finish_reason,
};
use tempfile::TempDir;

fn state_under_test() -> AgentRunState {
    let clock = ManualClock::from_millis(1_700_000_000_000);
    let user = CreateMessageParams::new(MessageRole::User, "hello", "session-1")
        .into_message("m1", "2023-11-14T22:13:20.000Z");
    let mut state = AgentRunState::new("session-1", clock.now()).with_messages(vec![user]);
    state.step_count = 3;
    state
}

#[test]
fn checkpoint_save_then_load_preserves_state_and_queue() {
    let temp = TempDir::new().expect("temp dir should create");
    let path = temp.path().join("nested").join("checkpoint.json");
    let checkpoint = RunCheckpoint::new(
        state_under_test(),
        vec![
            Instruction::user_message("next"),
            Instruction::finish(finish_reason::COMPLETED, None),
        ],
    );

    checkpoint.save_to_path(&path).expect("checkpoint should save");
    let loaded = RunCheckpoint::load_from_path(&path).expect("checkpoint should load");

    assert_eq!(loaded, checkpoint);
    assert_eq!(loaded.metadata.session_id, "session-1");
    assert_eq!(loaded.state.step_count, 3);
    assert_eq!(loaded.pending_instructions.len(), 2);
}

#[test]
fn checkpoint_load_missing_file_returns_checkpoint_error() {
    let temp = TempDir::new().expect("temp dir should create");
    let error = RunCheckpoint::load_from_path(&temp.path().join("absent.json"))
        .expect_err("missing checkpoint should fail");
    assert!(matches!(error, StateError::Checkpoint(message) if message.contains("absent.json")));
}

#[test]
fn checkpoint_load_rejects_unknown_schema_version() {
    let temp = TempDir::new().expect("temp dir should create");
    let path = temp.path().join("checkpoint.json");
    let mut checkpoint = RunCheckpoint::new(state_under_test(), Vec::new());
    checkpoint.metadata.schema_version = 99;
    checkpoint.save_to_path(&path).expect("checkpoint should save");

    let error = RunCheckpoint::load_from_path(&path).expect_err("schema 99 should be rejected");
    assert!(error.to_string().contains("schema version 99"));
}
