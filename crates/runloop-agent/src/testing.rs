use crate::{
    ExecutorContext, MemoryMessagePersistence, ModelProvider, OptimisticMessageStore,
    RegisteredTool, RunnerConfig, ToolError, ToolManifest, ToolOutput, ToolRegistry,
};
use runloop_ops::OperationRegistry;
use runloop_state::{AgentRunState, Clock, ManualClock};
use serde_json::Value;
use std::sync::Arc;

pub use crate::replay::{ModelScript, ScriptedModelProvider, failing_tool, static_tool};

/// Start of every scripted clock: 2023-11-14T22:13:20Z.
pub const SCRIPTED_EPOCH_MS: i64 = 1_700_000_000_000;

/// Returns its arguments as content.
pub fn echo_tool(name: &str) -> RegisteredTool {
    RegisteredTool::new(
        ToolManifest::new(name, "echoes its arguments"),
        |arguments: Value, _context| async move { Ok(ToolOutput::text(arguments.to_string())) },
    )
}

/// Runs until its operation is cancelled.
pub fn hanging_tool(name: &str) -> RegisteredTool {
    RegisteredTool::new(
        ToolManifest::new(name, "never finishes on its own"),
        |_, context| async move {
            context.cancellation.cancelled().await;
            Err(ToolError::Cancelled)
        },
    )
}

/// Shared wiring for tests: a manual clock, an in-memory store and registry,
/// and the executor context built from them.
pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub persistence: MemoryMessagePersistence,
    pub store: OptimisticMessageStore,
    pub operations: OperationRegistry,
    pub context: ExecutorContext,
}

impl TestHarness {
    /// Must be called inside a tokio runtime; the store spawns its writer.
    pub fn new(tools: ToolRegistry) -> Self {
        let clock = Arc::new(ManualClock::from_millis(SCRIPTED_EPOCH_MS));
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let persistence = MemoryMessagePersistence::new();
        let store = OptimisticMessageStore::new(Arc::new(persistence.clone()), shared_clock.clone());
        let operations = OperationRegistry::with_clock(shared_clock.clone());
        let context = ExecutorContext::new(Arc::new(store.clone()), Arc::new(tools), shared_clock)
            .with_operations(operations.clone());
        Self {
            clock,
            persistence,
            store,
            operations,
            context,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.context = self.context.with_model(model);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.context = self.context.with_config(config);
        self
    }

    pub fn state(&self, session_id: &str) -> AgentRunState {
        AgentRunState::new(session_id, self.clock.now())
    }
}

pub fn tool_registry(tools: impl IntoIterator<Item = RegisteredTool>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}
