use crate::{MessageStore, ModelProvider, RunnerConfig, ToolRuntime};
use runloop_ops::{OperationContext, OperationRegistry};
use runloop_state::{AgentRunState, Clock, CreateMessageParams, MessageRole, format_timestamp};
use std::sync::Arc;

/// Collaborators shared by every executor of a run.
#[derive(Clone)]
pub struct ExecutorContext {
    pub message_store: Arc<dyn MessageStore>,
    pub operations: OperationRegistry,
    pub tools: Arc<dyn ToolRuntime>,
    pub model: Option<Arc<dyn ModelProvider>>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<RunnerConfig>,
    /// New operations nest under this one, so cancelling the run cascades.
    pub run_operation_id: Option<String>,
}

impl ExecutorContext {
    pub fn new(
        message_store: Arc<dyn MessageStore>,
        tools: Arc<dyn ToolRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            message_store,
            operations: OperationRegistry::with_clock(Arc::clone(&clock)),
            tools,
            model: None,
            clock,
            config: Arc::new(RunnerConfig::default()),
            run_operation_id: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_operations(mut self, operations: OperationRegistry) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_run_operation(mut self, run_operation_id: Option<String>) -> Self {
        self.run_operation_id = run_operation_id;
        self
    }

    pub fn now_timestamp(&self) -> String {
        format_timestamp(self.clock.now())
    }

    /// Operation context carrying the run's correlation ids.
    pub fn operation_context(&self, state: &AgentRunState, message_id: Option<&str>) -> OperationContext {
        let mut context = OperationContext::for_session(state.session_id.clone());
        context.topic_id = state.metadata.topic_id.clone();
        context.thread_id = state.metadata.thread_id.clone();
        context.message_id = message_id.map(str::to_string);
        context
    }

    /// Create-message parameters tagged with the run's session, topic and thread.
    pub fn message_params(
        &self,
        state: &AgentRunState,
        role: MessageRole,
        content: impl Into<String>,
    ) -> CreateMessageParams {
        let mut params = CreateMessageParams::new(role, content, state.session_id.clone());
        params.topic_id = state.metadata.topic_id.clone();
        params.thread_id = state.metadata.thread_id.clone();
        params
    }
}
