//! Instruction executors and the run driver for tool-using agents.
//!
//! A run is a sequence of [`runloop_state::Instruction`]s applied one at a
//! time by [`AgentRunner`]. Each instruction is handled by an executor in
//! [`executors`] that reads the current [`runloop_state::AgentRunState`] and
//! returns a new one plus the events it produced. Side effects go through the
//! [`MessageStore`], the [`runloop_ops::OperationRegistry`], the
//! [`ToolRuntime`] and the [`ModelProvider`].

pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod executors;
pub mod model;
pub mod planner;
pub mod replay;
pub mod retry;
pub mod runner;
pub mod store;
pub mod testing;
pub mod tools;

pub use config::{RunnerConfig, ToolFailurePolicy};
pub use context::ExecutorContext;
pub use errors::{AgentError, ModelError, ToolError, ValidationError};
pub use events::{RunEvent, RunEventBus, RunEventReceiver};
pub use executors::StepResult;
pub use model::{
    ModelCallHandle, ModelCallResult, ModelChunk, ModelProvider, ModelRequest, ModelStream,
    spawn_model_call,
};
pub use planner::{GeneralPlanner, Planner, RunPhase, ScriptedPlanner};
pub use replay::{ModelScript, ScriptedModelProvider};
pub use retry::{RetryBackoffConfig, RetryPolicy};
pub use runner::{AgentRunner, RunCancelHandle, RunOutcome, USER_CANCELLED_DETAIL};
pub use store::{
    MemoryMessagePersistence, MessagePersistence, MessageStore, OptimisticMessageStore,
    PersistenceWrite,
};
pub use tools::{
    RegisteredTool, ToolExecutor, ToolFuture, ToolInvocationContext, ToolManifest, ToolOutput,
    ToolRegistry, ToolRuntime,
};
