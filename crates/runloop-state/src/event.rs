use crate::{
    AgentRunState, HumanRequest, HumanResponse, MessageRole, ModelUsage, ToolCallPayload,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { text: String },
    Reasoning { text: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Tool,
    Model,
    State,
    Internal,
}

/// Everything an executor reports back to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Done {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason_detail: Option<String>,
        final_state: Box<AgentRunState>,
    },
    WaitingForHuman {
        session_id: String,
        operation_id: String,
        request: HumanRequest,
    },
    ToolPending {
        tool_calls: Vec<ToolCallPayload>,
    },
    HumanResponded {
        session_id: String,
        operation_id: String,
        response: HumanResponse,
        waited_ms: u64,
    },
    MessageCreated {
        message_id: String,
        role: MessageRole,
    },
    LlmStart {
        message_id: String,
        model: String,
        provider: String,
    },
    LlmStream {
        message_id: String,
        chunk: StreamChunk,
    },
    LlmResult {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ModelUsage>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        message_id: String,
        content: String,
        is_error: bool,
        execution_time_ms: u64,
    },
    ToolAborted {
        tool_call_id: String,
        message_id: String,
    },
    CostWarning {
        total: f64,
        limit: f64,
        currency: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::WaitingForHuman { .. } => "waiting_for_human",
            Self::ToolPending { .. } => "tool_pending",
            Self::HumanResponded { .. } => "human_responded",
            Self::MessageCreated { .. } => "message_created",
            Self::LlmStart { .. } => "llm_start",
            Self::LlmStream { .. } => "llm_stream",
            Self::LlmResult { .. } => "llm_result",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolAborted { .. } => "tool_aborted",
            Self::CostWarning { .. } => "cost_warning",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}
