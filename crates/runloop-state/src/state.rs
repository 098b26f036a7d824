use crate::{
    Cost, HumanRequest, InterventionStatus, Message, MessagePatch, MessageRole, StateError,
    ToolCallPayload, Usage, format_timestamp, next_timestamp,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingForHuman,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForHuman => "waiting_for_human",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn can_transition_to(&self, next: &RunStatus) -> bool {
        if self == next {
            return true;
        }

        match self {
            RunStatus::Running => matches!(
                next,
                RunStatus::WaitingForHuman | RunStatus::Done | RunStatus::Error
            ),
            RunStatus::WaitingForHuman => matches!(
                next,
                RunStatus::Running | RunStatus::Done | RunStatus::Error
            ),
            RunStatus::Done | RunStatus::Error => false,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostLimitAction {
    #[default]
    Stop,
    Warn,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostLimit {
    pub max_total_cost: f64,
    pub currency: String,
    #[serde(default)]
    pub on_exceeded: CostLimitAction,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// The open human request of a paused run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingHumanRequest {
    pub operation_id: String,
    pub request: HumanRequest,
    pub requested_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRunState {
    pub session_id: String,
    pub status: RunStatus,
    pub step_count: u32,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<CostLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_human: Option<PendingHumanRequest>,
    #[serde(default)]
    pub metadata: RunMetadata,
    pub created_at: String,
    pub last_modified: String,
}

impl AgentRunState {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let stamp = format_timestamp(now);
        Self {
            session_id: session_id.into(),
            status: RunStatus::Running,
            step_count: 0,
            messages: Vec::new(),
            usage: Usage::default(),
            cost: Cost::new(stamp.clone()),
            cost_limit: None,
            pending_human: None,
            metadata: RunMetadata::default(),
            created_at: stamp.clone(),
            last_modified: stamp,
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_cost_limit(mut self, cost_limit: CostLimit) -> Self {
        self.cost_limit = Some(cost_limit);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition_to(&mut self, next: RunStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(&next) {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Owned copy of this state with `last_modified` moved strictly forward.
    /// Executors start every new state from here.
    pub fn next_revision(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.last_modified = next_timestamp(&self.last_modified, now);
        next
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    /// Applies `patch` to the transcript copy of a message. Returns false when
    /// the message is not part of this run's transcript.
    pub fn apply_patch(&mut self, message_id: &str, patch: &MessagePatch) -> bool {
        match self.message_mut(message_id) {
            Some(message) => {
                message.apply(patch);
                true
            }
            None => false,
        }
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }

    pub fn tool_message_for(&self, tool_call_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| {
            message.role == MessageRole::Tool && message.tool_call_id.as_deref() == Some(tool_call_id)
        })
    }

    /// Tool calls of the latest assistant message that never produced a
    /// result: no tool message yet, still pending approval, or approved but
    /// not executed.
    pub fn unresolved_tool_calls(&self) -> Vec<ToolCallPayload> {
        let Some(assistant) = self.last_assistant_message() else {
            return Vec::new();
        };
        assistant
            .tool_calls
            .iter()
            .filter(|call| match self.tool_message_for(&call.id) {
                None => true,
                Some(message) => match message.plugin_intervention {
                    Some(InterventionStatus::Pending) => true,
                    Some(InterventionStatus::Approved) => {
                        message.content.is_empty()
                            && message.plugin_error.is_none()
                            && message.plugin_state.is_none()
                    }
                    _ => false,
                },
            })
            .cloned()
            .collect()
    }

    pub fn cost_limit_exceeded(&self) -> Option<&CostLimit> {
        self.cost_limit
            .as_ref()
            .filter(|limit| self.cost.total > limit.max_total_cost)
    }
}
