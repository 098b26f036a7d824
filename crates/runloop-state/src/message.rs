use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

fn default_tool_type() -> String {
    "default".to_string()
}

/// A tool call as requested by the model: `identifier` names the tool
/// package, `api_name` the function inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub identifier: String,
    pub api_name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
}

impl ToolCallPayload {
    pub fn new(
        id: impl Into<String>,
        identifier: impl Into<String>,
        api_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            api_name: api_name.into(),
            arguments: arguments.into(),
            tool_type: default_tool_type(),
        }
    }

    pub fn tool_name(&self) -> String {
        format!("{}/{}", self.identifier, self.api_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    Approved,
    Rejected,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl PluginError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            body: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<ToolCallPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_error: Option<PluginError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_intervention: Option<InterventionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub created_at: String,
}

/// One optimistic mutation of an existing message. The message store and the
/// executors apply the same patch, so the run transcript and the store agree.
#[derive(Clone, Debug, PartialEq)]
pub enum MessagePatch {
    Content(String),
    Reasoning(String),
    PluginState(Value),
    PluginError(PluginError),
    AddToolCall(ToolCallPayload),
    Intervention(InterventionStatus),
}

impl Message {
    pub fn apply(&mut self, patch: &MessagePatch) {
        match patch {
            MessagePatch::Content(content) => self.content = content.clone(),
            MessagePatch::Reasoning(reasoning) => self.reasoning = Some(reasoning.clone()),
            MessagePatch::PluginState(state) => self.plugin_state = Some(state.clone()),
            MessagePatch::PluginError(error) => self.plugin_error = Some(error.clone()),
            MessagePatch::AddToolCall(call) => {
                if !self.tool_calls.iter().any(|existing| existing.id == call.id) {
                    self.tool_calls.push(call.clone());
                }
            }
            MessagePatch::Intervention(status) => self.plugin_intervention = Some(*status),
        }
    }

    pub fn is_error(&self) -> bool {
        self.plugin_error.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateMessageParams {
    pub role: MessageRole,
    pub content: String,
    pub session_id: String,
    pub topic_id: Option<String>,
    pub thread_id: Option<String>,
    pub parent_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub plugin: Option<ToolCallPayload>,
    pub plugin_intervention: Option<InterventionStatus>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl CreateMessageParams {
    pub fn new(role: MessageRole, content: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            session_id: session_id.into(),
            topic_id: None,
            thread_id: None,
            parent_id: None,
            tool_call_id: None,
            plugin: None,
            plugin_intervention: None,
            model: None,
            provider: None,
        }
    }

    /// Parameters for the tool message answering `tool_call`.
    pub fn tool_result(tool_call: &ToolCallPayload, session_id: impl Into<String>) -> Self {
        let mut params = Self::new(MessageRole::Tool, String::new(), session_id);
        params.tool_call_id = Some(tool_call.id.clone());
        params.plugin = Some(tool_call.clone());
        params
    }

    pub fn into_message(self, id: impl Into<String>, created_at: impl Into<String>) -> Message {
        Message {
            id: id.into(),
            role: self.role,
            content: self.content,
            parent_id: self.parent_id,
            tool_call_id: self.tool_call_id,
            tool_calls: Vec::new(),
            plugin: self.plugin,
            plugin_state: None,
            plugin_error: None,
            plugin_intervention: self.plugin_intervention,
            reasoning: None,
            model: self.model,
            provider: self.provider,
            created_at: created_at.into(),
        }
    }
}
