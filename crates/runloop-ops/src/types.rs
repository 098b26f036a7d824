use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    AgentRun,
    ModelCall,
    ToolCall,
    CreateMessage,
    HumanWait,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRun => "agent_run",
            Self::ModelCall => "model_call",
            Self::ToolCall => "tool_call",
            Self::CreateMessage => "create_message",
            Self::HumanWait => "human_wait",
        }
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl OperationContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Fills every unset field from `parent`. Fields set here win.
    pub fn inherit_from(mut self, parent: &OperationContext) -> Self {
        if self.session_id.is_none() {
            self.session_id = parent.session_id.clone();
        }
        if self.topic_id.is_none() {
            self.topic_id = parent.topic_id.clone();
        }
        if self.thread_id.is_none() {
            self.thread_id = parent.thread_id.clone();
        }
        if self.message_id.is_none() {
            self.message_id = parent.message_id.clone();
        }
        for (key, value) in &parent.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl OperationFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<OperationProgress>,
    #[serde(default)]
    pub is_aborting: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl OperationMetadata {
    pub fn started_at(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            duration_ms: None,
            error: None,
            cancel_reason: None,
            progress: None,
            is_aborting: false,
            extra: BTreeMap::new(),
        }
    }

    pub(crate) fn finish_at(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0) as u64);
    }
}

/// Shallow merge into [`OperationMetadata`]. Unset fields are left alone and
/// `extra` keys overwrite existing ones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataPatch {
    pub error: Option<OperationFailure>,
    pub cancel_reason: Option<String>,
    pub progress: Option<OperationProgress>,
    pub is_aborting: Option<bool>,
    pub extra: BTreeMap<String, Value>,
}

impl MetadataPatch {
    pub fn extra(key: impl Into<String>, value: Value) -> Self {
        let mut patch = Self::default();
        patch.extra.insert(key.into(), value);
        patch
    }

    pub fn apply(self, metadata: &mut OperationMetadata) {
        if let Some(error) = self.error {
            metadata.error = Some(error);
        }
        if let Some(reason) = self.cancel_reason {
            metadata.cancel_reason = Some(reason);
        }
        if let Some(progress) = self.progress {
            metadata.progress = Some(progress);
        }
        if let Some(is_aborting) = self.is_aborting {
            metadata.is_aborting = is_aborting;
        }
        metadata.extra.extend(self.extra);
    }
}

/// Point-in-time view of one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub context: OperationContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<String>,
    #[serde(default)]
    pub child_operation_ids: Vec<String>,
    pub metadata: OperationMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StartOperation {
    pub op_type: OperationType,
    pub context: OperationContext,
    pub parent_operation_id: Option<String>,
    pub metadata: MetadataPatch,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl StartOperation {
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            context: OperationContext::default(),
            parent_operation_id: None,
            metadata: MetadataPatch::default(),
            label: None,
            description: None,
        }
    }

    pub fn context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn parent(mut self, parent_operation_id: Option<String>) -> Self {
        self.parent_operation_id = parent_operation_id;
        self
    }

    pub fn metadata(mut self, metadata: MetadataPatch) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct OperationHandle {
    pub operation_id: String,
    pub abort: CancellationToken,
}

/// Passed to a cancel handler when its operation is cancelled.
#[derive(Clone, Debug, PartialEq)]
pub struct CancelContext {
    pub operation_id: String,
    pub op_type: OperationType,
    pub reason: String,
    pub metadata: OperationMetadata,
}

/// Selects running operations. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationFilter {
    pub op_types: Vec<OperationType>,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
}

impl OperationFilter {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, operation: &Operation) -> bool {
        fn field_matches(expected: &Option<String>, actual: &Option<String>) -> bool {
            expected.is_none() || expected == actual
        }

        (self.op_types.is_empty() || self.op_types.contains(&operation.op_type))
            && field_matches(&self.session_id, &operation.context.session_id)
            && field_matches(&self.topic_id, &operation.context.topic_id)
            && field_matches(&self.thread_id, &operation.context.thread_id)
            && field_matches(&self.message_id, &operation.context.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inherit_from_keeps_explicit_fields() {
        let mut parent = OperationContext::for_session("s1").with_message("m-parent");
        parent.topic_id = Some("t1".to_string());
        parent.extra.insert("agent".to_string(), json!("a1"));
        parent.extra.insert("shared".to_string(), json!("parent"));

        let mut child = OperationContext::default().with_message("m-child");
        child.extra.insert("shared".to_string(), json!("child"));
        let merged = child.inherit_from(&parent);

        assert_eq!(merged.session_id.as_deref(), Some("s1"));
        assert_eq!(merged.topic_id.as_deref(), Some("t1"));
        assert_eq!(merged.message_id.as_deref(), Some("m-child"));
        assert_eq!(merged.extra.get("shared"), Some(&json!("child")));
        assert_eq!(merged.extra.get("agent"), Some(&json!("a1")));
    }

    #[test]
    fn metadata_patch_merges_shallowly() {
        let mut metadata = OperationMetadata::started_at(Utc::now());
        metadata.extra.insert("keep".to_string(), json!(1));
        MetadataPatch {
            is_aborting: Some(true),
            ..MetadataPatch::extra("added", json!(2))
        }
        .apply(&mut metadata);

        assert!(metadata.is_aborting);
        assert_eq!(metadata.extra.len(), 2);
        assert!(metadata.error.is_none());
    }
}
