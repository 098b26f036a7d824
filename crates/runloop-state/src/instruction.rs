use crate::{HumanInteractionKind, MessageRole, ToolCallPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod finish_reason {
    pub const COMPLETED: &str = "completed";
    pub const MAX_TURNS_REACHED: &str = "max_turns_reached";
    pub const ERROR: &str = "error";
    pub const USER_CANCELLED: &str = "user_cancelled";
    pub const COST_LIMIT_EXCEEDED: &str = "cost_limit_exceeded";
    pub const ERROR_RECOVERY: &str = "error_recovery";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub model: String,
    pub provider: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolPayload {
    pub tool_call: ToolCallPayload,
    pub parent_message_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolsBatchPayload {
    pub tool_calls: Vec<ToolCallPayload>,
    pub parent_message_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveAbortedToolsPayload {
    pub tool_calls: Vec<ToolCallPayload>,
    pub parent_message_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HumanRequest {
    Approve {
        tool_calls: Vec<ToolCallPayload>,
    },
    Prompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Select {
        prompt: String,
        options: Vec<SelectOption>,
        #[serde(default)]
        multi: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
}

impl HumanRequest {
    pub fn interaction_kind(&self) -> HumanInteractionKind {
        match self {
            Self::Approve { .. } => HumanInteractionKind::Approval,
            Self::Prompt { .. } => HumanInteractionKind::Prompt,
            Self::Select { .. } => HumanInteractionKind::Select,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HumanResponse {
    Approved,
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Prompted {
        text: String,
    },
    Selected {
        values: Vec<String>,
    },
}

impl HumanResponse {
    /// Whether this response is a valid answer to `request`. Selections must
    /// name offered values, and exactly one of them unless `multi` is set.
    pub fn answers(&self, request: &HumanRequest) -> bool {
        match (self, request) {
            (Self::Approved | Self::Rejected { .. }, HumanRequest::Approve { .. }) => true,
            (Self::Prompted { .. }, HumanRequest::Prompt { .. }) => true,
            (Self::Selected { values }, HumanRequest::Select { options, multi, .. }) => {
                let known = values
                    .iter()
                    .all(|value| options.iter().any(|option| &option.value == value));
                let count_ok = if *multi {
                    !values.is_empty()
                } else {
                    values.len() == 1
                };
                known && count_ok
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected { .. } => "rejected",
            Self::Prompted { .. } => "prompted",
            Self::Selected { .. } => "selected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AskHumanPayload {
    pub request: HumanRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HumanResponsePayload {
    pub response: HumanResponse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishPayload {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
}

/// The closed set of steps a run can take.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    SendMessage(SendMessagePayload),
    CallTool(CallToolPayload),
    CallToolsBatch(CallToolsBatchPayload),
    AskHuman(AskHumanPayload),
    HumanResponse(HumanResponsePayload),
    ResolveAbortedTools(ResolveAbortedToolsPayload),
    Finish(FinishPayload),
}

impl Instruction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::CallTool(_) => "call_tool",
            Self::CallToolsBatch(_) => "call_tools_batch",
            Self::AskHuman(_) => "ask_human",
            Self::HumanResponse(_) => "human_response",
            Self::ResolveAbortedTools(_) => "resolve_aborted_tools",
            Self::Finish(_) => "finish",
        }
    }

    pub fn finish(reason: impl Into<String>, reason_detail: Option<String>) -> Self {
        Self::Finish(FinishPayload {
            reason: reason.into(),
            reason_detail,
        })
    }

    pub fn call_tool(tool_call: ToolCallPayload, parent_message_id: impl Into<String>) -> Self {
        Self::CallTool(CallToolPayload {
            tool_call,
            parent_message_id: parent_message_id.into(),
        })
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Self::SendMessage(SendMessagePayload {
            role: MessageRole::User,
            content: Some(content.into()),
            model: None,
            parent_message_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instruction_serializes_with_type_tag() {
        let instruction = Instruction::finish(finish_reason::COMPLETED, None);
        let value = serde_json::to_value(&instruction).expect("instruction should serialize");
        assert_eq!(value, json!({ "type": "finish", "reason": "completed" }));
    }

    #[test]
    fn instruction_deserializes_call_tool() {
        let instruction: Instruction = serde_json::from_value(json!({
            "type": "call_tool",
            "parent_message_id": "a1",
            "tool_call": {
                "id": "c1",
                "identifier": "web",
                "api_name": "search",
                "arguments": "{}"
            }
        }))
        .expect("call_tool should deserialize");
        assert_eq!(instruction.kind(), "call_tool");
    }

    #[test]
    fn human_response_answers_matching_request_kind_only() {
        let approve = HumanRequest::Approve {
            tool_calls: Vec::new(),
        };
        let prompt = HumanRequest::Prompt {
            prompt: "name?".to_string(),
            metadata: None,
        };
        assert!(HumanResponse::Approved.answers(&approve));
        assert!(HumanResponse::Rejected { reason: None }.answers(&approve));
        assert!(!HumanResponse::Approved.answers(&prompt));
        assert!(
            HumanResponse::Prompted {
                text: "ada".to_string()
            }
            .answers(&prompt)
        );
    }

    #[test]
    fn selected_response_must_use_offered_values() {
        let single = HumanRequest::Select {
            prompt: "pick".to_string(),
            options: vec![
                SelectOption {
                    label: "A".to_string(),
                    value: "a".to_string(),
                },
                SelectOption {
                    label: "B".to_string(),
                    value: "b".to_string(),
                },
            ],
            multi: false,
            metadata: None,
        };
        let pick = |values: &[&str]| HumanResponse::Selected {
            values: values.iter().map(|value| value.to_string()).collect(),
        };

        assert!(pick(&["a"]).answers(&single));
        assert!(!pick(&["a", "b"]).answers(&single));
        assert!(!pick(&["z"]).answers(&single));
        assert!(!pick(&[]).answers(&single));
    }
}
