use runloop_state::{
    AgentRunState, AskHumanPayload, CallToolsBatchPayload, HumanRequest, HumanResponse,
    Instruction, InterventionStatus, MessageRole, ModelSelection, SendMessagePayload,
    ToolCallPayload, finish_reason,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// What the last applied step produced, as seen by a planner.
#[derive(Clone, Debug, PartialEq)]
pub enum RunPhase {
    Init,
    UserInput {
        message_id: String,
    },
    LlmResult {
        message_id: String,
        tool_calls: Vec<ToolCallPayload>,
    },
    ToolResult {
        parent_message_id: String,
    },
    HumanResponded {
        response: HumanResponse,
    },
    WaitingForHuman,
    Interrupted,
    Finished,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::UserInput { .. } => "user_input",
            Self::LlmResult { .. } => "llm_result",
            Self::ToolResult { .. } => "tool_result",
            Self::HumanResponded { .. } => "human_responded",
            Self::WaitingForHuman => "waiting_for_human",
            Self::Interrupted => "interrupted",
            Self::Finished => "finished",
        }
    }
}

/// Decides the next instructions when the driver's queue runs dry.
pub trait Planner: Send + Sync {
    fn next_instructions(&self, state: &AgentRunState, phase: &RunPhase) -> Vec<Instruction>;
}

/// The general chat agent loop: ask the model, run the tools it requests,
/// feed the results back, stop when it answers without tools.
#[derive(Clone, Debug)]
pub struct GeneralPlanner {
    model: Option<ModelSelection>,
    approval_required: HashSet<String>,
}

impl GeneralPlanner {
    pub fn new(model: Option<ModelSelection>) -> Self {
        Self {
            model,
            approval_required: HashSet::new(),
        }
    }

    /// Tools (by `identifier/api_name`) that must be approved before running.
    pub fn require_approval_for<I, S>(mut self, tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approval_required
            .extend(tool_names.into_iter().map(Into::into));
        self
    }

    fn call_model(&self, parent_message_id: Option<String>) -> Instruction {
        match self.model.clone() {
            Some(model) => Instruction::SendMessage(SendMessagePayload {
                role: MessageRole::Assistant,
                content: None,
                model: Some(model),
                parent_message_id,
            }),
            None => Instruction::finish(
                finish_reason::ERROR_RECOVERY,
                Some("no model configured for the general planner".to_string()),
            ),
        }
    }

    fn dispatch_tools(&self, message_id: &str, tool_calls: &[ToolCallPayload]) -> Vec<Instruction> {
        let (needs_approval, executable): (Vec<ToolCallPayload>, Vec<ToolCallPayload>) = tool_calls
            .iter()
            .cloned()
            .partition(|call| self.approval_required.contains(&call.tool_name()));

        let mut instructions = Vec::new();
        match executable.len() {
            0 => {}
            1 => instructions.extend(
                executable
                    .into_iter()
                    .map(|call| Instruction::call_tool(call, message_id)),
            ),
            _ => instructions.push(Instruction::CallToolsBatch(CallToolsBatchPayload {
                tool_calls: executable,
                parent_message_id: message_id.to_string(),
            })),
        }
        if !needs_approval.is_empty() {
            instructions.push(Instruction::AskHuman(AskHumanPayload {
                request: HumanRequest::Approve {
                    tool_calls: needs_approval,
                },
            }));
        }
        instructions
    }
}

impl Planner for GeneralPlanner {
    fn next_instructions(&self, state: &AgentRunState, phase: &RunPhase) -> Vec<Instruction> {
        match phase {
            RunPhase::Init => {
                let parent = state.messages.last().map(|message| message.id.clone());
                vec![self.call_model(parent)]
            }
            RunPhase::UserInput { message_id } => {
                if state.message(message_id).is_none() {
                    return vec![Instruction::finish(
                        finish_reason::ERROR_RECOVERY,
                        Some(format!("user message {message_id} is not in the transcript")),
                    )];
                }
                vec![self.call_model(Some(message_id.clone()))]
            }
            RunPhase::LlmResult {
                message_id,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    return vec![Instruction::finish(
                        finish_reason::COMPLETED,
                        Some("LLM response completed without tool calls".to_string()),
                    )];
                }
                self.dispatch_tools(message_id, tool_calls)
            }
            RunPhase::ToolResult { parent_message_id } => {
                let awaiting_approval: Vec<ToolCallPayload> = state
                    .unresolved_tool_calls()
                    .into_iter()
                    .filter(|call| {
                        state
                            .tool_message_for(&call.id)
                            .is_some_and(|message| {
                                message.plugin_intervention == Some(InterventionStatus::Pending)
                            })
                    })
                    .collect();
                if !awaiting_approval.is_empty() {
                    return vec![Instruction::AskHuman(AskHumanPayload {
                        request: HumanRequest::Approve {
                            tool_calls: awaiting_approval,
                        },
                    })];
                }
                vec![self.call_model(Some(parent_message_id.clone()))]
            }
            RunPhase::HumanResponded { .. } => {
                let parent = state.messages.last().map(|message| message.id.clone());
                vec![self.call_model(parent)]
            }
            RunPhase::Interrupted => vec![Instruction::finish(
                finish_reason::USER_CANCELLED,
                Some("Run interrupted".to_string()),
            )],
            RunPhase::WaitingForHuman | RunPhase::Finished => Vec::new(),
        }
    }
}

/// Replays a fixed list of instructions, then finishes `completed`.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    queue: Mutex<VecDeque<Instruction>>,
}

impl ScriptedPlanner {
    pub fn new(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        Self {
            queue: Mutex::new(instructions.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().expect("scripted planner mutex poisoned").len()
    }
}

impl Planner for ScriptedPlanner {
    fn next_instructions(&self, _state: &AgentRunState, phase: &RunPhase) -> Vec<Instruction> {
        if matches!(phase, RunPhase::WaitingForHuman | RunPhase::Finished) {
            return Vec::new();
        }
        let next = self
            .queue
            .lock()
            .expect("scripted planner mutex poisoned")
            .pop_front();
        vec![next.unwrap_or_else(|| Instruction::finish(finish_reason::COMPLETED, None))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::{Clock, CreateMessageParams, ManualClock};

    fn model() -> ModelSelection {
        ModelSelection {
            model: "gpt-x".to_string(),
            provider: "openai".to_string(),
        }
    }

    fn state() -> AgentRunState {
        let clock = ManualClock::from_millis(0);
        let user = CreateMessageParams::new(MessageRole::User, "hi", "s1").into_message("u1", "t");
        AgentRunState::new("s1", clock.now()).with_messages(vec![user])
    }

    #[test]
    fn general_planner_user_input_expected_assistant_model_call() {
        let planner = GeneralPlanner::new(Some(model()));
        let next = planner.next_instructions(
            &state(),
            &RunPhase::UserInput {
                message_id: "u1".to_string(),
            },
        );
        assert_eq!(
            next,
            vec![Instruction::SendMessage(SendMessagePayload {
                role: MessageRole::Assistant,
                content: None,
                model: Some(model()),
                parent_message_id: Some("u1".to_string()),
            })]
        );
    }

    #[test]
    fn general_planner_llm_result_without_tools_expected_finish_completed() {
        let planner = GeneralPlanner::new(Some(model()));
        let next = planner.next_instructions(
            &state(),
            &RunPhase::LlmResult {
                message_id: "a1".to_string(),
                tool_calls: Vec::new(),
            },
        );
        assert!(matches!(
            next.as_slice(),
            [Instruction::Finish(payload)] if payload.reason == finish_reason::COMPLETED
        ));
    }

    #[test]
    fn general_planner_splits_direct_and_approval_tools() {
        let planner = GeneralPlanner::new(Some(model())).require_approval_for(["fs/write"]);
        let search = ToolCallPayload::new("c1", "web", "search", "{}");
        let fetch = ToolCallPayload::new("c2", "web", "fetch", "{}");
        let write = ToolCallPayload::new("c3", "fs", "write", "{}");

        let next = planner.next_instructions(
            &state(),
            &RunPhase::LlmResult {
                message_id: "a1".to_string(),
                tool_calls: vec![search.clone(), fetch.clone(), write.clone()],
            },
        );
        assert_eq!(next.len(), 2);
        assert_eq!(
            next[0],
            Instruction::CallToolsBatch(CallToolsBatchPayload {
                tool_calls: vec![search, fetch],
                parent_message_id: "a1".to_string(),
            })
        );
        assert_eq!(
            next[1],
            Instruction::AskHuman(AskHumanPayload {
                request: HumanRequest::Approve {
                    tool_calls: vec![write],
                },
            })
        );
    }

    #[test]
    fn general_planner_without_model_expected_error_recovery() {
        let planner = GeneralPlanner::new(None);
        let next = planner.next_instructions(&state(), &RunPhase::Init);
        assert!(matches!(
            next.as_slice(),
            [Instruction::Finish(payload)] if payload.reason == finish_reason::ERROR_RECOVERY
        ));
    }

    #[test]
    fn scripted_planner_replays_then_finishes_completed() {
        let planner = ScriptedPlanner::new([Instruction::user_message("hello")]);
        let first = planner.next_instructions(&state(), &RunPhase::Init);
        assert_eq!(first, vec![Instruction::user_message("hello")]);
        assert_eq!(planner.remaining(), 0);
        let second = planner.next_instructions(&state(), &RunPhase::Init);
        assert_eq!(
            second,
            vec![Instruction::finish(finish_reason::COMPLETED, None)]
        );
    }
}
