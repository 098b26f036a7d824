use crate::{AgentError, MessageStore, ModelError, ToolManifest};
use futures::StreamExt;
use futures::stream::BoxStream;
use runloop_state::{Message, MessagePatch, ModelSelection, ModelUsage, StreamChunk, ToolCallPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub session_id: String,
    pub model: ModelSelection,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolManifest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelChunk {
    Text { text: String },
    Reasoning { text: String },
    ToolCalls { tool_calls: Vec<ToolCallPayload> },
    Usage { usage: ModelUsage },
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk, ModelError>>;

/// Streaming model client. The stream should end promptly once `cancel`
/// fires; the caller stops polling it either way.
pub trait ModelProvider: Send + Sync {
    fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> ModelStream;
}

/// Everything one streamed model call produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCallResult {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallPayload>,
    pub usage: Option<ModelUsage>,
    pub chunks: Vec<StreamChunk>,
    /// Patches already applied to the stored message, in order.
    pub patches: Vec<MessagePatch>,
    pub cancelled: bool,
}

/// A model call running on its own task. Awaiting `completion` yields the
/// accumulated result once the stream ends or the operation is aborted.
pub struct ModelCallHandle {
    pub operation_id: String,
    pub abort: CancellationToken,
    pub completion: JoinHandle<Result<ModelCallResult, AgentError>>,
}

impl ModelCallHandle {
    pub async fn join(self) -> Result<ModelCallResult, AgentError> {
        self.completion
            .await
            .map_err(|error| AgentError::Internal(format!("model call task failed: {error}")))?
    }
}

/// Spawns the streaming task for an assistant message. Text deltas and tool
/// calls are forwarded to the message store as they arrive.
pub fn spawn_model_call(
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn MessageStore>,
    request: ModelRequest,
    message_id: String,
    operation_id: String,
    abort: CancellationToken,
) -> ModelCallHandle {
    let task_abort = abort.clone();
    let completion = tokio::spawn(async move {
        let mut stream = provider.stream(request, task_abort.clone());
        let mut result = ModelCallResult::default();

        loop {
            let next = tokio::select! {
                _ = task_abort.cancelled() => {
                    result.cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            match chunk? {
                ModelChunk::Text { text } => {
                    result.content.push_str(&text);
                    store
                        .optimistic_update_message_content(&message_id, result.content.clone())
                        .await?;
                    result
                        .patches
                        .push(MessagePatch::Content(result.content.clone()));
                    result.chunks.push(StreamChunk::Text { text });
                }
                ModelChunk::Reasoning { text } => {
                    let reasoning = result.reasoning.get_or_insert_with(String::new);
                    reasoning.push_str(&text);
                    let reasoning = reasoning.clone();
                    store
                        .optimistic_update_message_reasoning(&message_id, reasoning.clone())
                        .await?;
                    result.patches.push(MessagePatch::Reasoning(reasoning));
                    result.chunks.push(StreamChunk::Reasoning { text });
                }
                ModelChunk::ToolCalls { tool_calls } => {
                    for tool_call in tool_calls {
                        if result.tool_calls.iter().any(|known| known.id == tool_call.id) {
                            continue;
                        }
                        store
                            .optimistic_add_tool_to_assistant_message(&message_id, tool_call.clone())
                            .await?;
                        result
                            .patches
                            .push(MessagePatch::AddToolCall(tool_call.clone()));
                        result.tool_calls.push(tool_call);
                    }
                }
                ModelChunk::Usage { usage } => {
                    result.usage = Some(match result.usage.take() {
                        Some(previous) => previous.merged(&usage),
                        None => usage,
                    });
                }
            }
        }

        Ok(result)
    });

    ModelCallHandle {
        operation_id,
        abort,
        completion,
    }
}
