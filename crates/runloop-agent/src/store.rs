use crate::AgentError;
use async_trait::async_trait;
use runloop_state::{
    Clock, CreateMessageParams, InterventionStatus, Message, MessagePatch, PluginError,
    ToolCallPayload, format_timestamp,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Optimistic CRUD surface for conversation messages. Every mutation is
/// visible to `messages` as soon as the call returns.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn optimistic_create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<Message, AgentError>;

    async fn optimistic_update_message_content(
        &self,
        message_id: &str,
        content: String,
    ) -> Result<(), AgentError>;

    async fn optimistic_update_message_reasoning(
        &self,
        message_id: &str,
        reasoning: String,
    ) -> Result<(), AgentError>;

    async fn optimistic_update_message_plugin(
        &self,
        message_id: &str,
        plugin_state: Value,
    ) -> Result<(), AgentError>;

    async fn optimistic_update_message_plugin_error(
        &self,
        message_id: &str,
        error: PluginError,
    ) -> Result<(), AgentError>;

    async fn optimistic_add_tool_to_assistant_message(
        &self,
        message_id: &str,
        tool_call: ToolCallPayload,
    ) -> Result<(), AgentError>;

    async fn optimistic_update_message_intervention(
        &self,
        message_id: &str,
        status: InterventionStatus,
    ) -> Result<(), AgentError>;

    async fn messages(&self, session_id: &str) -> Vec<Message>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum PersistenceWrite {
    Create {
        session_id: String,
        message: Message,
    },
    Update {
        session_id: String,
        message_id: String,
        patch: MessagePatch,
    },
}

/// Durable backend behind [`OptimisticMessageStore`].
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    async fn persist(&self, write: PersistenceWrite) -> Result<(), AgentError>;
}

enum WriterCommand {
    Write(PersistenceWrite),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Vec<Message>>,
    message_sessions: HashMap<String, String>,
}

/// In-memory optimistic store with write-behind persistence.
///
/// Mutations land in memory immediately and are queued for a background
/// writer task, which forwards them to the [`MessagePersistence`] backend in
/// order. Persist failures are logged, never surfaced to the caller. Must be
/// constructed inside a tokio runtime.
#[derive(Clone)]
pub struct OptimisticMessageStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl OptimisticMessageStore {
    pub fn new(persistence: Arc<dyn MessagePersistence>, clock: Arc<dyn Clock>) -> Self {
        let (writer, mut queue) = mpsc::unbounded_channel::<WriterCommand>();
        tokio::spawn(async move {
            while let Some(command) = queue.recv().await {
                match command {
                    WriterCommand::Write(write) => {
                        if let Err(error) = persistence.persist(write).await {
                            tracing::warn!(error = %error, "message_persist_failed");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
            writer,
        }
    }

    /// Waits until every write queued so far has reached the backend.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Seeds a session with already persisted messages, e.g. after a resume.
    pub fn hydrate(&self, session_id: &str, messages: Vec<Message>) {
        let mut state = self.state.lock().expect("message store mutex poisoned");
        for message in &messages {
            state
                .message_sessions
                .insert(message.id.clone(), session_id.to_string());
        }
        state.sessions.insert(session_id.to_string(), messages);
    }

    fn enqueue(&self, write: PersistenceWrite) {
        if self.writer.send(WriterCommand::Write(write)).is_err() {
            tracing::warn!("message_writer_closed");
        }
    }

    fn patch(&self, message_id: &str, patch: MessagePatch) -> Result<(), AgentError> {
        let session_id = {
            let mut state = self.state.lock().expect("message store mutex poisoned");
            let session_id = state
                .message_sessions
                .get(message_id)
                .cloned()
                .ok_or_else(|| {
                    AgentError::MessageStore(format!("unknown message id: {message_id}"))
                })?;
            let message = state
                .sessions
                .get_mut(&session_id)
                .and_then(|messages| messages.iter_mut().find(|message| message.id == message_id))
                .ok_or_else(|| {
                    AgentError::MessageStore(format!("unknown message id: {message_id}"))
                })?;
            message.apply(&patch);
            session_id
        };
        self.enqueue(PersistenceWrite::Update {
            session_id,
            message_id: message_id.to_string(),
            patch,
        });
        Ok(())
    }
}

#[async_trait]
impl MessageStore for OptimisticMessageStore {
    async fn optimistic_create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<Message, AgentError> {
        if params.session_id.is_empty() {
            return Err(AgentError::MessageStore(
                "cannot create a message without a session id".to_string(),
            ));
        }
        let session_id = params.session_id.clone();
        let message = params.into_message(
            format!("msg_{}", Uuid::new_v4().simple()),
            format_timestamp(self.clock.now()),
        );
        {
            let mut state = self.state.lock().expect("message store mutex poisoned");
            state
                .message_sessions
                .insert(message.id.clone(), session_id.clone());
            state
                .sessions
                .entry(session_id.clone())
                .or_default()
                .push(message.clone());
        }
        tracing::debug!(
            session_id = %session_id,
            message_id = %message.id,
            role = message.role.as_str(),
            "message_created"
        );
        self.enqueue(PersistenceWrite::Create {
            session_id,
            message: message.clone(),
        });
        Ok(message)
    }

    async fn optimistic_update_message_content(
        &self,
        message_id: &str,
        content: String,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::Content(content))
    }

    async fn optimistic_update_message_reasoning(
        &self,
        message_id: &str,
        reasoning: String,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::Reasoning(reasoning))
    }

    async fn optimistic_update_message_plugin(
        &self,
        message_id: &str,
        plugin_state: Value,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::PluginState(plugin_state))
    }

    async fn optimistic_update_message_plugin_error(
        &self,
        message_id: &str,
        error: PluginError,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::PluginError(error))
    }

    async fn optimistic_add_tool_to_assistant_message(
        &self,
        message_id: &str,
        tool_call: ToolCallPayload,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::AddToolCall(tool_call))
    }

    async fn optimistic_update_message_intervention(
        &self,
        message_id: &str,
        status: InterventionStatus,
    ) -> Result<(), AgentError> {
        self.patch(message_id, MessagePatch::Intervention(status))
    }

    async fn messages(&self, session_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .expect("message store mutex poisoned")
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Persistence backend that keeps the durable copy in memory.
#[derive(Clone, Default)]
pub struct MemoryMessagePersistence {
    inner: Arc<Mutex<MemoryPersistenceState>>,
}

#[derive(Default)]
struct MemoryPersistenceState {
    sessions: HashMap<String, Vec<Message>>,
    writes: usize,
}

impl MemoryMessagePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .expect("memory persistence mutex poisoned")
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.inner
            .lock()
            .expect("memory persistence mutex poisoned")
            .writes
    }
}

#[async_trait]
impl MessagePersistence for MemoryMessagePersistence {
    async fn persist(&self, write: PersistenceWrite) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().expect("memory persistence mutex poisoned");
        inner.writes += 1;
        match write {
            PersistenceWrite::Create {
                session_id,
                message,
            } => {
                inner.sessions.entry(session_id).or_default().push(message);
                Ok(())
            }
            PersistenceWrite::Update {
                session_id,
                message_id,
                patch,
            } => {
                let message = inner
                    .sessions
                    .get_mut(&session_id)
                    .and_then(|messages| {
                        messages.iter_mut().find(|message| message.id == message_id)
                    })
                    .ok_or_else(|| {
                        AgentError::MessageStore(format!(
                            "persisted message not found: {message_id}"
                        ))
                    })?;
                message.apply(&patch);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_state::{ManualClock, MessageRole};

    fn store() -> (OptimisticMessageStore, MemoryMessagePersistence) {
        let persistence = MemoryMessagePersistence::new();
        let store = OptimisticMessageStore::new(
            Arc::new(persistence.clone()),
            Arc::new(ManualClock::from_millis(1_700_000_000_000)),
        );
        (store, persistence)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_then_update_visible_immediately_and_persisted_after_flush() {
        let (store, persistence) = store();
        let message = store
            .optimistic_create_message(CreateMessageParams::new(
                MessageRole::Assistant,
                "",
                "s1",
            ))
            .await
            .expect("create should succeed");
        store
            .optimistic_update_message_content(&message.id, "hello".to_string())
            .await
            .expect("update should succeed");

        let visible = store.messages("s1").await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "hello");
        assert!(visible[0].id.starts_with("msg_"));

        store.flush().await;
        assert_eq!(persistence.write_count(), 2);
        assert_eq!(persistence.messages("s1"), visible);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_unknown_message_returns_message_store_error() {
        let (store, _) = store();
        let error = store
            .optimistic_update_message_intervention("missing", InterventionStatus::Aborted)
            .await
            .expect_err("unknown message should fail");
        assert!(matches!(error, AgentError::MessageStore(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn add_tool_to_assistant_message_is_idempotent_by_call_id() {
        let (store, _) = store();
        let message = store
            .optimistic_create_message(CreateMessageParams::new(
                MessageRole::Assistant,
                "",
                "s1",
            ))
            .await
            .expect("create should succeed");
        let call = ToolCallPayload::new("c1", "web", "search", "{}");
        for _ in 0..2 {
            store
                .optimistic_add_tool_to_assistant_message(&message.id, call.clone())
                .await
                .expect("add should succeed");
        }
        assert_eq!(store.messages("s1").await[0].tool_calls.len(), 1);
    }
}
