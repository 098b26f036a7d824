use runloop_ops::OperationError;
use runloop_state::{ErrorKind, Message, StateError};
use thiserror::Error;

/// A malformed or inapplicable instruction. Raised before any side effect.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{instruction} is missing required field `{field}`")]
    MissingField {
        instruction: &'static str,
        field: &'static str,
    },
    #[error("invalid {instruction}: {message}")]
    Invalid {
        instruction: &'static str,
        message: String,
    },
    #[error("{instruction} cannot be applied while the run is {status}")]
    WrongStatus {
        instruction: &'static str,
        status: String,
    },
    #[error("no human request is pending")]
    NoPendingRequest,
    #[error("`{response}` response does not answer the pending human request")]
    ResponseMismatch { response: String },
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ModelError {
    pub message: String,
    pub retryable: bool,
}

impl ModelError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("tool timed out after {0}ms")]
    Timeout(u64),
    #[error("tool execution cancelled")]
    Cancelled,
}

/// Top-level error type for the runloop-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid run state: {0}")]
    InvalidState(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("message store error: {0}")]
    MessageStore(String),
    #[error("model provider error: {0}")]
    Model(#[from] ModelError),
    #[error("internal error: {0}")]
    Internal(String),
    /// A model turn that failed after its assistant message was created. The
    /// message carries the error annotation already written to the store.
    #[error("{source}")]
    FailedTurn {
        message: Box<Message>,
        source: Box<AgentError>,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownTool(_) => ErrorKind::Tool,
            Self::Model(_) => ErrorKind::Model,
            Self::InvalidState(_) | Self::State(_) | Self::Operation(_) => ErrorKind::State,
            Self::InvalidConfiguration(_) | Self::MessageStore(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
            Self::FailedTurn { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Model(error) => error.retryable,
            Self::FailedTurn { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
