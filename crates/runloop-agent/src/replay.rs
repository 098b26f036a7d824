//! Replays recorded model turns and tool results without a live provider.

use crate::{
    ModelChunk, ModelError, ModelProvider, ModelRequest, ModelStream, RegisteredTool, ToolError,
    ToolManifest, ToolOutput,
};
use futures::StreamExt;
use futures::stream;
use runloop_state::{ModelUsage, ToolCallPayload};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted model turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelScript {
    Reply {
        chunks: Vec<ModelChunk>,
    },
    Fail {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    /// Never yields; only cancellation ends the call.
    Hang,
}

impl ModelScript {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Reply {
            chunks: vec![ModelChunk::Text { text: text.into() }],
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallPayload>) -> Self {
        Self::Reply {
            chunks: vec![ModelChunk::ToolCalls { tool_calls }],
        }
    }

    pub fn with_usage(self, usage: ModelUsage) -> Self {
        match self {
            Self::Reply { mut chunks } => {
                chunks.push(ModelChunk::Usage { usage });
                Self::Reply { chunks }
            }
            other => other,
        }
    }
}

/// Model provider replaying [`ModelScript`]s in order. Fails with a fatal
/// error once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedModelProvider {
    scripts: Mutex<VecDeque<ModelScript>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelProvider {
    pub fn new(scripts: impl IntoIterator<Item = ModelScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .expect("scripted model mutex poisoned")
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.scripts
            .lock()
            .expect("scripted model mutex poisoned")
            .len()
    }
}

impl ModelProvider for ScriptedModelProvider {
    fn stream(&self, request: ModelRequest, _cancel: CancellationToken) -> ModelStream {
        self.requests
            .lock()
            .expect("scripted model mutex poisoned")
            .push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripted model mutex poisoned")
            .pop_front();
        match script {
            Some(ModelScript::Reply { chunks }) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            Some(ModelScript::Fail { message, retryable }) => {
                stream::iter(vec![Err(ModelError { message, retryable })]).boxed()
            }
            Some(ModelScript::Hang) => stream::pending().boxed(),
            None => stream::iter(vec![Err(ModelError::fatal("model script exhausted"))]).boxed(),
        }
    }
}

/// Always returns `output`.
pub fn static_tool(name: &str, output: ToolOutput) -> RegisteredTool {
    RegisteredTool::new(ToolManifest::new(name, "returns a fixed output"), move |_, _| {
        let output = output.clone();
        async move { Ok(output) }
    })
}

pub fn failing_tool(name: &str, message: &str) -> RegisteredTool {
    let message = message.to_string();
    RegisteredTool::new(ToolManifest::new(name, "always fails"), move |_, _| {
        let message = message.clone();
        async move { Err(ToolError::Failed(message)) }
    })
}
