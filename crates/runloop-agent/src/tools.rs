use crate::ToolError;
use async_trait::async_trait;
use runloop_state::ToolCallPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ToolInvocationContext {
    pub session_id: String,
    pub message_id: String,
    pub operation_id: String,
    pub cancellation: CancellationToken,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            state: None,
        }
    }
}

/// What the model is told about a tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    /// `identifier/api_name`
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub requires_approval: bool,
}

impl ToolManifest {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Object(Default::default()),
            requires_approval: false,
        }
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn invoke(
        &self,
        tool_call: &ToolCallPayload,
        arguments: Value,
        context: ToolInvocationContext,
    ) -> Result<ToolOutput, ToolError>;

    fn manifests(&self) -> Vec<ToolManifest>;
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value, ToolInvocationContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub manifest: ToolManifest,
    pub executor: ToolExecutor,
}

impl RegisteredTool {
    pub fn new<F, Fut>(manifest: ToolManifest, executor: F) -> Self
    where
        F: Fn(Value, ToolInvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            manifest,
            executor: Arc::new(move |arguments, context| Box::pin(executor(arguments, context))),
        }
    }
}

/// Closure-backed [`ToolRuntime`], keyed by `identifier/api_name`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.manifest.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolRuntime for ToolRegistry {
    async fn invoke(
        &self,
        tool_call: &ToolCallPayload,
        arguments: Value,
        context: ToolInvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = tool_call.tool_name();
        let tool = self.tools.get(&name).ok_or(ToolError::Unknown(name))?;
        (tool.executor)(arguments, context).await
    }

    fn manifests(&self) -> Vec<ToolManifest> {
        let mut manifests: Vec<ToolManifest> = self
            .tools
            .values()
            .map(|tool| tool.manifest.clone())
            .collect();
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ToolInvocationContext {
        ToolInvocationContext {
            session_id: "s1".to_string(),
            message_id: "m1".to_string(),
            operation_id: "op_1".to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_invokes_tool_by_identifier_and_api_name() {
        let mut registry = ToolRegistry::new();
        registry.register(RegisteredTool::new(
            ToolManifest::new("calc/add", "adds two numbers"),
            |arguments: Value, _context| async move {
                let sum = arguments["a"].as_i64().unwrap_or(0) + arguments["b"].as_i64().unwrap_or(0);
                Ok(ToolOutput::text(sum.to_string()))
            },
        ));

        let call = ToolCallPayload::new("c1", "calc", "add", r#"{"a":2,"b":3}"#);
        let output = registry
            .invoke(&call, json!({"a": 2, "b": 3}), context())
            .await
            .expect("tool should run");
        assert_eq!(output.content, "5");
        assert_eq!(registry.names(), vec!["calc/add".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_unknown_tool_expected_unknown_error() {
        let registry = ToolRegistry::new();
        let call = ToolCallPayload::new("c1", "web", "search", "{}");
        let error = registry
            .invoke(&call, json!({}), context())
            .await
            .expect_err("unknown tool should fail");
        assert_eq!(error, ToolError::Unknown("web/search".to_string()));
    }
}
