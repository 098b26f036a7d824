use crate::RetryPolicy;
use runloop_state::ModelSelection;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToolFailurePolicy {
    /// Record the failure on the message and keep running.
    #[default]
    Continue,
    /// Any tool failure finishes the run with reason `error`.
    FinishRun,
}

/// Runtime configuration for an agent run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    /// Zero means unlimited.
    pub max_steps: u32,
    /// Zero disables the per-call deadline.
    pub tool_timeout_ms: u64,
    pub tool_failure_policy: ToolFailurePolicy,
    /// Tools whose failure is fatal even under `ToolFailurePolicy::Continue`.
    pub fatal_tools: HashSet<String>,
    /// Price charged per call, keyed by `identifier/api_name`.
    pub tool_pricing: HashMap<String, f64>,
    /// Tools the general planner sends through human approval first.
    pub approval_required_tools: HashSet<String>,
    pub model_retry: RetryPolicy,
    pub checkpoint_path: Option<PathBuf>,
    pub default_model: Option<ModelSelection>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            tool_timeout_ms: 60_000,
            tool_failure_policy: ToolFailurePolicy::Continue,
            fatal_tools: HashSet::new(),
            tool_pricing: HashMap::new(),
            approval_required_tools: HashSet::new(),
            model_retry: RetryPolicy::default(),
            checkpoint_path: None,
            default_model: None,
        }
    }
}

impl RunnerConfig {
    pub fn is_fatal_tool_failure(&self, tool_name: &str) -> bool {
        self.tool_failure_policy == ToolFailurePolicy::FinishRun
            || self.fatal_tools.contains(tool_name)
    }

    pub fn tool_price(&self, tool_name: &str) -> Option<f64> {
        self.tool_pricing.get(tool_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_defaults_match_baseline() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_steps, 100);
        assert_eq!(config.tool_timeout_ms, 60_000);
        assert_eq!(config.tool_failure_policy, ToolFailurePolicy::Continue);
        assert_eq!(config.model_retry.max_attempts, 3);
        assert!(config.checkpoint_path.is_none());
        assert!(config.default_model.is_none());
    }

    #[test]
    fn fatal_tool_failure_honors_policy_and_overrides() {
        let mut config = RunnerConfig::default();
        assert!(!config.is_fatal_tool_failure("web/search"));
        config.fatal_tools.insert("web/search".to_string());
        assert!(config.is_fatal_tool_failure("web/search"));
        assert!(!config.is_fatal_tool_failure("fs/read"));
        config.tool_failure_policy = ToolFailurePolicy::FinishRun;
        assert!(config.is_fatal_tool_failure("fs/read"));
    }
}
