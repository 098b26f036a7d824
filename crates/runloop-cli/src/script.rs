use runloop_agent::replay::{ModelScript, failing_tool, static_tool};
use runloop_agent::{RegisteredTool, ToolOutput};
use runloop_state::{CostLimit, HumanResponse, Instruction, ModelSelection};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// A replayable run: the opening instructions plus canned model and tool
/// behaviour.
#[derive(Clone, Debug, Deserialize)]
pub struct RunScript {
    pub session_id: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    /// When set, the general planner drives the run against `model_responses`.
    #[serde(default)]
    pub model: Option<ModelSelection>,
    #[serde(default)]
    pub model_responses: Vec<ModelScript>,
    #[serde(default)]
    pub tools: BTreeMap<String, ScriptedTool>,
    #[serde(default)]
    pub approval_required: Vec<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub tool_pricing: HashMap<String, f64>,
    #[serde(default)]
    pub cost_limit: Option<CostLimit>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ScriptedTool {
    Failure { error: String },
    Output(ToolOutput),
}

impl RunScript {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed reading script '{}': {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("invalid script '{}': {e}", path.display()))
    }

    pub fn registered_tools(&self) -> Vec<RegisteredTool> {
        self.tools
            .iter()
            .map(|(name, tool)| match tool {
                ScriptedTool::Failure { error } => failing_tool(name, error),
                ScriptedTool::Output(output) => static_tool(name, output.clone()),
            })
            .collect()
    }
}

/// Parses `approve`, `reject[:reason]`, `prompt:<text>` and
/// `select:<value>[,<value>...]`.
pub fn parse_human_answer(raw: &str) -> Result<HumanResponse, String> {
    let (kind, rest) = match raw.split_once(':') {
        Some((kind, rest)) => (kind.trim(), Some(rest)),
        None => (raw.trim(), None),
    };
    match (kind, rest) {
        ("approve", None) => Ok(HumanResponse::Approved),
        ("reject", reason) => Ok(HumanResponse::Rejected {
            reason: reason
                .map(str::trim)
                .filter(|reason| !reason.is_empty())
                .map(str::to_string),
        }),
        ("prompt", Some(text)) => Ok(HumanResponse::Prompted {
            text: text.to_string(),
        }),
        ("select", Some(values)) => {
            let values: Vec<String> = values
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect();
            if values.is_empty() {
                return Err(format!("human answer '{raw}' selects nothing"));
            }
            Ok(HumanResponse::Selected { values })
        }
        _ => Err(format!(
            "unrecognised human answer '{raw}'; expected approve, reject[:reason], prompt:<text> or select:<values>"
        )),
    }
}
