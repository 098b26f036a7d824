use serde::{Deserialize, Serialize};

pub const DEFAULT_CURRENCY: &str = "USD";

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub api_calls: u64,
    pub processing_time_ms: u64,
    pub tokens: TokenUsage,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageEntry {
    pub name: String,
    pub calls: u64,
    pub errors: u64,
    pub total_time_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub total_calls: u64,
    pub total_time_ms: u64,
    pub by_tool: Vec<ToolUsageEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanInteractionUsage {
    pub approval_requests: u64,
    pub prompt_requests: u64,
    pub select_requests: u64,
    pub total_waiting_time_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanInteractionKind {
    Approval,
    Prompt,
    Select,
}

impl HumanInteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Prompt => "prompt",
            Self::Select => "select",
        }
    }
}

impl HumanInteractionUsage {
    pub fn record_request(&mut self, kind: HumanInteractionKind) {
        match kind {
            HumanInteractionKind::Approval => self.approval_requests += 1,
            HumanInteractionKind::Prompt => self.prompt_requests += 1,
            HumanInteractionKind::Select => self.select_requests += 1,
        }
    }

    pub fn record_wait(&mut self, waited_ms: u64) {
        self.total_waiting_time_ms += waited_ms;
    }
}

/// Cumulative counters for a run. Every field only grows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub llm: LlmUsage,
    pub tools: ToolUsage,
    pub human_interaction: HumanInteractionUsage,
}

/// Usage reported by a model provider for one call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ModelUsage {
    pub fn merged(&self, other: &ModelUsage) -> ModelUsage {
        let cost = match (self.cost, other.cost) {
            (None, None) => None,
            (left, right) => Some(left.unwrap_or(0.0) + right.unwrap_or(0.0)),
        };
        ModelUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            cached_input_tokens: self.cached_input_tokens + other.cached_input_tokens,
            cost,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub id: String,
    pub total_cost: f64,
    pub usage: ModelUsage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmCost {
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub by_model: Vec<ModelCost>,
}

impl Default for LlmCost {
    fn default() -> Self {
        Self {
            total: 0.0,
            currency: default_currency(),
            by_model: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCostEntry {
    pub name: String,
    pub calls: u64,
    pub currency: String,
    pub total_cost: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCost {
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub by_tool: Vec<ToolCostEntry>,
}

impl Default for ToolCost {
    fn default() -> Self {
        Self {
            total: 0.0,
            currency: default_currency(),
            by_tool: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub calculated_at: String,
    pub llm: LlmCost,
    pub tools: ToolCost,
}

impl Cost {
    pub fn new(calculated_at: impl Into<String>) -> Self {
        Self {
            total: 0.0,
            currency: default_currency(),
            calculated_at: calculated_at.into(),
            llm: LlmCost::default(),
            tools: ToolCost::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LlmAccumulation<'a> {
    pub model: &'a str,
    pub provider: &'a str,
    pub usage: &'a ModelUsage,
    pub processing_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolAccumulation<'a> {
    pub tool_name: &'a str,
    pub execution_time_ms: u64,
    pub success: bool,
    pub unit_price: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Accumulated {
    pub usage: Usage,
    pub cost: Cost,
}

/// Pure accumulation of usage and cost. Inputs are never mutated.
pub struct UsageCounter;

impl UsageCounter {
    pub fn accumulate_llm(
        usage: &Usage,
        cost: &Cost,
        call: LlmAccumulation<'_>,
        calculated_at: &str,
    ) -> Accumulated {
        let mut usage = usage.clone();
        let mut cost = cost.clone();

        usage.llm.api_calls += 1;
        usage.llm.processing_time_ms += call.processing_time_ms;
        usage.llm.tokens.input += call.usage.input_tokens;
        usage.llm.tokens.output += call.usage.output_tokens;
        usage.llm.tokens.total += call.usage.total_tokens;

        if let Some(call_cost) = call.usage.cost {
            let id = format!("{}/{}", call.provider, call.model);
            match cost.llm.by_model.iter_mut().find(|entry| entry.id == id) {
                Some(entry) => {
                    entry.total_cost += call_cost;
                    entry.usage = entry.usage.merged(call.usage);
                }
                None => cost.llm.by_model.push(ModelCost {
                    id,
                    total_cost: call_cost,
                    usage: call.usage.clone(),
                }),
            }
            cost.llm.total += call_cost;
            cost.total += call_cost;
        }
        cost.calculated_at = calculated_at.to_string();

        Accumulated { usage, cost }
    }

    pub fn accumulate_tool(
        usage: &Usage,
        cost: &Cost,
        call: ToolAccumulation<'_>,
        calculated_at: &str,
    ) -> Accumulated {
        let mut usage = usage.clone();
        let mut cost = cost.clone();

        usage.tools.total_calls += 1;
        usage.tools.total_time_ms += call.execution_time_ms;
        let errors = u64::from(!call.success);
        match usage
            .tools
            .by_tool
            .iter_mut()
            .find(|entry| entry.name == call.tool_name)
        {
            Some(entry) => {
                entry.calls += 1;
                entry.errors += errors;
                entry.total_time_ms += call.execution_time_ms;
            }
            None => usage.tools.by_tool.push(ToolUsageEntry {
                name: call.tool_name.to_string(),
                calls: 1,
                errors,
                total_time_ms: call.execution_time_ms,
            }),
        }

        if let Some(price) = call.unit_price.filter(|price| *price > 0.0) {
            let currency = cost.tools.currency.clone();
            match cost
                .tools
                .by_tool
                .iter_mut()
                .find(|entry| entry.name == call.tool_name)
            {
                Some(entry) => {
                    entry.calls += 1;
                    entry.total_cost += price;
                }
                None => cost.tools.by_tool.push(ToolCostEntry {
                    name: call.tool_name.to_string(),
                    calls: 1,
                    currency,
                    total_cost: price,
                }),
            }
            cost.tools.total += price;
            cost.total += price;
        }
        cost.calculated_at = calculated_at.to_string();

        Accumulated { usage, cost }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    fn model_usage(cost: Option<f64>) -> ModelUsage {
        ModelUsage {
            input_tokens: 100,
            output_tokens: 40,
            total_tokens: 140,
            cached_input_tokens: 0,
            cost,
        }
    }

    #[test]
    fn accumulate_llm_with_cost_expected_tokens_and_per_model_entry() {
        let usage = Usage::default();
        let cost = Cost::new("2026-01-01T00:00:00.000Z");
        let call_usage = model_usage(Some(0.25));

        let first = UsageCounter::accumulate_llm(
            &usage,
            &cost,
            LlmAccumulation {
                model: "gpt-x",
                provider: "openai",
                usage: &call_usage,
                processing_time_ms: 120,
            },
            "2026-01-01T00:00:01.000Z",
        );
        let second = UsageCounter::accumulate_llm(
            &first.usage,
            &first.cost,
            LlmAccumulation {
                model: "gpt-x",
                provider: "openai",
                usage: &call_usage,
                processing_time_ms: 80,
            },
            "2026-01-01T00:00:02.000Z",
        );

        assert_eq!(second.usage.llm.api_calls, 2);
        assert_eq!(second.usage.llm.processing_time_ms, 200);
        assert_eq!(second.usage.llm.tokens.total, 280);
        assert_eq!(second.cost.llm.by_model.len(), 1);
        assert_eq!(second.cost.llm.by_model[0].id, "openai/gpt-x");
        assert_eq!(second.cost.llm.by_model[0].usage.input_tokens, 200);
        assert!(approx(second.cost.total, 0.5));
        assert_eq!(second.cost.calculated_at, "2026-01-01T00:00:02.000Z");
        // inputs untouched
        assert_eq!(usage.llm.api_calls, 0);
        assert!(approx(cost.total, 0.0));
    }

    #[test]
    fn accumulate_llm_without_cost_expected_cost_unchanged() {
        let call_usage = model_usage(None);
        let result = UsageCounter::accumulate_llm(
            &Usage::default(),
            &Cost::new("t0"),
            LlmAccumulation {
                model: "m",
                provider: "p",
                usage: &call_usage,
                processing_time_ms: 0,
            },
            "t1",
        );
        assert_eq!(result.usage.llm.tokens.input, 100);
        assert!(result.cost.llm.by_model.is_empty());
        assert!(approx(result.cost.total, 0.0));
    }

    #[test]
    fn accumulate_tool_counts_errors_and_priced_calls() {
        let ok = UsageCounter::accumulate_tool(
            &Usage::default(),
            &Cost::new("t0"),
            ToolAccumulation {
                tool_name: "web/search",
                execution_time_ms: 30,
                success: true,
                unit_price: Some(0.01),
            },
            "t1",
        );
        let failed = UsageCounter::accumulate_tool(
            &ok.usage,
            &ok.cost,
            ToolAccumulation {
                tool_name: "web/search",
                execution_time_ms: 10,
                success: false,
                unit_price: Some(0.01),
            },
            "t2",
        );

        let entry = &failed.usage.tools.by_tool[0];
        assert_eq!(entry.calls, 2);
        assert_eq!(entry.errors, 1);
        assert_eq!(entry.total_time_ms, 40);
        assert_eq!(failed.usage.tools.total_calls, 2);
        assert_eq!(failed.cost.tools.by_tool[0].calls, 2);
        assert!(approx(failed.cost.tools.total, 0.02));
        assert!(approx(failed.cost.total, 0.02));
    }

    #[test]
    fn accumulate_tool_zero_price_expected_no_cost_entry() {
        let result = UsageCounter::accumulate_tool(
            &Usage::default(),
            &Cost::new("t0"),
            ToolAccumulation {
                tool_name: "fs/read",
                execution_time_ms: 5,
                success: true,
                unit_price: Some(0.0),
            },
            "t1",
        );
        assert!(result.cost.tools.by_tool.is_empty());
        assert_eq!(result.usage.tools.by_tool.len(), 1);
    }
}
