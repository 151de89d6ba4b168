use crate::types::RunId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-run spending limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_llm_calls: u32,
    pub max_cost_cents: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: 50,
            max_cost_cents: 500,
        }
    }
}

/// Result of a budget check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetCheck {
    pub exceeded: bool,
    pub reason: Option<String>,
}

/// Snapshot of what a run has consumed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub llm_calls: u32,
    pub cost_cents: u64,
}

#[derive(Debug, Default)]
struct RunBudget {
    usage: BudgetUsage,
    // Latched on the first failing check and never cleared
    exceeded: Option<String>,
}

/// Tracks LLM calls and spend per run.
///
/// Counters only grow while a run is live, and once a check reports the
/// budget as exceeded every later check for that run reports the same.
/// State is released when the run finishes.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    runs: Mutex<HashMap<RunId, RunBudget>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BudgetConfig {
        self.config
    }

    pub fn check_budget(&self, run_id: RunId) -> BudgetCheck {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let state = runs.entry(run_id).or_default();

        if state.exceeded.is_none() {
            state.exceeded = self.limit_reached(&state.usage);
        }

        BudgetCheck {
            exceeded: state.exceeded.is_some(),
            reason: state.exceeded.clone(),
        }
    }

    pub fn increment_llm_calls(&self, run_id: RunId) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let state = runs.entry(run_id).or_default();
        state.usage.llm_calls = state.usage.llm_calls.saturating_add(1);
    }

    pub fn add_cost(&self, run_id: RunId, cents: u64) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let state = runs.entry(run_id).or_default();
        state.usage.cost_cents = state.usage.cost_cents.saturating_add(cents);
    }

    pub fn usage(&self, run_id: RunId) -> BudgetUsage {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get(&run_id).map(|state| state.usage).unwrap_or_default()
    }

    /// Drop a finished run's state. Only call once the run is terminal;
    /// a later check would start from zero.
    pub fn release(&self, run_id: RunId) -> Option<BudgetUsage> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.remove(&run_id).map(|state| state.usage)
    }

    /// Number of runs currently holding budget state
    pub fn tracked_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn limit_reached(&self, usage: &BudgetUsage) -> Option<String> {
        if usage.llm_calls >= self.config.max_llm_calls {
            return Some(format!(
                "LLM call limit reached ({}/{})",
                usage.llm_calls, self.config.max_llm_calls
            ));
        }
        if usage.cost_cents >= self.config.max_cost_cents {
            return Some(format!(
                "cost limit reached ({} of {} cents)",
                usage.cost_cents, self.config.max_cost_cents
            ));
        }
        None
    }
}

/// Token counts reported by a provider for one completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Price in cents per 1K tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

const PRICES: &[(&str, &str, ModelPrice)] = &[
    ("openai", "gpt-4o", ModelPrice { input: 2.5, output: 10.0 }),
    ("openai", "gpt-4-turbo", ModelPrice { input: 10.0, output: 30.0 }),
    ("openai", "gpt-3.5-turbo", ModelPrice { input: 0.5, output: 1.5 }),
    ("anthropic", "claude-3-5-sonnet", ModelPrice { input: 3.0, output: 15.0 }),
    ("anthropic", "claude-3-opus", ModelPrice { input: 15.0, output: 75.0 }),
    ("google", "gemini-pro", ModelPrice { input: 0.5, output: 1.5 }),
];

pub fn model_price(provider: &str, model: &str) -> Option<ModelPrice> {
    PRICES
        .iter()
        .find(|(p, m, _)| p.eq_ignore_ascii_case(provider) && m.eq_ignore_ascii_case(model))
        .map(|(_, _, price)| *price)
}

/// Estimated cost of a completion in whole cents, rounded up. Unknown models cost 0.
pub fn estimate_cost_cents(provider: &str, model: &str, usage: &TokenUsage) -> u64 {
    let Some(price) = model_price(provider, model) else {
        return 0;
    };

    let input = usage.prompt_tokens as f64 / 1000.0 * price.input;
    let output = usage.completion_tokens as f64 / 1000.0 * price.output;
    (input + output).ceil() as u64
}
