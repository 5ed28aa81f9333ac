use serde::{Deserialize, Serialize};

/// Model tiers available to the LLM oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    /// Speed tier - fast, cheap model for similarity and domain classification
    Speed,
    /// Balanced tier - better reasoning for expansion decisions and partitioning
    Balanced,
}

/// Maximum completion tokens for all model tiers
const MODEL_MAX_TOKENS: u32 = 8192;

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Speed => "openai/gpt-oss-120b:nitro",
            Model::Balanced => "anthropic/claude-sonnet-4.5:nitro",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        MODEL_MAX_TOKENS
    }

    /// Whether this model accepts `json_schema` response formats.
    pub fn supports_structured_outputs(&self) -> bool {
        matches!(self, Model::Speed | Model::Balanced)
    }
}

/// API usage information from OpenRouter
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Cost in USD as reported by OpenRouter (`total_cost` in the usage object).
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when the provider did not report one.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.cost = match (self.cost, other.cost) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
    }
}
