use super::client::{truncate_str, OpenRouterClient, StructuredResponse};
use super::models::{Model, Usage};
use super::prompts::{
    DOMAIN_CLASSIFY_SYSTEM, DUPLICATES_SYSTEM, EXPANSION_SYSTEM, GROUP_SUMMARY_SYSTEM,
    RELATIONSHIP_SYSTEM, SIMILARITY_BATCH_SYSTEM,
};
use super::{
    DomainVerdict, DuplicateGroup, ExpansionDecision, FailureKind, GroupSummary, Judgment, Oracle,
    OracleFuture, RelationshipVerdict, SimilarityVerdict, ThemePair,
};
use crate::config::OracleSettings;
use crate::theme::ConsolidatedTheme;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Snippet lines sent per code block; the rest is elided.
const MAX_SNIPPET_LINES: usize = 80;
const MAX_DESCRIPTION_CHARS: usize = 600;

const MISSING_KEY: &str = "No API key configured. Set OPENROUTER_API_KEY or store a key in the system keychain.";

/// Oracle backed by OpenRouter chat completions with JSON-schema output.
pub struct LlmOracle {
    client: Option<OpenRouterClient>,
    model: Model,
    usage: Mutex<Usage>,
}

impl LlmOracle {
    /// A missing key is not an error here; [`Oracle::check_ready`] reports it.
    pub fn new(api_key: Option<String>, settings: &OracleSettings) -> anyhow::Result<Self> {
        let client = match api_key {
            Some(key) if !key.trim().is_empty() => {
                Some(OpenRouterClient::new(key, settings.request_timeout_secs)?)
            }
            _ => None,
        };
        Ok(Self {
            client,
            model: settings.model,
            usage: Mutex::new(Usage::default()),
        })
    }

    /// Token usage and cost accumulated over every call so far.
    pub fn usage(&self) -> Usage {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn structured<T>(
        &self,
        system: &str,
        user: String,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{}", MISSING_KEY))?;
        let StructuredResponse { data, usage } = client
            .call_structured::<T>(system, &user, self.model, schema_name, schema)
            .await?;
        if let Some(usage) = usage {
            self.usage
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .add(&usage);
        }
        Ok(data)
    }

    async fn similarity_batch(&self, pairs: &[ThemePair<'_>]) -> Judgment<Vec<SimilarityVerdict>> {
        let contexts: Vec<PairContext> = pairs
            .iter()
            .enumerate()
            .map(|(index, pair)| PairContext {
                index,
                first: ThemeContext::brief(pair.first),
                second: ThemeContext::brief(pair.second),
            })
            .collect();
        let user = match serde_json::to_string_pretty(&contexts) {
            Ok(json) => format!("Compare each pair of themes.\n\nPAIRS:\n{}", json),
            Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
        };

        let result = self
            .structured::<SimilarityResponse>(
                SIMILARITY_BATCH_SYSTEM,
                user,
                "similarity_batch",
                similarity_schema(),
            )
            .await;
        match Judgment::from_result(result) {
            Judgment::Success(response) => {
                let mut verdicts = response.verdicts;
                verdicts.sort_by_key(|v| v.index);
                let in_order = verdicts.iter().enumerate().all(|(i, v)| v.index == i);
                if verdicts.len() != pairs.len() || !in_order {
                    return Judgment::failure(
                        FailureKind::Malformed,
                        format!(
                            "expected {} similarity verdicts, got {}",
                            pairs.len(),
                            verdicts.len()
                        ),
                    );
                }
                Judgment::Success(verdicts.into_iter().map(WireSimilarity::into_verdict).collect())
            }
            Judgment::Failure { kind, reason } => Judgment::Failure { kind, reason },
        }
    }
}

impl Oracle for LlmOracle {
    fn check_ready(&self) -> Result<(), String> {
        if self.client.is_some() {
            Ok(())
        } else {
            Err(MISSING_KEY.to_string())
        }
    }

    fn compare_pair<'a>(&'a self, pair: ThemePair<'a>) -> OracleFuture<'a, SimilarityVerdict> {
        Box::pin(async move {
            let single = [pair];
            match self.similarity_batch(&single).await {
                Judgment::Success(mut verdicts) => match verdicts.pop() {
                    Some(verdict) => Judgment::Success(verdict),
                    None => Judgment::failure(FailureKind::Malformed, "empty similarity response"),
                },
                Judgment::Failure { kind, reason } => Judgment::Failure { kind, reason },
            }
        })
    }

    fn compare_batch<'a>(&'a self, pairs: &'a [ThemePair<'a>]) -> OracleFuture<'a, Vec<SimilarityVerdict>> {
        Box::pin(async move {
            if pairs.is_empty() {
                return Judgment::Success(Vec::new());
            }
            self.similarity_batch(pairs).await
        })
    }

    fn classify_domains<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DomainVerdict>> {
        Box::pin(async move {
            if themes.is_empty() {
                return Judgment::Success(Vec::new());
            }
            let contexts: Vec<ThemeContext> = themes
                .iter()
                .enumerate()
                .map(|(i, t)| ThemeContext::brief(t).with_index(i))
                .collect();
            let user = match serde_json::to_string_pretty(&contexts) {
                Ok(json) => format!("Classify each theme into a business domain.\n\nTHEMES:\n{}", json),
                Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
            };

            let result = self
                .structured::<DomainResponse>(DOMAIN_CLASSIFY_SYSTEM, user, "domain_classification", domain_schema())
                .await;
            match Judgment::from_result(result) {
                Judgment::Success(response) => {
                    let mut themes_out = response.themes;
                    themes_out.sort_by_key(|t| t.index);
                    if themes_out.len() != themes.len()
                        || themes_out.iter().enumerate().any(|(i, t)| t.index != i)
                    {
                        return Judgment::failure(
                            FailureKind::Malformed,
                            format!(
                                "expected {} domain classifications, got {}",
                                themes.len(),
                                themes_out.len()
                            ),
                        );
                    }
                    Judgment::Success(
                        themes_out
                            .into_iter()
                            .map(|t| DomainVerdict {
                                domain: t.domain.trim().to_string(),
                                confidence: t.confidence.clamp(0.0, 1.0),
                            })
                            .collect(),
                    )
                }
                Judgment::Failure { kind, reason } => Judgment::Failure { kind, reason },
            }
        })
    }

    fn decide_expansion<'a>(&'a self, node: &'a ConsolidatedTheme, depth: u32) -> OracleFuture<'a, ExpansionDecision> {
        Box::pin(async move {
            let context = ThemeContext::full(node);
            let user = match serde_json::to_string_pretty(&context) {
                Ok(json) => format!(
                    "Current depth in the tree: {}\n\nTHEME:\n{}",
                    depth, json
                ),
                Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
            };
            let result = self
                .structured::<ExpansionDecision>(EXPANSION_SYSTEM, user, "expansion_decision", expansion_schema())
                .await;
            Judgment::from_result(result).map(|mut decision| {
                decision.confidence = decision.confidence.clamp(0.0, 1.0);
                if !decision.should_expand {
                    decision.children.clear();
                }
                decision
            })
        })
    }

    fn detect_duplicates<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DuplicateGroup>> {
        Box::pin(async move {
            if themes.len() < 2 {
                return Judgment::Success(Vec::new());
            }
            let contexts: Vec<ThemeContext> = themes
                .iter()
                .enumerate()
                .map(|(i, t)| ThemeContext::brief(t).with_index(i))
                .collect();
            let user = match serde_json::to_string_pretty(&contexts) {
                Ok(json) => format!("Find true duplicates among these sibling themes.\n\nTHEMES:\n{}", json),
                Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
            };
            let result = self
                .structured::<DuplicatesResponse>(DUPLICATES_SYSTEM, user, "duplicate_groups", duplicates_schema())
                .await;
            match Judgment::from_result(result) {
                Judgment::Success(response) => {
                    if let Some(bad) = response
                        .groups
                        .iter()
                        .flat_map(|g| g.indices.iter())
                        .find(|&&i| i >= themes.len())
                    {
                        return Judgment::failure(
                            FailureKind::Malformed,
                            format!("duplicate group index {} out of range", bad),
                        );
                    }
                    Judgment::Success(response.groups)
                }
                Judgment::Failure { kind, reason } => Judgment::Failure { kind, reason },
            }
        })
    }

    fn summarize_group<'a>(
        &'a self,
        themes: &'a [&'a ConsolidatedTheme],
        domain: Option<&'a str>,
    ) -> OracleFuture<'a, GroupSummary> {
        Box::pin(async move {
            let contexts: Vec<ThemeContext> = themes.iter().map(|t| ThemeContext::brief(t)).collect();
            let json = match serde_json::to_string_pretty(&contexts) {
                Ok(json) => json,
                Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
            };
            let user = match domain {
                Some(domain) => format!(
                    "Write the parent theme for the \"{}\" domain.\n\nCHILD THEMES:\n{}",
                    domain, json
                ),
                None => format!("Write one unified theme for these merged themes.\n\nTHEMES:\n{}", json),
            };
            let result = self
                .structured::<GroupSummary>(GROUP_SUMMARY_SYSTEM, user, "group_summary", summary_schema())
                .await;
            match Judgment::from_result(result) {
                Judgment::Success(summary) if summary.name.trim().is_empty() => {
                    Judgment::failure(FailureKind::Malformed, "empty group name")
                }
                other => other,
            }
        })
    }

    fn classify_relationship<'a>(
        &'a self,
        higher: &'a ConsolidatedTheme,
        lower: &'a ConsolidatedTheme,
    ) -> OracleFuture<'a, RelationshipVerdict> {
        Box::pin(async move {
            let payload = serde_json::json!({
                "higher": ThemeContext::brief(higher),
                "lower": ThemeContext::brief(lower),
            });
            let user = match serde_json::to_string_pretty(&payload) {
                Ok(json) => format!("Classify the relationship between these themes.\n\n{}", json),
                Err(err) => return Judgment::failure(FailureKind::Malformed, err.to_string()),
            };
            let result = self
                .structured::<RelationshipVerdict>(RELATIONSHIP_SYSTEM, user, "relationship", relationship_schema())
                .await;
            Judgment::from_result(result).map(|mut verdict| {
                verdict.score = verdict.score.clamp(0.0, 1.0);
                verdict
            })
        })
    }
}

#[derive(Serialize)]
struct ThemeContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    name: String,
    description: String,
    level: u32,
    files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    code: Vec<CodeContext>,
}

#[derive(Serialize)]
struct CodeContext {
    file: String,
    start_line: u32,
    end_line: u32,
    content: String,
}

impl ThemeContext {
    fn brief(theme: &ConsolidatedTheme) -> Self {
        Self {
            index: None,
            name: theme.name.clone(),
            description: truncate_str(&theme.description, MAX_DESCRIPTION_CHARS).to_string(),
            level: theme.level,
            files: theme.affected_files.clone(),
            code: Vec::new(),
        }
    }

    fn full(theme: &ConsolidatedTheme) -> Self {
        let mut context = Self::brief(theme);
        context.code = theme
            .code_snippets
            .iter()
            .map(|s| {
                let mut content = s
                    .content
                    .lines()
                    .take(MAX_SNIPPET_LINES)
                    .collect::<Vec<_>>()
                    .join("\n");
                if s.content.lines().count() > MAX_SNIPPET_LINES {
                    content.push_str("\n...");
                }
                CodeContext {
                    file: s.file.clone(),
                    start_line: s.start_line,
                    end_line: s.end_line,
                    content,
                }
            })
            .collect();
        context
    }

    fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

#[derive(Serialize)]
struct PairContext {
    index: usize,
    first: ThemeContext,
    second: ThemeContext,
}

#[derive(Deserialize)]
struct SimilarityResponse {
    verdicts: Vec<WireSimilarity>,
}

#[derive(Deserialize)]
struct WireSimilarity {
    index: usize,
    combined_score: f64,
    #[serde(default)]
    name_score: Option<f64>,
    #[serde(default)]
    file_score: Option<f64>,
    should_merge: bool,
    #[serde(default)]
    reasoning: String,
}

impl WireSimilarity {
    fn into_verdict(self) -> SimilarityVerdict {
        SimilarityVerdict {
            combined_score: self.combined_score.clamp(0.0, 1.0),
            name_score: self.name_score.map(|s| s.clamp(0.0, 1.0)),
            file_score: self.file_score.map(|s| s.clamp(0.0, 1.0)),
            should_merge: self.should_merge,
            reasoning: self.reasoning,
        }
    }
}

#[derive(Deserialize)]
struct DomainResponse {
    themes: Vec<WireDomain>,
}

#[derive(Deserialize)]
struct WireDomain {
    index: usize,
    domain: String,
    confidence: f64,
}

#[derive(Deserialize)]
struct DuplicatesResponse {
    groups: Vec<DuplicateGroup>,
}

fn similarity_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "verdicts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "index": { "type": "integer" },
                        "combined_score": { "type": "number" },
                        "name_score": { "type": "number" },
                        "file_score": { "type": "number" },
                        "should_merge": { "type": "boolean" },
                        "reasoning": { "type": "string" }
                    },
                    "required": ["index", "combined_score", "name_score", "file_score", "should_merge", "reasoning"]
                }
            }
        },
        "required": ["verdicts"]
    })
}

fn domain_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "themes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "index": { "type": "integer" },
                        "domain": { "type": "string" },
                        "confidence": { "type": "number" }
                    },
                    "required": ["index", "domain", "confidence"]
                }
            }
        },
        "required": ["themes"]
    })
}

fn expansion_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "should_expand": { "type": "boolean" },
            "is_atomic": { "type": "boolean" },
            "confidence": { "type": "number" },
            "reasoning": { "type": "string" },
            "children": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "business_value": { "type": "string" },
                        "technical_purpose": { "type": "string" },
                        "rationale": { "type": "string" },
                        "assigned_code": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "additionalProperties": false,
                                "properties": {
                                    "file": { "type": "string" },
                                    "start_line": { "type": ["integer", "null"] },
                                    "end_line": { "type": ["integer", "null"] }
                                },
                                "required": ["file", "start_line", "end_line"]
                            }
                        }
                    },
                    "required": ["name", "description", "business_value", "technical_purpose", "rationale", "assigned_code"]
                }
            }
        },
        "required": ["should_expand", "is_atomic", "confidence", "reasoning", "children"]
    })
}

fn duplicates_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "groups": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "indices": { "type": "array", "items": { "type": "integer" } },
                        "reasoning": { "type": "string" }
                    },
                    "required": ["indices", "reasoning"]
                }
            }
        },
        "required": ["groups"]
    })
}

fn summary_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "name": { "type": "string" },
            "description": { "type": "string" }
        },
        "required": ["name", "description"]
    })
}

fn relationship_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "relationship": { "type": "string", "enum": ["duplicate", "overlap", "related", "distinct"] },
            "action": { "type": "string", "enum": ["merge_up", "merge_down", "merge_sibling", "keep_separate"] },
            "score": { "type": "number" },
            "reasoning": { "type": "string" }
        },
        "required": ["relationship", "action", "score", "reasoning"]
    })
}
