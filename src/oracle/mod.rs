//! Judgment oracle contract
//!
//! Every expensive decision the engine makes (similarity, business domain,
//! expand-or-atomic, duplicate detection, naming, cross-level relationships) is
//! delegated to an [`Oracle`]. Each call answers with a [`Judgment`]: either a
//! payload or a failure reason. Callers treat a failure exactly like a
//! low-confidence or negative answer.

pub mod client;
pub mod heuristic;
pub mod llm;
pub mod models;
pub mod prompts;
#[cfg(test)]
pub(crate) mod scripted;

use crate::theme::{ConsolidatedTheme, LineRange};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use heuristic::HeuristicOracle;
pub use llm::LlmOracle;

/// Why an oracle call produced no usable answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// Timeout, network or provider error.
    Unavailable,
    /// The response could not be parsed or did not match the request.
    Malformed,
    /// The oracle cannot work at all (e.g. missing credentials).
    Configuration,
}

/// Outcome of one oracle call.
#[derive(Debug, Clone, PartialEq)]
pub enum Judgment<T> {
    Success(T),
    Failure { kind: FailureKind, reason: String },
}

impl<T> Judgment<T> {
    pub fn failure(kind: FailureKind, reason: impl Into<String>) -> Self {
        Judgment::Failure {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Judgment::Success(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Judgment::Success(value) => Some(value),
            Judgment::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Judgment::Success(_) => None,
            Judgment::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Judgment<U> {
        match self {
            Judgment::Success(value) => Judgment::Success(f(value)),
            Judgment::Failure { kind, reason } => Judgment::Failure { kind, reason },
        }
    }

    /// Payload, or the fallback computed from the failure reason.
    pub fn unwrap_or_else(self, fallback: impl FnOnce(FailureKind, &str) -> T) -> T {
        match self {
            Judgment::Success(value) => value,
            Judgment::Failure { kind, reason } => fallback(kind, &reason),
        }
    }

    /// Classify an `anyhow` error from the transport layer.
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Judgment::Success(value),
            Err(err) => {
                let message = err.to_string();
                let lower = message.to_lowercase();
                let kind = if lower.contains("api key") {
                    FailureKind::Configuration
                } else if lower.contains("parse") || lower.contains("empty response") {
                    FailureKind::Malformed
                } else {
                    FailureKind::Unavailable
                };
                Judgment::Failure {
                    kind,
                    reason: message,
                }
            }
        }
    }
}

/// Similarity judgment for one unordered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityVerdict {
    pub combined_score: f64,
    #[serde(default)]
    pub name_score: Option<f64>,
    #[serde(default)]
    pub file_score: Option<f64>,
    pub should_merge: bool,
    #[serde(default)]
    pub reasoning: String,
}

/// Two themes to compare. Order carries no meaning.
#[derive(Debug, Clone, Copy)]
pub struct ThemePair<'a> {
    pub first: &'a ConsolidatedTheme,
    pub second: &'a ConsolidatedTheme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainVerdict {
    pub domain: String,
    pub confidence: f64,
}

/// Code claimed by one proposed child: a line range of a file, or the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedCode {
    pub file: String,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

impl AssignedCode {
    pub fn lines(file: impl Into<String>, range: LineRange) -> Self {
        Self {
            file: file.into(),
            start_line: Some(range.start),
            end_line: Some(range.end),
        }
    }

    pub fn whole_file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            start_line: None,
            end_line: None,
        }
    }

    /// `None` means the whole file. A half-open span is taken as a single line.
    pub fn range(&self) -> Option<LineRange> {
        match (self.start_line, self.end_line) {
            (None, None) => None,
            (Some(start), None) => Some(LineRange::new(start, start)),
            (None, Some(end)) => Some(LineRange::new(end, end)),
            (Some(start), Some(end)) => Some(LineRange::new(start, end)),
        }
    }
}

/// One proposed child of an expanding node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildAssignment {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub business_value: String,
    #[serde(default)]
    pub technical_purpose: String,
    #[serde(default)]
    pub assigned_code: Vec<AssignedCode>,
    #[serde(default)]
    pub rationale: String,
}

/// Whether a node should be decomposed, and into what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionDecision {
    pub should_expand: bool,
    pub is_atomic: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub children: Vec<ChildAssignment>,
}

impl ExpansionDecision {
    pub fn atomic(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            should_expand: false,
            is_atomic: true,
            confidence,
            reasoning: reasoning.into(),
            children: Vec::new(),
        }
    }
}

/// Indices (into the request slice) of themes judged to be the same change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub indices: Vec<usize>,
    #[serde(default)]
    pub reasoning: String,
}

/// Unified wording for a group of themes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Duplicate,
    Overlap,
    Related,
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    MergeUp,
    MergeDown,
    MergeSibling,
    KeepSeparate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipVerdict {
    pub relationship: Relationship,
    pub action: MergeAction,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

pub type OracleFuture<'a, T> = Pin<Box<dyn Future<Output = Judgment<T>> + Send + 'a>>;

/// The external judgment service.
pub trait Oracle: Send + Sync {
    /// Fail fast when no call could possibly succeed.
    fn check_ready(&self) -> Result<(), String> {
        Ok(())
    }

    fn compare_pair<'a>(&'a self, pair: ThemePair<'a>) -> OracleFuture<'a, SimilarityVerdict>;

    /// One verdict per pair, in request order.
    fn compare_batch<'a>(&'a self, pairs: &'a [ThemePair<'a>]) -> OracleFuture<'a, Vec<SimilarityVerdict>>;

    /// One verdict per theme, in request order.
    fn classify_domains<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DomainVerdict>>;

    fn decide_expansion<'a>(&'a self, node: &'a ConsolidatedTheme, depth: u32) -> OracleFuture<'a, ExpansionDecision>;

    fn detect_duplicates<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DuplicateGroup>>;

    /// Unified name/description for merged themes, or for a domain parent when `domain` is set.
    fn summarize_group<'a>(
        &'a self,
        themes: &'a [&'a ConsolidatedTheme],
        domain: Option<&'a str>,
    ) -> OracleFuture<'a, GroupSummary>;

    /// Relationship between a more general node and a more specific one.
    fn classify_relationship<'a>(
        &'a self,
        higher: &'a ConsolidatedTheme,
        lower: &'a ConsolidatedTheme,
    ) -> OracleFuture<'a, RelationshipVerdict>;
}

pub type SharedOracle = Arc<dyn Oracle>;

/// Run `call` up to `attempts` times with exponential backoff starting at
/// `backoff_ms`. Configuration failures are returned immediately.
pub async fn with_retry<T, F, Fut>(attempts: u32, backoff_ms: u64, mut call: F) -> Judgment<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Judgment<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Judgment::Success(value) => return Judgment::Success(value),
            Judgment::Failure { kind, reason } => {
                if kind == FailureKind::Configuration || attempt >= attempts {
                    return Judgment::Failure { kind, reason };
                }
                let delay = backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                debug!(attempt, attempts, delay_ms = delay, %reason, "oracle call failed; retrying");
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                attempt += 1;
            }
        }
    }
}
