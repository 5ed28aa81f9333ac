//! Programmable oracle for tests.
//!
//! Every operation answers from a closure (heuristics by default) and is
//! counted, so tests can assert both on the judgments the engine received and
//! on how many oracle calls it made.

use super::{
    DomainVerdict, DuplicateGroup, ExpansionDecision, FailureKind, GroupSummary, Judgment, Oracle,
    OracleFuture, RelationshipVerdict, SimilarityVerdict, ThemePair,
};
use crate::heuristics;
use crate::theme::ConsolidatedTheme;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type SimilarityFn = Box<dyn Fn(&ConsolidatedTheme, &ConsolidatedTheme) -> Judgment<SimilarityVerdict> + Send + Sync>;
type DomainFn = Box<dyn Fn(&ConsolidatedTheme) -> Judgment<DomainVerdict> + Send + Sync>;
type ExpansionFn = Box<dyn Fn(&ConsolidatedTheme, u32) -> Judgment<ExpansionDecision> + Send + Sync>;
type DuplicatesFn = Box<dyn Fn(&[&ConsolidatedTheme]) -> Judgment<Vec<DuplicateGroup>> + Send + Sync>;
type SummaryFn = Box<dyn Fn(&[&ConsolidatedTheme], Option<&str>) -> Judgment<GroupSummary> + Send + Sync>;
type RelationshipFn =
    Box<dyn Fn(&ConsolidatedTheme, &ConsolidatedTheme) -> Judgment<RelationshipVerdict> + Send + Sync>;

#[derive(Debug, Default)]
pub struct CallCounts {
    pub compare_pair: AtomicUsize,
    pub compare_batch: AtomicUsize,
    /// Individual pairs seen across both similarity operations.
    pub pairs: AtomicUsize,
    pub classify_domains: AtomicUsize,
    pub decide_expansion: AtomicUsize,
    pub detect_duplicates: AtomicUsize,
    pub summarize_group: AtomicUsize,
    pub classify_relationship: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

pub struct ScriptedOracle {
    similarity: SimilarityFn,
    domains: DomainFn,
    expansion: ExpansionFn,
    duplicates: DuplicatesFn,
    summary: SummaryFn,
    relationship: RelationshipFn,
    fail_batches: bool,
    fail_all: Option<FailureKind>,
    not_ready: Option<String>,
    delay: Option<Duration>,
    pub calls: CallCounts,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    /// Heuristic answers for every operation.
    pub fn new() -> Self {
        Self {
            similarity: Box::new(|a, b| Judgment::Success(heuristics::similarity_verdict(a, b))),
            domains: Box::new(|t| Judgment::Success(heuristics::domain_verdict(t))),
            expansion: Box::new(|_, _| Judgment::Success(ExpansionDecision::atomic(0.9, "scripted"))),
            duplicates: Box::new(|_| Judgment::Success(Vec::new())),
            summary: Box::new(|themes, domain| {
                Judgment::Success(match domain {
                    Some(domain) => heuristics::domain_parent_summary(domain, themes),
                    None => heuristics::group_summary(themes),
                })
            }),
            relationship: Box::new(|h, l| Judgment::Success(heuristics::relationship_verdict(h, l))),
            fail_batches: false,
            fail_all: None,
            not_ready: None,
            delay: None,
            calls: CallCounts::default(),
        }
    }

    /// Every operation fails with `kind`.
    pub fn failing(kind: FailureKind) -> Self {
        Self {
            fail_all: Some(kind),
            ..Self::new()
        }
    }

    pub fn with_similarity(
        mut self,
        f: impl Fn(&ConsolidatedTheme, &ConsolidatedTheme) -> Judgment<SimilarityVerdict> + Send + Sync + 'static,
    ) -> Self {
        self.similarity = Box::new(f);
        self
    }

    /// Fixed combined score for every pair.
    pub fn with_score(self, score: f64) -> Self {
        self.with_similarity(move |_, _| Judgment::Success(verdict(score)))
    }

    pub fn with_domains(
        mut self,
        f: impl Fn(&ConsolidatedTheme) -> Judgment<DomainVerdict> + Send + Sync + 'static,
    ) -> Self {
        self.domains = Box::new(f);
        self
    }

    pub fn with_expansion(
        mut self,
        f: impl Fn(&ConsolidatedTheme, u32) -> Judgment<ExpansionDecision> + Send + Sync + 'static,
    ) -> Self {
        self.expansion = Box::new(f);
        self
    }

    pub fn with_duplicates(
        mut self,
        f: impl Fn(&[&ConsolidatedTheme]) -> Judgment<Vec<DuplicateGroup>> + Send + Sync + 'static,
    ) -> Self {
        self.duplicates = Box::new(f);
        self
    }

    pub fn with_summary(
        mut self,
        f: impl Fn(&[&ConsolidatedTheme], Option<&str>) -> Judgment<GroupSummary> + Send + Sync + 'static,
    ) -> Self {
        self.summary = Box::new(f);
        self
    }

    pub fn with_relationship(
        mut self,
        f: impl Fn(&ConsolidatedTheme, &ConsolidatedTheme) -> Judgment<RelationshipVerdict> + Send + Sync + 'static,
    ) -> Self {
        self.relationship = Box::new(f);
        self
    }

    /// Batched similarity calls fail; single-pair calls still answer.
    pub fn failing_batches(mut self) -> Self {
        self.fail_batches = true;
        self
    }

    pub fn not_ready(mut self, reason: &str) -> Self {
        self.not_ready = Some(reason.to_string());
        self
    }

    /// Sleep before answering, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn scripted_failure<T>(&self) -> Option<Judgment<T>> {
        self.fail_all
            .map(|kind| Judgment::failure(kind, "scripted failure"))
    }
}

/// Similarity verdict with the given combined score.
pub fn verdict(score: f64) -> SimilarityVerdict {
    SimilarityVerdict {
        combined_score: score,
        name_score: None,
        file_score: None,
        should_merge: score >= 0.7,
        reasoning: "scripted".to_string(),
    }
}

impl Oracle for ScriptedOracle {
    fn check_ready(&self) -> Result<(), String> {
        match &self.not_ready {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn compare_pair<'a>(&'a self, pair: ThemePair<'a>) -> OracleFuture<'a, SimilarityVerdict> {
        Box::pin(async move {
            bump(&self.calls.compare_pair);
            bump(&self.calls.pairs);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            (self.similarity)(pair.first, pair.second)
        })
    }

    fn compare_batch<'a>(&'a self, pairs: &'a [ThemePair<'a>]) -> OracleFuture<'a, Vec<SimilarityVerdict>> {
        Box::pin(async move {
            bump(&self.calls.compare_batch);
            self.calls.pairs.fetch_add(pairs.len(), Ordering::SeqCst);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            if self.fail_batches {
                return Judgment::failure(FailureKind::Unavailable, "scripted batch failure");
            }
            let mut out = Vec::with_capacity(pairs.len());
            for pair in pairs {
                match (self.similarity)(pair.first, pair.second) {
                    Judgment::Success(v) => out.push(v),
                    Judgment::Failure { kind, reason } => return Judgment::Failure { kind, reason },
                }
            }
            Judgment::Success(out)
        })
    }

    fn classify_domains<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DomainVerdict>> {
        Box::pin(async move {
            bump(&self.calls.classify_domains);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            let mut out = Vec::with_capacity(themes.len());
            for theme in themes {
                match (self.domains)(*theme) {
                    Judgment::Success(v) => out.push(v),
                    Judgment::Failure { kind, reason } => return Judgment::Failure { kind, reason },
                }
            }
            Judgment::Success(out)
        })
    }

    fn decide_expansion<'a>(&'a self, node: &'a ConsolidatedTheme, depth: u32) -> OracleFuture<'a, ExpansionDecision> {
        Box::pin(async move {
            bump(&self.calls.decide_expansion);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            (self.expansion)(node, depth)
        })
    }

    fn detect_duplicates<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DuplicateGroup>> {
        Box::pin(async move {
            bump(&self.calls.detect_duplicates);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            (self.duplicates)(themes)
        })
    }

    fn summarize_group<'a>(
        &'a self,
        themes: &'a [&'a ConsolidatedTheme],
        domain: Option<&'a str>,
    ) -> OracleFuture<'a, GroupSummary> {
        Box::pin(async move {
            bump(&self.calls.summarize_group);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            (self.summary)(themes, domain)
        })
    }

    fn classify_relationship<'a>(
        &'a self,
        higher: &'a ConsolidatedTheme,
        lower: &'a ConsolidatedTheme,
    ) -> OracleFuture<'a, RelationshipVerdict> {
        Box::pin(async move {
            bump(&self.calls.classify_relationship);
            self.pause().await;
            if let Some(failure) = self.scripted_failure() {
                return failure;
            }
            (self.relationship)(higher, lower)
        })
    }
}
