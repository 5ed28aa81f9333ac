//! Run metrics and the call-counting oracle decorator.

use crate::oracle::{
    DomainVerdict, DuplicateGroup, ExpansionDecision, FailureKind, GroupSummary, Judgment, Oracle,
    OracleFuture, RelationshipVerdict, SharedOracle, SimilarityVerdict, ThemePair,
};
use crate::theme::ConsolidatedTheme;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::error;

/// What one pipeline run did, for observability consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EffectivenessMetrics {
    pub input_themes: usize,
    pub pairs_total: usize,
    pub pairs_prefiltered: usize,
    pub pairs_analyzed: usize,
    pub cache_hits: usize,
    /// Pairs answered by a concurrent request for the same pair.
    pub pairs_coalesced: usize,
    pub similarity_fallbacks: usize,
    pub merge_groups: usize,
    pub themes_merged: usize,
    pub parents_created: usize,
    pub heuristic_domains: usize,
    pub expansions: usize,
    pub nodes_evaluated: usize,
    pub partition_failures: usize,
    pub depth_cap_hits: usize,
    pub sibling_merges: usize,
    pub cross_level_pairs_considered: usize,
    pub cross_level_prefiltered: usize,
    pub cross_level_merged: usize,
    pub oracle_calls: usize,
    pub oracle_failures: usize,
    pub oracle: OracleCallCounts,
    pub output_roots: usize,
    pub output_nodes: usize,
    pub max_depth: u32,
    pub processing_time_ms: u64,
}

impl EffectivenessMetrics {
    /// Share of input themes folded into another theme during grouping.
    pub fn merge_rate(&self) -> f64 {
        if self.input_themes == 0 {
            0.0
        } else {
            self.themes_merged as f64 / self.input_themes as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub calls: usize,
    pub failures: usize,
}

/// Per-operation call and failure counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OracleCallCounts {
    pub compare_pair: OperationCounts,
    pub compare_batch: OperationCounts,
    pub classify_domains: OperationCounts,
    pub decide_expansion: OperationCounts,
    pub detect_duplicates: OperationCounts,
    pub summarize_group: OperationCounts,
    pub classify_relationship: OperationCounts,
}

impl OracleCallCounts {
    fn all(&self) -> [OperationCounts; 7] {
        [
            self.compare_pair,
            self.compare_batch,
            self.classify_domains,
            self.decide_expansion,
            self.detect_duplicates,
            self.summarize_group,
            self.classify_relationship,
        ]
    }

    /// Counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &OracleCallCounts) -> OracleCallCounts {
        let diff = |now: OperationCounts, then: OperationCounts| OperationCounts {
            calls: now.calls.saturating_sub(then.calls),
            failures: now.failures.saturating_sub(then.failures),
        };
        OracleCallCounts {
            compare_pair: diff(self.compare_pair, earlier.compare_pair),
            compare_batch: diff(self.compare_batch, earlier.compare_batch),
            classify_domains: diff(self.classify_domains, earlier.classify_domains),
            decide_expansion: diff(self.decide_expansion, earlier.decide_expansion),
            detect_duplicates: diff(self.detect_duplicates, earlier.detect_duplicates),
            summarize_group: diff(self.summarize_group, earlier.summarize_group),
            classify_relationship: diff(self.classify_relationship, earlier.classify_relationship),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.all().iter().map(|c| c.calls).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.all().iter().map(|c| c.failures).sum()
    }
}

#[derive(Debug, Default)]
struct OperationCounter {
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl OperationCounter {
    fn snapshot(&self) -> OperationCounts {
        OperationCounts {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Wraps an oracle, counting calls and failures per operation.
///
/// The first configuration failure is logged as an error and remembered;
/// later ones are only counted, so a missing credential produces one message
/// instead of one per pair.
pub struct CountingOracle {
    inner: SharedOracle,
    compare_pair: OperationCounter,
    compare_batch: OperationCounter,
    classify_domains: OperationCounter,
    decide_expansion: OperationCounter,
    detect_duplicates: OperationCounter,
    summarize_group: OperationCounter,
    classify_relationship: OperationCounter,
    configuration_logged: AtomicBool,
    configuration_failures: AtomicUsize,
    first_configuration_error: Mutex<Option<String>>,
}

impl CountingOracle {
    pub fn new(inner: SharedOracle) -> Self {
        Self {
            inner,
            compare_pair: OperationCounter::default(),
            compare_batch: OperationCounter::default(),
            classify_domains: OperationCounter::default(),
            decide_expansion: OperationCounter::default(),
            detect_duplicates: OperationCounter::default(),
            summarize_group: OperationCounter::default(),
            classify_relationship: OperationCounter::default(),
            configuration_logged: AtomicBool::new(false),
            configuration_failures: AtomicUsize::new(0),
            first_configuration_error: Mutex::new(None),
        }
    }

    pub fn counts(&self) -> OracleCallCounts {
        OracleCallCounts {
            compare_pair: self.compare_pair.snapshot(),
            compare_batch: self.compare_batch.snapshot(),
            classify_domains: self.classify_domains.snapshot(),
            decide_expansion: self.decide_expansion.snapshot(),
            detect_duplicates: self.detect_duplicates.snapshot(),
            summarize_group: self.summarize_group.snapshot(),
            classify_relationship: self.classify_relationship.snapshot(),
        }
    }

    pub fn configuration_failures(&self) -> usize {
        self.configuration_failures.load(Ordering::Relaxed)
    }

    /// Reason of the first configuration failure seen, if any.
    pub fn configuration_error(&self) -> Option<String> {
        match self.first_configuration_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record_configuration(&self, operation: &'static str, reason: &str) {
        self.configuration_failures.fetch_add(1, Ordering::Relaxed);
        if self.configuration_logged.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(operation, %reason, "oracle is misconfigured; further configuration failures are counted silently");
        let mut slot = match self.first_configuration_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.get_or_insert_with(|| reason.to_string());
    }

    fn track<'a, T: Send + 'a>(
        &'a self,
        operation: &'static str,
        counter: &'a OperationCounter,
        call: OracleFuture<'a, T>,
    ) -> OracleFuture<'a, T> {
        Box::pin(async move {
            counter.calls.fetch_add(1, Ordering::Relaxed);
            let judgment = call.await;
            if let Judgment::Failure { kind, reason } = &judgment {
                counter.failures.fetch_add(1, Ordering::Relaxed);
                if *kind == FailureKind::Configuration {
                    self.record_configuration(operation, reason);
                }
            }
            judgment
        })
    }
}

impl Oracle for CountingOracle {
    fn check_ready(&self) -> Result<(), String> {
        self.inner.check_ready()
    }

    fn compare_pair<'a>(&'a self, pair: ThemePair<'a>) -> OracleFuture<'a, SimilarityVerdict> {
        self.track("compare_pair", &self.compare_pair, self.inner.compare_pair(pair))
    }

    fn compare_batch<'a>(&'a self, pairs: &'a [ThemePair<'a>]) -> OracleFuture<'a, Vec<SimilarityVerdict>> {
        self.track("compare_batch", &self.compare_batch, self.inner.compare_batch(pairs))
    }

    fn classify_domains<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DomainVerdict>> {
        self.track("classify_domains", &self.classify_domains, self.inner.classify_domains(themes))
    }

    fn decide_expansion<'a>(&'a self, node: &'a ConsolidatedTheme, depth: u32) -> OracleFuture<'a, ExpansionDecision> {
        self.track("decide_expansion", &self.decide_expansion, self.inner.decide_expansion(node, depth))
    }

    fn detect_duplicates<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DuplicateGroup>> {
        self.track("detect_duplicates", &self.detect_duplicates, self.inner.detect_duplicates(themes))
    }

    fn summarize_group<'a>(
        &'a self,
        themes: &'a [&'a ConsolidatedTheme],
        domain: Option<&'a str>,
    ) -> OracleFuture<'a, GroupSummary> {
        self.track("summarize_group", &self.summarize_group, self.inner.summarize_group(themes, domain))
    }

    fn classify_relationship<'a>(
        &'a self,
        higher: &'a ConsolidatedTheme,
        lower: &'a ConsolidatedTheme,
    ) -> OracleFuture<'a, RelationshipVerdict> {
        self.track(
            "classify_relationship",
            &self.classify_relationship,
            self.inner.classify_relationship(higher, lower),
        )
    }
}
