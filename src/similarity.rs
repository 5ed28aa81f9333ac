//! Pairwise similarity engine
//!
//! Produces a similarity record for every unordered pair of themes:
//! 1. Pairs with no shared file and near-zero name similarity are excluded
//!    lexically (the only non-oracle shortcut).
//! 2. Cached judgments are reused, and pairs another caller is already
//!    judging are awaited rather than sent again.
//! 3. The rest are claimed, batched and sent to the oracle under a
//!    concurrency limit, with retry. A batch that keeps failing is retried
//!    pair by pair, and a pair that still fails gets a conservative
//!    keep-separate record.

use crate::cache::{PairKey, PairLookup, PairTicket, RecordSource, SimilarityCache, SimilarityRecord};
use crate::config::ConsolidationConfig;
use crate::heuristics::keep_separate;
use crate::oracle::{with_retry, FailureKind, Judgment, Oracle, SimilarityVerdict, ThemePair};
use crate::text::{name_similarity, shares_any_file};
use crate::theme::ConsolidatedTheme;
use futures::future::{join, join_all};
use rayon::prelude::*;
use std::collections::HashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Below this many pairs the pre-filter runs on the calling thread.
const PARALLEL_PREFILTER_MIN_PAIRS: usize = 2_000;

/// Pair counts up to this size go out as a single batch.
const SINGLE_BATCH_MAX: usize = 8;

pub type SimilarityMap = HashMap<PairKey, SimilarityRecord>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimilarityStats {
    pub pairs_total: usize,
    pub prefiltered: usize,
    pub cache_hits: usize,
    /// Pairs answered by a concurrent request for the same pair.
    pub coalesced: usize,
    /// Pairs answered by the oracle in this run.
    pub analyzed: usize,
    pub batches: usize,
    pub batch_failures: usize,
    /// Pairs that ended with the conservative default.
    pub fallbacks: usize,
    pub configuration_failure: bool,
}

#[derive(Debug, Default)]
pub struct SimilarityReport {
    pub records: SimilarityMap,
    pub stats: SimilarityStats,
}

/// Batch size for `pair_count` pairs: one batch for small counts, otherwise
/// enough per batch to land near `target_batch_count` batches, capped at
/// `max_batch_size`. Non-decreasing in `pair_count`.
pub fn batch_size(pair_count: usize, config: &ConsolidationConfig) -> usize {
    let cap = config.max_batch_size.max(1);
    if pair_count <= SINGLE_BATCH_MAX {
        return pair_count.clamp(1, cap);
    }
    let target = config.target_batch_count.max(1);
    pair_count.div_ceil(target).max(SINGLE_BATCH_MAX).min(cap)
}

/// True when the pair can be excluded without asking the oracle.
pub fn trivially_excluded(a: &ConsolidatedTheme, b: &ConsolidatedTheme, name_threshold: f64) -> bool {
    !shares_any_file(&a.affected_files, &b.affected_files) && name_similarity(&a.name, &b.name) < name_threshold
}

/// Split all index pairs `(i, j)`, `i < j`, into (candidates, excluded).
pub fn prefilter_pairs(
    themes: &[ConsolidatedTheme],
    name_threshold: f64,
) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let n = themes.len();
    let all: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect();
    let excluded = |&(i, j): &(usize, usize)| trivially_excluded(&themes[i], &themes[j], name_threshold);

    let (skipped, candidates): (Vec<_>, Vec<_>) = if all.len() >= PARALLEL_PREFILTER_MIN_PAIRS {
        all.into_par_iter().partition(excluded)
    } else {
        all.into_iter().partition(excluded)
    };
    (candidates, skipped)
}

fn prefilter_record(a: &ConsolidatedTheme, b: &ConsolidatedTheme) -> SimilarityRecord {
    let verdict = SimilarityVerdict {
        combined_score: 0.0,
        name_score: Some(name_similarity(&a.name, &b.name)),
        file_score: Some(0.0),
        should_merge: false,
        reasoning: "no shared files and unrelated names".to_string(),
    };
    SimilarityRecord::from_verdict(PairKey::new(&a.id, &b.id), verdict, RecordSource::Prefilter)
}

fn fallback_record(a: &ConsolidatedTheme, b: &ConsolidatedTheme, reason: &str) -> SimilarityRecord {
    SimilarityRecord::from_verdict(
        PairKey::new(&a.id, &b.id),
        keep_separate(&format!("oracle unavailable: {}", reason)),
        RecordSource::Fallback,
    )
}

async fn judge_pair(a: &ConsolidatedTheme, b: &ConsolidatedTheme, oracle: &dyn Oracle) -> Option<SimilarityRecord> {
    let key = PairKey::new(&a.id, &b.id);
    match oracle.compare_pair(ThemePair { first: a, second: b }).await {
        Judgment::Success(verdict) => Some(SimilarityRecord::from_verdict(key, verdict, RecordSource::Oracle)),
        Judgment::Failure { reason, .. } => {
            debug!(pair = %key, %reason, "single-pair similarity failed");
            None
        }
    }
}

/// Similarity for one pair through the cache. Concurrent identical requests
/// share one oracle call; on failure the keep-separate default is returned
/// (and not cached).
pub async fn compare_cached(
    a: &ConsolidatedTheme,
    b: &ConsolidatedTheme,
    oracle: &dyn Oracle,
    cache: &SimilarityCache,
) -> (SimilarityRecord, bool) {
    let key = PairKey::new(&a.id, &b.id);
    match cache.get_or_compute(&key, || judge_pair(a, b, oracle)).await {
        Some(record) => (record, true),
        None => (fallback_record(a, b, "single-pair call failed"), false),
    }
}

/// A candidate pair this call has claimed in the cache.
struct OwnedPair<'c> {
    first: usize,
    second: usize,
    ticket: PairTicket<'c>,
}

#[derive(Default)]
struct BatchOutcome {
    records: Vec<SimilarityRecord>,
    analyzed: usize,
    fallbacks: usize,
    failed: bool,
    configuration_failure: bool,
}

async fn run_batch(
    batch: Vec<OwnedPair<'_>>,
    themes: &[ConsolidatedTheme],
    oracle: &dyn Oracle,
    config: &ConsolidationConfig,
) -> BatchOutcome {
    let pairs: Vec<ThemePair<'_>> = batch
        .iter()
        .map(|owned| ThemePair {
            first: &themes[owned.first],
            second: &themes[owned.second],
        })
        .collect();
    let pairs_ref = &pairs[..];

    let judgment = with_retry(config.retry_attempts, config.retry_backoff_ms, move || {
        oracle.compare_batch(pairs_ref)
    })
    .await;

    match judgment {
        Judgment::Success(verdicts) if verdicts.len() == pairs.len() => {
            let mut outcome = BatchOutcome::default();
            for (owned, verdict) in batch.into_iter().zip(verdicts) {
                let record = SimilarityRecord::from_verdict(owned.ticket.key().clone(), verdict, RecordSource::Oracle);
                owned.ticket.resolve(Some(record.clone()));
                outcome.records.push(record);
            }
            outcome.analyzed = outcome.records.len();
            outcome
        }
        Judgment::Success(verdicts) => {
            let reason = format!("expected {} verdicts, got {}", pairs.len(), verdicts.len());
            fall_back_per_pair(batch, themes, FailureKind::Malformed, &reason, oracle).await
        }
        Judgment::Failure { kind, reason } => fall_back_per_pair(batch, themes, kind, &reason, oracle).await,
    }
}

async fn fall_back_per_pair(
    batch: Vec<OwnedPair<'_>>,
    themes: &[ConsolidatedTheme],
    kind: FailureKind,
    reason: &str,
    oracle: &dyn Oracle,
) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        failed: true,
        ..BatchOutcome::default()
    };

    if kind == FailureKind::Configuration {
        // Every further call would fail the same way.
        outcome.configuration_failure = true;
        outcome.fallbacks = batch.len();
        for owned in batch {
            owned.ticket.resolve(None);
            outcome
                .records
                .push(fallback_record(&themes[owned.first], &themes[owned.second], reason));
        }
        return outcome;
    }

    warn!(
        pairs = batch.len(),
        ?kind,
        %reason,
        "similarity batch failed after retries; retrying pairs individually"
    );
    let results = join_all(batch.into_iter().map(|owned| async move {
        let (a, b) = (&themes[owned.first], &themes[owned.second]);
        let result = judge_pair(a, b, oracle).await;
        owned.ticket.resolve(result.clone());
        result.ok_or_else(|| fallback_record(a, b, "single-pair call failed"))
    }))
    .await;

    for result in results {
        match result {
            Ok(record) => {
                outcome.analyzed += 1;
                outcome.records.push(record);
            }
            Err(fallback) => {
                outcome.fallbacks += 1;
                outcome.records.push(fallback);
            }
        }
    }
    outcome
}

/// Similarity records for every unordered pair of `themes`. Never partial.
pub async fn compute_similarities(
    themes: &[ConsolidatedTheme],
    oracle: &dyn Oracle,
    cache: &SimilarityCache,
    config: &ConsolidationConfig,
) -> SimilarityReport {
    let mut report = SimilarityReport::default();
    let n = themes.len();
    report.stats.pairs_total = n * n.saturating_sub(1) / 2;
    if n < 2 {
        return report;
    }

    let (candidates, excluded) = prefilter_pairs(themes, config.prefilter_name_threshold);
    report.stats.prefiltered = excluded.len();
    for (i, j) in excluded {
        let record = prefilter_record(&themes[i], &themes[j]);
        report.records.insert(record.key.clone(), record);
    }

    let mut owned = Vec::with_capacity(candidates.len());
    let mut pending = Vec::new();
    for (i, j) in candidates {
        match cache.claim(&PairKey::new(&themes[i].id, &themes[j].id)) {
            PairLookup::Cached(record) => {
                report.stats.cache_hits += 1;
                report.records.insert(record.key.clone(), record);
            }
            PairLookup::Owned(ticket) => owned.push(OwnedPair {
                first: i,
                second: j,
                ticket,
            }),
            PairLookup::InFlight(wait) => pending.push((i, j, wait)),
        }
    }

    let size = batch_size(owned.len(), config);
    let mut batches: Vec<Vec<OwnedPair<'_>>> = Vec::new();
    let mut rest = owned.into_iter().peekable();
    while rest.peek().is_some() {
        batches.push(rest.by_ref().take(size).collect());
    }
    report.stats.batches = batches.len();
    if !batches.is_empty() {
        debug!(
            pairs = batches.iter().map(Vec::len).sum::<usize>(),
            batch_size = size,
            batches = batches.len(),
            awaiting = pending.len(),
            "submitting similarity batches"
        );
    }

    let semaphore = Semaphore::new(config.max_concurrency.max(1));
    let batch_runs = join_all(batches.into_iter().map(|batch| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.ok();
            run_batch(batch, themes, oracle, config).await
        }
    }));
    let waits = join_all(
        pending
            .into_iter()
            .map(|(i, j, wait)| async move { (i, j, wait.wait().await) }),
    );
    let (outcomes, waited) = join(batch_runs, waits).await;

    for outcome in outcomes {
        report.stats.analyzed += outcome.analyzed;
        report.stats.fallbacks += outcome.fallbacks;
        if outcome.failed {
            report.stats.batch_failures += 1;
        }
        report.stats.configuration_failure |= outcome.configuration_failure;
        for record in outcome.records {
            report.records.insert(record.key.clone(), record);
        }
    }
    for (i, j, result) in waited {
        let record = match result {
            Some(record) => {
                report.stats.coalesced += 1;
                record
            }
            None => {
                report.stats.fallbacks += 1;
                fallback_record(&themes[i], &themes[j], "concurrent request for this pair failed")
            }
        };
        report.records.insert(record.key.clone(), record);
    }

    info!(
        pairs = report.stats.pairs_total,
        prefiltered = report.stats.prefiltered,
        cache_hits = report.stats.cache_hits,
        coalesced = report.stats.coalesced,
        analyzed = report.stats.analyzed,
        fallbacks = report.stats.fallbacks,
        "pairwise similarity complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::scripted::{verdict, ScriptedOracle};
    use crate::theme::fixtures::node;

    fn themes() -> Vec<ConsolidatedTheme> {
        vec![
            node("t1", "Add login form", &["web/login.tsx"]),
            node("t2", "Add login form validation", &["web/login.tsx"]),
            node("t3", "Database migration for users", &["db/migrate.sql"]),
            node("t4", "Update user schema", &["db/migrate.sql", "db/schema.sql"]),
        ]
    }

    #[test]
    fn test_batch_size_steps() {
        let config = ConsolidationConfig::default();
        assert_eq!(batch_size(1, &config), 1);
        assert_eq!(batch_size(8, &config), 8);
        assert_eq!(batch_size(9, &config), 8);
        assert_eq!(batch_size(64, &config), 8);
        assert_eq!(batch_size(100, &config), 13);
        assert_eq!(batch_size(10_000, &config), 20);

        let mut last = 0;
        for n in 1..500 {
            let size = batch_size(n, &config);
            assert!(size >= last, "batch size shrank at {}", n);
            last = size;
        }
    }

    #[test]
    fn test_prefilter_excludes_only_disjoint_unrelated_pairs() {
        let themes = themes();
        let (candidates, excluded) = prefilter_pairs(&themes, 0.1);
        assert_eq!(candidates.len() + excluded.len(), 6);
        assert!(candidates.contains(&(0, 1)));
        assert!(candidates.contains(&(2, 3)));
        // Disjoint files and no shared name tokens.
        assert!(excluded.contains(&(0, 2)));
    }

    #[tokio::test]
    async fn test_every_pair_gets_a_record() {
        let themes = themes();
        let oracle = ScriptedOracle::new().with_score(0.5);
        let cache = SimilarityCache::new(30);
        let report = compute_similarities(&themes, &oracle, &cache, &ConsolidationConfig::for_tests()).await;

        assert_eq!(report.records.len(), 6);
        for i in 0..themes.len() {
            for j in (i + 1)..themes.len() {
                assert!(report.records.contains_key(&PairKey::new(&themes[i].id, &themes[j].id)));
            }
        }
        assert_eq!(report.stats.pairs_total, 6);
        assert_eq!(report.stats.prefiltered + report.stats.analyzed, 6);
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let themes = themes();
        let oracle = ScriptedOracle::new().with_score(0.9);
        let cache = SimilarityCache::new(30);
        let config = ConsolidationConfig::for_tests();

        let first = compute_similarities(&themes, &oracle, &cache, &config).await;
        let pairs_after_first = ScriptedOracle::count(&oracle.calls.pairs);
        let second = compute_similarities(&themes, &oracle, &cache, &config).await;

        assert_eq!(ScriptedOracle::count(&oracle.calls.pairs), pairs_after_first);
        assert_eq!(second.stats.cache_hits, first.stats.analyzed);
        assert_eq!(second.stats.analyzed, 0);
    }

    #[tokio::test]
    async fn test_failed_batches_fall_back_to_single_pairs() {
        let themes = themes();
        let oracle = ScriptedOracle::new().with_score(0.8).failing_batches();
        let cache = SimilarityCache::new(30);
        let config = ConsolidationConfig::for_tests();
        let report = compute_similarities(&themes, &oracle, &cache, &config).await;

        let candidates = 6 - report.stats.prefiltered;
        assert_eq!(report.stats.analyzed, candidates);
        assert_eq!(report.stats.fallbacks, 0);
        assert_eq!(report.stats.batch_failures, 1);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_batch), config.retry_attempts as usize);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_pair), candidates);
        assert!(report
            .records
            .values()
            .filter(|r| r.source == RecordSource::Oracle)
            .all(|r| r.combined_score == 0.8));
    }

    #[tokio::test]
    async fn test_total_oracle_failure_yields_keep_separate_defaults() {
        let themes = themes();
        let oracle = ScriptedOracle::failing(FailureKind::Unavailable);
        let cache = SimilarityCache::new(30);
        let report = compute_similarities(&themes, &oracle, &cache, &ConsolidationConfig::for_tests()).await;

        assert_eq!(report.records.len(), 6);
        assert!(report.records.values().all(|r| !r.should_merge));
        assert_eq!(report.stats.fallbacks, 6 - report.stats.prefiltered);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_configuration_failure_skips_per_pair_calls() {
        let themes = themes();
        let oracle = ScriptedOracle::failing(FailureKind::Configuration);
        let cache = SimilarityCache::new(30);
        let report = compute_similarities(&themes, &oracle, &cache, &ConsolidationConfig::for_tests()).await;

        assert!(report.stats.configuration_failure);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_batch), 1);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_pair), 0);
        assert_eq!(report.records.len(), 6);
    }

    #[tokio::test]
    async fn test_overlapping_runs_judge_each_pair_once() {
        let themes = vec![
            node("a", "Add session cache", &["src/session.rs"]),
            node("b", "Add session caching", &["src/session.rs"]),
        ];
        let oracle = ScriptedOracle::new()
            .with_score(0.9)
            .with_delay(std::time::Duration::from_millis(20));
        let cache = SimilarityCache::new(30);
        let config = ConsolidationConfig::for_tests();

        let (first, second) = tokio::join!(
            compute_similarities(&themes, &oracle, &cache, &config),
            compute_similarities(&themes, &oracle, &cache, &config),
        );

        assert_eq!(ScriptedOracle::count(&oracle.calls.pairs), 1);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_batch), 1);
        assert_eq!(first.stats.analyzed + second.stats.analyzed, 1);
        assert_eq!(first.stats.coalesced + second.stats.coalesced, 1);
        let key = PairKey::new("a", "b");
        assert_eq!(first.records[&key].combined_score, 0.9);
        assert_eq!(second.records[&key].combined_score, 0.9);
    }

    #[tokio::test]
    async fn test_single_pair_lookup_waits_for_running_batch() {
        let themes = vec![
            node("a", "Add session cache", &["src/session.rs"]),
            node("b", "Add session caching", &["src/session.rs"]),
        ];
        let oracle = ScriptedOracle::new()
            .with_score(0.85)
            .with_delay(std::time::Duration::from_millis(20));
        let cache = SimilarityCache::new(30);
        let config = ConsolidationConfig::for_tests();

        let (report, (record, answered)) = tokio::join!(
            compute_similarities(&themes, &oracle, &cache, &config),
            compare_cached(&themes[1], &themes[0], &oracle, &cache),
        );

        assert!(answered);
        assert_eq!(record.combined_score, 0.85);
        assert_eq!(report.stats.analyzed, 1);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_pair), 0);
        assert_eq!(ScriptedOracle::count(&oracle.calls.pairs), 1);
    }

    #[tokio::test]
    async fn test_compare_cached_calls_oracle_once() {
        let a = node("a", "Add cache", &["src/cache.rs"]);
        let b = node("b", "Add cache", &["src/cache.rs"]);
        let oracle = ScriptedOracle::new().with_similarity(|_, _| Judgment::Success(verdict(0.95)));
        let cache = SimilarityCache::new(30);

        let (first, answered) = compare_cached(&a, &b, &oracle, &cache).await;
        let (second, _) = compare_cached(&b, &a, &oracle, &cache).await;
        assert!(answered);
        assert_eq!(first.combined_score, second.combined_score);
        assert_eq!(ScriptedOracle::count(&oracle.calls.compare_pair), 1);
    }
}
