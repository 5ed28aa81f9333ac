//! Cross-level deduplication
//!
//! After expansion, nodes on adjacent levels (and same-level cousins) can
//! describe the same change. Candidate pairs are drawn from the flattened tree,
//! cheap heuristics discard the obvious non-matches, and the oracle classifies
//! the rest. Confident duplicates and overlaps are folded into the more general
//! node.

use crate::config::ConsolidationConfig;
use crate::heuristics::domains_incompatible;
use crate::oracle::{with_retry, Judgment, Oracle, Relationship, RelationshipVerdict};
use crate::text::{name_similarity, shares_any_file, verbs_incompatible};
use crate::theme::{absorb, find_in, flatten, ConsolidatedTheme, FlatNode};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Why a candidate pair never reached the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No shared file and unrelated names.
    NoOverlap,
    DomainMismatch,
    SizeMismatch,
    /// One adds what the other removes.
    VerbConflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrossLevelStats {
    pub pairs_considered: usize,
    pub prefiltered: usize,
    pub analyzed: usize,
    pub oracle_failures: usize,
    pub merged: usize,
}

#[derive(Debug, Default)]
pub struct CrossLevelOutcome {
    pub roots: Vec<ConsolidatedTheme>,
    pub stats: CrossLevelStats,
}

/// A pair of nodes to compare; `higher` is the more general one.
#[derive(Debug, Clone, Copy)]
pub struct CandidatePair<'a> {
    pub higher: &'a ConsolidatedTheme,
    pub lower: &'a ConsolidatedTheme,
}

/// Pairs on the same or adjacent levels, minus siblings and direct
/// parent/child pairs.
pub fn candidate_pairs<'a>(flat: &[FlatNode<'a>]) -> Vec<CandidatePair<'a>> {
    let mut pairs = Vec::new();
    for (i, a) in flat.iter().enumerate() {
        for b in &flat[i + 1..] {
            let (la, lb) = (a.theme.level, b.theme.level);
            if la.abs_diff(lb) > 1 {
                continue;
            }
            let (higher, lower) = if la <= lb { (a, b) } else { (b, a) };
            if la == lb {
                if a.structural_parent == b.structural_parent {
                    continue;
                }
            } else if lower.structural_parent == Some(higher.theme.id.as_str()) {
                continue;
            }
            pairs.push(CandidatePair {
                higher: higher.theme,
                lower: lower.theme,
            });
        }
    }
    pairs
}

/// First heuristic that rules the pair out, if any.
pub fn prefilter(a: &ConsolidatedTheme, b: &ConsolidatedTheme, config: &ConsolidationConfig) -> Option<SkipReason> {
    if !shares_any_file(&a.affected_files, &b.affected_files)
        && name_similarity(&a.name, &b.name) < config.prefilter_name_threshold
    {
        return Some(SkipReason::NoOverlap);
    }
    if domains_incompatible(a, b) {
        return Some(SkipReason::DomainMismatch);
    }
    let (small, large) = {
        let (x, y) = (a.size_hint() as f64, b.size_hint() as f64);
        (x.min(y), x.max(y))
    };
    if large / small.max(1.0) > config.size_mismatch_ratio {
        return Some(SkipReason::SizeMismatch);
    }
    if verbs_incompatible(&a.name, &b.name) {
        return Some(SkipReason::VerbConflict);
    }
    None
}

/// Whether a verdict is strong enough to fold the lower node into the higher one.
pub fn should_merge(verdict: &RelationshipVerdict, threshold: f64) -> bool {
    matches!(verdict.relationship, Relationship::Duplicate | Relationship::Overlap) && verdict.score >= threshold
}

/// Resolve duplicates across levels of `roots`. Merges are applied strongest
/// first; a pair whose nodes were already folded away is skipped.
pub async fn deduplicate_across_levels(
    roots: Vec<ConsolidatedTheme>,
    oracle: &dyn Oracle,
    config: &ConsolidationConfig,
) -> CrossLevelOutcome {
    let mut stats = CrossLevelStats::default();
    if !config.cross_level_dedup {
        return CrossLevelOutcome { roots, stats };
    }

    let mut merges: Vec<(String, String, f64)> = {
        let flat = flatten(&roots);
        let candidates = candidate_pairs(&flat);
        stats.pairs_considered = candidates.len();

        let survivors: Vec<CandidatePair<'_>> = candidates
            .into_iter()
            .filter(|pair| match prefilter(pair.higher, pair.lower, config) {
                Some(reason) => {
                    debug!(higher = %pair.higher.name, lower = %pair.lower.name, ?reason, "cross-level pair skipped");
                    false
                }
                None => true,
            })
            .collect();
        stats.prefiltered = stats.pairs_considered - survivors.len();
        stats.analyzed = survivors.len();

        let semaphore = Semaphore::new(config.max_concurrency.max(1));
        let verdicts = join_all(survivors.iter().map(|pair| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                with_retry(config.retry_attempts, config.retry_backoff_ms, || {
                    oracle.classify_relationship(pair.higher, pair.lower)
                })
                .await
            }
        }))
        .await;

        let mut merges = Vec::new();
        for (pair, judgment) in survivors.iter().zip(verdicts) {
            match judgment {
                Judgment::Success(verdict) if should_merge(&verdict, config.cross_level_threshold) => {
                    merges.push((pair.higher.id.clone(), pair.lower.id.clone(), verdict.score));
                }
                Judgment::Success(_) => {}
                Judgment::Failure { kind, reason } => {
                    stats.oracle_failures += 1;
                    debug!(higher = %pair.higher.name, lower = %pair.lower.name, ?kind, %reason, "relationship classification failed; keeping both");
                }
            }
        }
        merges
    };

    merges.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    let mut roots = roots;
    let mut removed: HashSet<String> = HashSet::new();
    for (target, source, score) in merges {
        if removed.contains(&target) || removed.contains(&source) || find_in(&roots, &source).is_none() {
            continue;
        }
        if absorb(&mut roots, &target, &source) {
            debug!(%target, %source, score, "cross-level duplicate folded into the more general node");
            removed.insert(source);
            stats.merged += 1;
        }
    }

    for root in &mut roots {
        root.relevel(0, None);
    }
    if stats.merged > 0 || stats.analyzed > 0 {
        info!(
            considered = stats.pairs_considered,
            prefiltered = stats.prefiltered,
            analyzed = stats.analyzed,
            merged = stats.merged,
            "cross-level deduplication finished"
        );
    }
    CrossLevelOutcome { roots, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::scripted::ScriptedOracle;
    use crate::oracle::{FailureKind, MergeAction};
    use crate::theme::fixtures::node;
    use crate::theme::{total_nodes, CodeSnippet};

    /// root
    /// ├── a ("Validate cart totals", cart.rs)
    /// │   └── a1 ("Check cart totals", cart.rs)
    /// └── b ("Send receipts", mail.rs)
    ///     └── b1 ("Validate cart totals", cart.rs)
    fn tree() -> Vec<ConsolidatedTheme> {
        let mut a = node("a", "Validate cart totals", &["cart.rs"]);
        a.child_themes.push(node("a1", "Check cart totals", &["cart.rs"]));
        let mut b = node("b", "Send receipts", &["mail.rs"]);
        b.child_themes.push(node("b1", "Validate cart totals", &["cart.rs"]));
        let mut root = node("root", "Checkout", &["cart.rs", "mail.rs"]);
        root.child_themes = vec![a, b];
        root.relevel(0, None);
        vec![root]
    }

    fn ids(pairs: &[CandidatePair<'_>]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|p| (p.higher.id.clone(), p.lower.id.clone()))
            .collect()
    }

    fn verdict(relationship: Relationship, score: f64) -> RelationshipVerdict {
        RelationshipVerdict {
            relationship,
            action: MergeAction::MergeUp,
            score,
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_candidate_pairs_skip_siblings_and_direct_children() {
        let roots = tree();
        let flat = flatten(&roots);
        let pairs = ids(&candidate_pairs(&flat));

        // adjacent levels, not parent/child
        assert!(pairs.contains(&("a".to_string(), "b1".to_string())));
        assert!(pairs.contains(&("b".to_string(), "a1".to_string())));
        // same-level cousins
        assert!(pairs.contains(&("a1".to_string(), "b1".to_string())));
        // siblings and direct parent/child are excluded
        assert!(!pairs.contains(&("a".to_string(), "b".to_string())));
        assert!(!pairs.contains(&("a".to_string(), "a1".to_string())));
        assert!(!pairs.contains(&("root".to_string(), "a".to_string())));
        // two levels apart
        assert!(!pairs.iter().any(|(h, l)| h == "root" && l == "a1"));
    }

    #[test]
    fn test_prefilters() {
        let config = ConsolidationConfig::default();
        let a = node("a", "Validate cart totals", &["cart.rs"]);

        let unrelated = node("x", "Rotate logs", &["logger.rs"]);
        assert_eq!(prefilter(&a, &unrelated, &config), Some(SkipReason::NoOverlap));

        let add = node("p", "Add cart validation", &["cart.rs"]);
        let remove = node("q", "Remove cart validation", &["cart.rs"]);
        assert_eq!(prefilter(&add, &remove, &config), Some(SkipReason::VerbConflict));

        let mut huge = node("h", "Validate cart totals everywhere", &["cart.rs"]);
        huge.code_snippets = vec![CodeSnippet::new("cart.rs", 1, 500, String::new())];
        assert_eq!(prefilter(&a, &huge, &config), Some(SkipReason::SizeMismatch));

        let ui = node("u", "Add cart button component", &["web/components/CartButton.tsx", "cart.rs"]);
        let api = node("v", "Add cart endpoint", &["server/routes/cart.rs", "cart.rs"]);
        assert_eq!(prefilter(&ui, &api, &config), Some(SkipReason::DomainMismatch));

        let same = node("s", "Validate cart totals", &["cart.rs"]);
        assert_eq!(prefilter(&a, &same, &config), None);
    }

    #[test]
    fn test_merge_needs_duplicate_or_overlap_at_threshold() {
        assert!(should_merge(&verdict(Relationship::Duplicate, 0.95), 0.95));
        assert!(should_merge(&verdict(Relationship::Overlap, 0.99), 0.95));
        assert!(!should_merge(&verdict(Relationship::Duplicate, 0.94), 0.95));
        assert!(!should_merge(&verdict(Relationship::Related, 1.0), 0.95));
    }

    #[tokio::test]
    async fn test_duplicate_on_lower_level_folds_into_higher() {
        let oracle = ScriptedOracle::new().with_relationship(|higher, lower| {
            if higher.id == "a" && lower.id == "b1" {
                Judgment::Success(verdict(Relationship::Duplicate, 0.98))
            } else {
                Judgment::Success(verdict(Relationship::Distinct, 0.1))
            }
        });
        let out = deduplicate_across_levels(tree(), &oracle, &ConsolidationConfig::for_tests()).await;

        assert_eq!(out.stats.merged, 1);
        assert!(find_in(&out.roots, "b1").is_none());
        let a = find_in(&out.roots, "a").unwrap();
        assert!(a.source_themes.contains(&"b1".to_string()));
        assert_eq!(total_nodes(&out.roots), 4);
        assert!(out.stats.prefiltered > 0);
        assert_eq!(
            out.stats.analyzed,
            ScriptedOracle::count(&oracle.calls.classify_relationship)
        );
    }

    #[tokio::test]
    async fn test_failures_and_disabled_runs_keep_tree() {
        let failing = ScriptedOracle::failing(FailureKind::Unavailable);
        let out = deduplicate_across_levels(tree(), &failing, &ConsolidationConfig::for_tests()).await;
        assert_eq!(out.stats.merged, 0);
        assert_eq!(out.stats.oracle_failures, out.stats.analyzed);
        assert_eq!(out.roots, tree());

        let config = ConsolidationConfig {
            cross_level_dedup: false,
            ..ConsolidationConfig::for_tests()
        };
        let oracle = ScriptedOracle::new();
        let out = deduplicate_across_levels(tree(), &oracle, &config).await;
        assert_eq!(out.stats, CrossLevelStats::default());
        assert_eq!(ScriptedOracle::count(&oracle.calls.classify_relationship), 0);
    }
}
