//! Sibling deduplication
//!
//! Pass 1 asks the oracle for duplicate groups inside fixed-size batches of a
//! sibling set and merges each group. Pass 2 repeats the question once over
//! every pass-1 survivor, catching duplicates that landed in different batches.

use crate::config::ConsolidationConfig;
use crate::merge::merge_groups;
use crate::oracle::{DuplicateGroup, Judgment, Oracle};
use crate::theme::ConsolidatedTheme;
use futures::future::join_all;
use std::collections::HashSet;
use tokio::sync::Semaphore;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Surviving siblings, in their original relative order.
    pub themes: Vec<ConsolidatedTheme>,
    /// Ids of nodes created by a merge in either pass.
    pub merged_ids: HashSet<String>,
    /// Number of duplicate groups merged.
    pub merged_groups: usize,
}

/// Siblings per pass-1 request.
pub fn dedup_batch_size(sibling_count: usize) -> usize {
    if sibling_count <= 12 {
        sibling_count.max(1)
    } else {
        (sibling_count / 3).clamp(12, 30)
    }
}

/// Drop indices that are out of range or already used by an earlier group,
/// then drop groups left with fewer than two members.
pub fn valid_groups(groups: Vec<DuplicateGroup>, len: usize) -> Vec<Vec<usize>> {
    let mut used = HashSet::new();
    groups
        .into_iter()
        .filter_map(|group| {
            let members: Vec<usize> = group
                .indices
                .into_iter()
                .filter(|&i| i < len && used.insert(i))
                .collect();
            (members.len() >= 2).then_some(members)
        })
        .collect()
}

/// Full layout for `len` themes: each duplicate group sits at the position of
/// its first member, everything else stays a singleton in place.
fn layout(mut groups: Vec<Vec<usize>>, len: usize) -> Vec<Vec<usize>> {
    for group in &mut groups {
        group.sort_unstable();
    }
    let mut owner = vec![None; len];
    for (g, group) in groups.iter().enumerate() {
        for &i in group {
            owner[i] = Some(g);
        }
    }

    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        match owner[i] {
            Some(g) if groups[g][0] == i => out.push(groups[g].clone()),
            Some(_) => {}
            None => out.push(vec![i]),
        }
    }
    out
}

/// One detection call plus the merges it implies.
async fn dedup_batch(
    batch: Vec<ConsolidatedTheme>,
    oracle: &dyn Oracle,
    max_concurrency: usize,
) -> (Vec<ConsolidatedTheme>, Vec<String>) {
    if batch.len() < 2 {
        return (batch, Vec::new());
    }
    let groups = {
        let refs: Vec<&ConsolidatedTheme> = batch.iter().collect();
        match oracle.detect_duplicates(&refs).await {
            Judgment::Success(groups) => valid_groups(groups, refs.len()),
            Judgment::Failure { kind, reason } => {
                debug!(themes = refs.len(), ?kind, %reason, "duplicate detection failed; keeping siblings");
                Vec::new()
            }
        }
    };
    if groups.is_empty() {
        return (batch, Vec::new());
    }

    let layout = layout(groups, batch.len());
    let merged = merge_groups(batch, &layout, oracle, max_concurrency).await;
    let merged_ids = layout
        .iter()
        .zip(&merged)
        .filter(|(group, _)| group.len() > 1)
        .map(|(_, theme)| theme.id.clone())
        .collect();
    (merged, merged_ids)
}

/// Deduplicate one sibling set. Returns the input unchanged when sibling
/// dedup is disabled or there is nothing to compare.
pub async fn deduplicate_siblings(
    siblings: Vec<ConsolidatedTheme>,
    oracle: &dyn Oracle,
    config: &ConsolidationConfig,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    if !config.sibling_dedup || siblings.len() < 2 {
        outcome.themes = siblings;
        return outcome;
    }

    let total = siblings.len();
    let size = dedup_batch_size(total);
    let mut batches = Vec::new();
    let mut rest = siblings.into_iter().peekable();
    while rest.peek().is_some() {
        batches.push(rest.by_ref().take(size).collect::<Vec<_>>());
    }
    let batch_count = batches.len();

    let semaphore = Semaphore::new(config.max_concurrency.max(1));
    let results = join_all(batches.into_iter().map(|batch| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.ok();
            dedup_batch(batch, oracle, config.max_concurrency).await
        }
    }))
    .await;

    let mut survivors = Vec::with_capacity(total);
    for (themes, ids) in results {
        survivors.extend(themes);
        outcome.merged_groups += ids.len();
        outcome.merged_ids.extend(ids);
    }

    if config.cross_batch_dedup && batch_count > 1 {
        let (themes, ids) = dedup_batch(survivors, oracle, config.max_concurrency).await;
        survivors = themes;
        outcome.merged_groups += ids.len();
        outcome.merged_ids.extend(ids);
    }

    if outcome.merged_groups > 0 {
        info!(
            siblings = total,
            survivors = survivors.len(),
            merged_groups = outcome.merged_groups,
            "sibling duplicates merged"
        );
    }
    outcome.themes = survivors;
    outcome
}
