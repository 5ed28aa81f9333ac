//! Recursive expansion engine
//!
//! Each node is evaluated by the oracle, which alone decides whether it is
//! atomic. When it is not, the proposed children are validated as an exact
//! partition of the node's code and materialized one level down. New and
//! pre-existing children are then expanded in parallel, the resulting sibling
//! set is deduplicated, and merged survivors get one more evaluation.
//!
//! Nodes are taken by value and returned rebuilt, so sibling subtrees never
//! share mutable state.

pub mod partition;

pub use partition::{materialize_children, validate_partition, CodeMap};

use crate::config::ConsolidationConfig;
use crate::dedup::deduplicate_siblings;
use crate::error::PartitionError;
use crate::oracle::{Judgment, Oracle};
use crate::theme::ConsolidatedTheme;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Live counters shared by every node of one expansion run.
#[derive(Debug, Default)]
pub struct ExpansionStats {
    evaluated: AtomicUsize,
    expanded: AtomicUsize,
    atomic: AtomicUsize,
    decision_failures: AtomicUsize,
    partition_failures: AtomicUsize,
    depth_cap_hits: AtomicUsize,
    sibling_merges: AtomicUsize,
    /// Messages of rejected child partitions, in the order they were seen.
    partition_errors: Mutex<Vec<String>>,
}

/// Snapshot of [`ExpansionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpansionCounts {
    pub evaluated: usize,
    pub expanded: usize,
    pub atomic: usize,
    pub decision_failures: usize,
    pub partition_failures: usize,
    pub depth_cap_hits: usize,
    pub sibling_merges: usize,
}

impl ExpansionStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExpansionCounts {
        ExpansionCounts {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            expanded: self.expanded.load(Ordering::Relaxed),
            atomic: self.atomic.load(Ordering::Relaxed),
            decision_failures: self.decision_failures.load(Ordering::Relaxed),
            partition_failures: self.partition_failures.load(Ordering::Relaxed),
            depth_cap_hits: self.depth_cap_hits.load(Ordering::Relaxed),
            sibling_merges: self.sibling_merges.load(Ordering::Relaxed),
        }
    }

    fn record_partition_error(&self, err: &PartitionError) {
        Self::bump(&self.partition_failures);
        self.partition_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(err.to_string());
    }

    /// Every rejected partition, with node id and offending spans.
    pub fn partition_errors(&self) -> Vec<String> {
        self.partition_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Everything a node needs to expand itself.
pub struct ExpansionContext<'a> {
    pub oracle: &'a dyn Oracle,
    pub config: &'a ConsolidationConfig,
    pub stats: ExpansionStats,
}

impl<'a> ExpansionContext<'a> {
    pub fn new(oracle: &'a dyn Oracle, config: &'a ConsolidationConfig) -> Self {
        Self {
            oracle,
            config,
            stats: ExpansionStats::default(),
        }
    }
}

/// Expand `node` and everything below it.
///
/// A child partition that fails validation leaves the node unexpanded (its
/// existing children are still processed) unless `strict_partition` is set.
/// In strict mode the error is returned once every sibling subtree has
/// finished, and it propagates through every ancestor: the caller gets the
/// error instead of a tree.
pub fn expand_node<'a>(
    node: ConsolidatedTheme,
    depth: u32,
    ctx: &'a ExpansionContext<'a>,
) -> BoxFuture<'a, Result<ConsolidatedTheme, PartitionError>> {
    async move {
        let mut node = node;
        if depth >= ctx.config.max_expansion_depth {
            warn!(
                node = %node.name,
                depth,
                cap = ctx.config.max_expansion_depth,
                "expansion depth cap reached; node left as is"
            );
            ExpansionStats::bump(&ctx.stats.depth_cap_hits);
            return Ok(node);
        }

        ExpansionStats::bump(&ctx.stats.evaluated);
        let decision = match ctx.oracle.decide_expansion(&node, depth).await {
            Judgment::Success(decision) => Some(decision),
            Judgment::Failure { kind, reason } => {
                debug!(node = %node.name, ?kind, %reason, "expansion decision failed; not expanding");
                ExpansionStats::bump(&ctx.stats.decision_failures);
                None
            }
        };

        let mut new_children = Vec::new();
        match decision {
            Some(decision) if decision.should_expand && !decision.children.is_empty() => {
                match validate_partition(&node, &decision.children) {
                    Ok(()) => {
                        new_children = materialize_children(&node, decision.children);
                        node.is_atomic = Some(false);
                        ExpansionStats::bump(&ctx.stats.expanded);
                        debug!(node = %node.name, children = new_children.len(), depth, "node expanded");
                    }
                    Err(err) if ctx.config.strict_partition => return Err(err),
                    Err(err) => {
                        warn!(node = %node.name, id = %node.id, error = %err, "invalid child partition; node kept unexpanded");
                        ctx.stats.record_partition_error(&err);
                    }
                }
            }
            Some(decision) => {
                node.is_atomic = Some(decision.is_atomic);
                if decision.is_atomic {
                    ExpansionStats::bump(&ctx.stats.atomic);
                }
            }
            None => {}
        }
        node.is_expanded = Some(!new_children.is_empty());

        let existing = std::mem::take(&mut node.child_themes);
        let children: Vec<ConsolidatedTheme> = new_children.into_iter().chain(existing).collect();
        if children.is_empty() {
            return Ok(node);
        }

        let level = node.level;
        let parent_id = node.id.clone();
        let mut expanded = Vec::with_capacity(children.len());
        for result in join_all(children.into_iter().map(|mut child| {
            child.relevel(level + 1, Some(parent_id.clone()));
            expand_node(child, depth + 1, ctx)
        }))
        .await
        {
            expanded.push(result?);
        }

        let dedup = deduplicate_siblings(expanded, ctx.oracle, ctx.config).await;
        if dedup.merged_groups > 0 {
            ctx.stats
                .sibling_merges
                .fetch_add(dedup.merged_groups, Ordering::Relaxed);
        }

        // Merged survivors that ended up without children get one evaluation.
        let mut survivors = Vec::with_capacity(dedup.themes.len());
        for result in join_all(dedup.themes.into_iter().map(|child| {
            if dedup.merged_ids.contains(&child.id) && child.is_leaf() {
                expand_node(child, depth + 1, ctx)
            } else {
                async move { Ok(child) }.boxed()
            }
        }))
        .await
        {
            survivors.push(result?);
        }

        node.child_themes = survivors;
        for child in &mut node.child_themes {
            child.relevel(level + 1, Some(parent_id.clone()));
        }
        Ok(node)
    }
    .boxed()
}

/// Expand every root in parallel and re-level the result. With
/// `strict_partition`, the first root (in input order) whose subtree hit an
/// invalid partition decides the error.
pub async fn expand_forest(
    roots: Vec<ConsolidatedTheme>,
    ctx: &ExpansionContext<'_>,
) -> Result<Vec<ConsolidatedTheme>, PartitionError> {
    let results = join_all(roots.into_iter().map(|root| expand_node(root, 0, ctx))).await;
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        let mut root = result?;
        root.relevel(0, None);
        out.push(root);
    }
    Ok(out)
}
