//! End-to-end consolidation
//!
//! flat themes → pairwise similarity → merge groups → merged themes →
//! domain hierarchy → recursive expansion → cross-level dedup → integrity check.
//!
//! Oracle trouble degrades each stage on its own. The run only fails for
//! invalid input, an invalid configuration, an oracle that cannot work at all,
//! or a bad child partition when `strict_partition` is set.

use crate::cache::SimilarityCache;
use crate::config::ConsolidationConfig;
use crate::cross_level::deduplicate_across_levels;
use crate::error::ConsolidationError;
use crate::expansion::{expand_forest, ExpansionContext};
use crate::grouping::build_merge_groups;
use crate::hierarchy::build_domain_hierarchy;
use crate::integrity::{validate_tree, IntegrityReport};
use crate::merge::merge_groups;
use crate::metrics::{CountingOracle, EffectivenessMetrics};
use crate::oracle::{Oracle, SharedOracle};
use crate::similarity::compute_similarities;
use crate::theme::{max_level, total_nodes, ConsolidatedTheme, Theme};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{info, warn};

/// Result of one run: the tree plus what it took to build it.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOutcome {
    pub roots: Vec<ConsolidatedTheme>,
    pub metrics: EffectivenessMetrics,
    pub integrity: IntegrityReport,
    /// Degradations worth surfacing to a user, e.g. nodes left unexpanded.
    pub warnings: Vec<String>,
}

pub struct ConsolidationPipeline {
    oracle: CountingOracle,
    config: ConsolidationConfig,
    cache: SimilarityCache,
}

impl ConsolidationPipeline {
    pub fn new(oracle: SharedOracle, config: ConsolidationConfig) -> Self {
        let cache = SimilarityCache::new(config.cache_ttl_minutes);
        Self {
            oracle: CountingOracle::new(oracle),
            config,
            cache,
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Cached similarity judgments survive across runs of the same pipeline.
    pub fn cache(&self) -> &SimilarityCache {
        &self.cache
    }

    fn check_configuration(&self) -> Result<(), ConsolidationError> {
        match self.oracle.configuration_error() {
            Some(reason) => Err(ConsolidationError::Configuration(reason)),
            None => Ok(()),
        }
    }

    pub async fn run(&self, themes: Vec<Theme>) -> Result<ConsolidationOutcome, ConsolidationError> {
        let started = Instant::now();
        self.oracle
            .check_ready()
            .map_err(ConsolidationError::Configuration)?;
        self.config.validate()?;
        validate_input(&themes)?;

        let config = &self.config;
        let oracle = &self.oracle;
        let calls_before = oracle.counts();
        let mut metrics = EffectivenessMetrics {
            input_themes: themes.len(),
            ..EffectivenessMetrics::default()
        };
        let mut warnings = Vec::new();
        info!(themes = themes.len(), "consolidation started");

        let nodes: Vec<ConsolidatedTheme> = themes.into_iter().map(ConsolidatedTheme::from_theme).collect();

        self.cache.cleanup();
        let similarity = compute_similarities(&nodes, oracle, &self.cache, config).await;
        if similarity.stats.configuration_failure {
            self.check_configuration()?;
        }
        metrics.pairs_total = similarity.stats.pairs_total;
        metrics.pairs_prefiltered = similarity.stats.prefiltered;
        metrics.pairs_analyzed = similarity.stats.analyzed;
        metrics.cache_hits = similarity.stats.cache_hits;
        metrics.pairs_coalesced = similarity.stats.coalesced;
        metrics.similarity_fallbacks = similarity.stats.fallbacks;
        if similarity.stats.fallbacks > 0 {
            warnings.push(format!(
                "{} theme pairs could not be judged and were kept separate",
                similarity.stats.fallbacks
            ));
        }

        let groups = build_merge_groups(&nodes, &similarity.records, config.merge_threshold);
        let multi: Vec<&Vec<usize>> = groups.iter().filter(|g| g.len() > 1).collect();
        metrics.merge_groups = multi.len();
        metrics.themes_merged = multi.iter().map(|g| g.len()).sum();
        let merged = merge_groups(nodes, &groups, oracle, config.max_concurrency).await;
        info!(
            groups = groups.len(),
            merged_groups = metrics.merge_groups,
            "merge groups applied"
        );

        let mut roots = if config.domain_hierarchy {
            let hierarchy = build_domain_hierarchy(merged, oracle, config).await;
            metrics.parents_created = hierarchy.parents_created;
            metrics.heuristic_domains = hierarchy.heuristic_domains;
            hierarchy.roots
        } else {
            merged
        };
        self.check_configuration()?;

        if config.expansion {
            let ctx = ExpansionContext::new(oracle, config);
            roots = expand_forest(roots, &ctx).await?;
            let counts = ctx.stats.snapshot();
            metrics.expansions = counts.expanded;
            metrics.nodes_evaluated = counts.evaluated;
            metrics.partition_failures = counts.partition_failures;
            metrics.depth_cap_hits = counts.depth_cap_hits;
            metrics.sibling_merges = counts.sibling_merges;
            for err in ctx.stats.partition_errors() {
                warnings.push(format!("left unexpanded: {}", err));
            }
            if counts.depth_cap_hits > 0 {
                warnings.push(format!(
                    "expansion stopped at the depth cap ({}) for {} nodes",
                    config.max_expansion_depth, counts.depth_cap_hits
                ));
            }
            self.check_configuration()?;
        }
        for root in &mut roots {
            root.relevel(0, None);
        }

        let cross = deduplicate_across_levels(roots, oracle, config).await;
        self.check_configuration()?;
        let roots = cross.roots;
        metrics.cross_level_pairs_considered = cross.stats.pairs_considered;
        metrics.cross_level_prefiltered = cross.stats.prefiltered;
        metrics.cross_level_merged = cross.stats.merged;

        let integrity = validate_tree(&roots);
        for issue in &integrity.issues {
            warn!(%issue, "tree integrity issue");
            warnings.push(format!("integrity: {}", issue));
        }

        let calls = oracle.counts().since(&calls_before);
        metrics.oracle_calls = calls.total_calls();
        metrics.oracle_failures = calls.total_failures();
        metrics.oracle = calls;
        metrics.output_roots = roots.len();
        metrics.output_nodes = total_nodes(&roots);
        metrics.max_depth = max_level(&roots);
        metrics.processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            roots = metrics.output_roots,
            nodes = metrics.output_nodes,
            depth = metrics.max_depth,
            oracle_calls = metrics.oracle_calls,
            elapsed_ms = metrics.processing_time_ms,
            "consolidation finished"
        );
        Ok(ConsolidationOutcome {
            roots,
            metrics,
            integrity,
            warnings,
        })
    }
}

/// Ids must be present and unique; everything downstream keys on them.
fn validate_input(themes: &[Theme]) -> Result<(), ConsolidationError> {
    let mut seen = HashSet::with_capacity(themes.len());
    for theme in themes {
        if theme.id.trim().is_empty() {
            return Err(ConsolidationError::InvalidInput(format!(
                "theme '{}' has an empty id",
                theme.name
            )));
        }
        if !seen.insert(theme.id.as_str()) {
            return Err(ConsolidationError::InvalidInput(format!(
                "duplicate theme id '{}'",
                theme.id
            )));
        }
    }
    Ok(())
}
