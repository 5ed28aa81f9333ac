//! Domain hierarchy builder
//!
//! Classifies consolidated themes into business domains and puts every bucket
//! that reaches `min_themes_for_parent` under a synthesized level-0 parent.
//! Classification failures fall back to keyword domains.

use crate::config::ConsolidationConfig;
use crate::heuristics::{self, GENERAL_DOMAIN};
use crate::oracle::{with_retry, DomainVerdict, Judgment, Oracle};
use crate::theme::{union_files, ConsolidatedTheme, ConsolidationMethod};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct HierarchyOutcome {
    pub roots: Vec<ConsolidatedTheme>,
    pub parents_created: usize,
    /// Themes whose domain came from the keyword fallback.
    pub heuristic_domains: usize,
}

/// Themes per classification request; grows with the input size.
pub fn domain_batch_size(theme_count: usize) -> usize {
    match theme_count {
        0..=10 => theme_count.max(1),
        11..=50 => 10,
        51..=200 => 20,
        _ => 30,
    }
}

fn normalize_domain(label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        GENERAL_DOMAIN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// One domain verdict per theme, in input order.
async fn classify_all(
    themes: &[ConsolidatedTheme],
    oracle: &dyn Oracle,
    config: &ConsolidationConfig,
) -> (Vec<DomainVerdict>, usize) {
    let refs: Vec<&ConsolidatedTheme> = themes.iter().collect();
    let size = domain_batch_size(refs.len());
    let semaphore = Semaphore::new(config.max_concurrency.max(1));

    let batches = join_all(refs.chunks(size).map(|batch| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.ok();
            let judgment = with_retry(config.retry_attempts, config.retry_backoff_ms, move || {
                oracle.classify_domains(batch)
            })
            .await;
            match judgment {
                Judgment::Success(verdicts) if verdicts.len() == batch.len() => (verdicts, 0),
                Judgment::Success(verdicts) => {
                    warn!(
                        expected = batch.len(),
                        got = verdicts.len(),
                        "domain classification returned the wrong count; using keyword domains"
                    );
                    (batch.iter().map(|t| heuristics::domain_verdict(t)).collect(), batch.len())
                }
                Judgment::Failure { kind, reason } => {
                    warn!(themes = batch.len(), ?kind, %reason, "domain classification failed; using keyword domains");
                    (batch.iter().map(|t| heuristics::domain_verdict(t)).collect(), batch.len())
                }
            }
        }
    }))
    .await;

    let mut verdicts = Vec::with_capacity(themes.len());
    let mut fallbacks = 0;
    for (batch, fell_back) in batches {
        verdicts.extend(batch);
        fallbacks += fell_back;
    }
    (verdicts, fallbacks)
}

/// Synthesize the parent node for one domain bucket.
async fn build_parent(domain: String, members: Vec<ConsolidatedTheme>, oracle: &dyn Oracle) -> ConsolidatedTheme {
    let summary = {
        let refs: Vec<&ConsolidatedTheme> = members.iter().collect();
        match oracle.summarize_group(&refs, Some(domain.as_str())).await {
            Judgment::Success(summary) => summary,
            Judgment::Failure { reason, .. } => {
                debug!(%domain, %reason, "domain parent summary failed; using domain label");
                heuristics::domain_parent_summary(&domain, &refs)
            }
        }
    };

    let confidence = members.iter().map(|m| m.confidence).sum::<f64>() / members.len().max(1) as f64;
    let mut parent = ConsolidatedTheme {
        id: Uuid::new_v4().to_string(),
        name: summary.name,
        description: summary.description,
        affected_files: Vec::new(),
        code_snippets: Vec::new(),
        confidence,
        context: String::new(),
        level: 0,
        parent_id: None,
        child_themes: Vec::new(),
        source_themes: Vec::new(),
        consolidation_method: ConsolidationMethod::Hierarchy,
        is_atomic: None,
        is_expanded: None,
        business_value: Some(domain),
        technical_purpose: None,
    };
    for member in &members {
        union_files(&mut parent.affected_files, &member.affected_files);
        parent.code_snippets.extend(member.code_snippets.iter().cloned());
        parent.source_themes.extend(member.source_themes.iter().cloned());
    }
    parent.child_themes = members;
    let id = parent.id.clone();
    for child in &mut parent.child_themes {
        child.relevel(1, Some(id.clone()));
    }
    parent
}

/// Group `themes` by business domain. Buckets of at least
/// `min_themes_for_parent` become children of a new level-0 parent; smaller
/// buckets stay as level-0 roots. Bucket order follows first appearance.
pub async fn build_domain_hierarchy(
    themes: Vec<ConsolidatedTheme>,
    oracle: &dyn Oracle,
    config: &ConsolidationConfig,
) -> HierarchyOutcome {
    if themes.is_empty() {
        return HierarchyOutcome::default();
    }
    let (verdicts, heuristic_domains) = classify_all(&themes, oracle, config).await;

    let mut buckets: Vec<(String, Vec<ConsolidatedTheme>)> = Vec::new();
    for (theme, verdict) in themes.into_iter().zip(verdicts) {
        let domain = normalize_domain(&verdict.domain);
        match buckets
            .iter_mut()
            .find(|(label, _)| label.eq_ignore_ascii_case(&domain))
        {
            Some((_, members)) => members.push(theme),
            None => buckets.push((domain, vec![theme])),
        }
    }

    let min = config.min_themes_for_parent.max(1);
    let semaphore = Semaphore::new(config.max_concurrency.max(1));
    let built = join_all(buckets.into_iter().map(|(domain, members)| {
        let semaphore = &semaphore;
        async move {
            if members.len() >= min {
                let _permit = semaphore.acquire().await.ok();
                (vec![build_parent(domain, members, oracle).await], true)
            } else {
                let roots = members
                    .into_iter()
                    .map(|mut m| {
                        m.relevel(0, None);
                        m
                    })
                    .collect();
                (roots, false)
            }
        }
    }))
    .await;

    let mut outcome = HierarchyOutcome {
        heuristic_domains,
        ..HierarchyOutcome::default()
    };
    for (roots, is_parent) in built {
        if is_parent {
            outcome.parents_created += 1;
        }
        outcome.roots.extend(roots);
    }
    info!(
        roots = outcome.roots.len(),
        parents = outcome.parents_created,
        heuristic_domains = outcome.heuristic_domains,
        "domain hierarchy built"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::scripted::ScriptedOracle;
    use crate::oracle::FailureKind;
    use crate::theme::fixtures::node;

    fn scripted_domains() -> ScriptedOracle {
        ScriptedOracle::new().with_domains(|t| {
            let domain = match t.id.chars().next() {
                Some('p') => "Payments",
                Some('u') => "User Accounts",
                _ => "Reporting",
            };
            Judgment::Success(DomainVerdict {
                domain: domain.to_string(),
                confidence: 0.9,
            })
        })
    }

    fn twenty_themes() -> Vec<ConsolidatedTheme> {
        let mut themes = Vec::new();
        for i in 0..8 {
            themes.push(node(&format!("p{}", i), &format!("Payment change {}", i), &["src/pay.rs"]));
        }
        for i in 0..8 {
            themes.push(node(&format!("u{}", i), &format!("Account change {}", i), &["src/user.rs"]));
        }
        for i in 0..4 {
            themes.push(node(&format!("r{}", i), &format!("Report change {}", i), &["src/report.rs"]));
        }
        themes
    }

    #[test]
    fn test_domain_batch_size_grows() {
        assert_eq!(domain_batch_size(3), 3);
        assert!(domain_batch_size(40) <= domain_batch_size(150));
        assert!(domain_batch_size(150) <= domain_batch_size(1_000));
    }

    #[tokio::test]
    async fn test_three_domains_yield_three_parents() {
        let oracle = scripted_domains();
        let config = ConsolidationConfig::for_tests();
        let outcome = build_domain_hierarchy(twenty_themes(), &oracle, &config).await;

        assert_eq!(outcome.parents_created, 3);
        assert_eq!(outcome.roots.len(), 3);
        assert!(outcome
            .roots
            .iter()
            .all(|r| r.consolidation_method == ConsolidationMethod::Hierarchy));
        let sizes: Vec<usize> = outcome.roots.iter().map(|r| r.child_themes.len()).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
        for root in &outcome.roots {
            assert_eq!(root.level, 0);
            for child in &root.child_themes {
                assert_eq!(child.level, 1);
                assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
            }
        }
        assert_eq!(outcome.heuristic_domains, 0);
    }

    #[tokio::test]
    async fn test_small_buckets_stay_roots() {
        let oracle = scripted_domains();
        let config = ConsolidationConfig {
            min_themes_for_parent: 5,
            ..ConsolidationConfig::for_tests()
        };
        let outcome = build_domain_hierarchy(twenty_themes(), &oracle, &config).await;

        assert_eq!(outcome.parents_created, 2);
        assert_eq!(outcome.roots.len(), 2 + 4);
        assert!(outcome.roots.iter().all(|r| r.level == 0 && r.parent_id.is_none()));
    }

    #[tokio::test]
    async fn test_failed_classification_uses_keyword_domains() {
        let oracle = ScriptedOracle::failing(FailureKind::Unavailable);
        let themes = vec![
            node("a", "Add orders endpoint", &["server/routes/orders.rs"]),
            node("b", "Add users endpoint", &["server/routes/users.rs"]),
            node("c", "Tweak frobnicator", &["src/frob.rs"]),
        ];
        let outcome = build_domain_hierarchy(themes, &oracle, &ConsolidationConfig::for_tests()).await;

        assert_eq!(outcome.heuristic_domains, 3);
        assert_eq!(outcome.parents_created, 1);
        let parent = &outcome.roots[0];
        assert_eq!(parent.name, "API");
        assert_eq!(parent.child_themes.len(), 2);
        assert_eq!(outcome.roots.len(), 2);
    }
}
