use super::{
    DomainVerdict, DuplicateGroup, ExpansionDecision, GroupSummary, Judgment, Oracle, OracleFuture,
    RelationshipVerdict, SimilarityVerdict, ThemePair,
};
use crate::heuristics;
use crate::theme::ConsolidatedTheme;

/// Deterministic offline oracle: answers every question from lexical and
/// file-overlap signals without any network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }
}

impl Oracle for HeuristicOracle {
    fn compare_pair<'a>(&'a self, pair: ThemePair<'a>) -> OracleFuture<'a, SimilarityVerdict> {
        Box::pin(async move { Judgment::Success(heuristics::similarity_verdict(pair.first, pair.second)) })
    }

    fn compare_batch<'a>(&'a self, pairs: &'a [ThemePair<'a>]) -> OracleFuture<'a, Vec<SimilarityVerdict>> {
        Box::pin(async move {
            Judgment::Success(
                pairs
                    .iter()
                    .map(|p| heuristics::similarity_verdict(p.first, p.second))
                    .collect(),
            )
        })
    }

    fn classify_domains<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DomainVerdict>> {
        Box::pin(async move {
            Judgment::Success(themes.iter().map(|t| heuristics::domain_verdict(t)).collect())
        })
    }

    fn decide_expansion<'a>(&'a self, node: &'a ConsolidatedTheme, _depth: u32) -> OracleFuture<'a, ExpansionDecision> {
        Box::pin(async move { Judgment::Success(heuristics::per_file_expansion(node)) })
    }

    fn detect_duplicates<'a>(&'a self, themes: &'a [&'a ConsolidatedTheme]) -> OracleFuture<'a, Vec<DuplicateGroup>> {
        Box::pin(async move { Judgment::Success(heuristics::duplicate_groups(themes)) })
    }

    fn summarize_group<'a>(
        &'a self,
        themes: &'a [&'a ConsolidatedTheme],
        domain: Option<&'a str>,
    ) -> OracleFuture<'a, GroupSummary> {
        Box::pin(async move {
            Judgment::Success(match domain {
                Some(domain) => heuristics::domain_parent_summary(domain, themes),
                None => heuristics::group_summary(themes),
            })
        })
    }

    fn classify_relationship<'a>(
        &'a self,
        higher: &'a ConsolidatedTheme,
        lower: &'a ConsolidatedTheme,
    ) -> OracleFuture<'a, RelationshipVerdict> {
        Box::pin(async move { Judgment::Success(heuristics::relationship_verdict(higher, lower)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::fixtures::node;

    #[tokio::test]
    async fn test_heuristic_oracle_never_fails() {
        let oracle = HeuristicOracle::new();
        assert!(oracle.check_ready().is_ok());

        let a = node("a", "Add caching layer", &["src/cache.rs"]);
        let b = node("b", "Add caching layer", &["src/cache.rs"]);
        let verdict = oracle
            .compare_pair(ThemePair { first: &a, second: &b })
            .await
            .ok()
            .unwrap();
        assert!(verdict.should_merge);

        let themes = [&a, &b];
        let domains = oracle.classify_domains(&themes).await.ok().unwrap();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].domain, domains[1].domain);

        let groups = oracle.detect_duplicates(&themes).await.ok().unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[tokio::test]
    async fn test_heuristic_expansion_splits_by_file() {
        let oracle = HeuristicOracle::new();
        let multi = node("m", "Checkout", &["src/cart.rs", "src/pay.rs"]);
        let decision = oracle.decide_expansion(&multi, 0).await.ok().unwrap();
        assert!(decision.should_expand);
        assert_eq!(decision.children.len(), 2);

        let single = node("s", "Cart", &["src/cart.rs"]);
        let decision = oracle.decide_expansion(&single, 1).await.ok().unwrap();
        assert!(decision.is_atomic);
    }
}
