//! Merge-group builder
//!
//! Single-pass greedy clustering anchored on the first unassigned theme in
//! input order. A theme joins the anchor's group only when its own score with
//! the anchor reaches the threshold; scores with other members are ignored, so
//! groups are not transitively closed.

use crate::cache::PairKey;
use crate::similarity::SimilarityMap;
use crate::theme::ConsolidatedTheme;

/// Score for an unordered pair, 0.0 when the pair was never judged.
pub fn pair_score(similarities: &SimilarityMap, a: &str, b: &str) -> f64 {
    similarities
        .get(&PairKey::new(a, b))
        .map(|r| r.combined_score)
        .unwrap_or(0.0)
}

/// Partition theme indices into merge groups. A score equal to `threshold`
/// merges (`>=`). Every index appears in exactly one group; groups keep input
/// order and the anchor is always first.
pub fn build_merge_groups(
    themes: &[ConsolidatedTheme],
    similarities: &SimilarityMap,
    threshold: f64,
) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; themes.len()];
    let mut groups = Vec::new();

    for anchor in 0..themes.len() {
        if assigned[anchor] {
            continue;
        }
        assigned[anchor] = true;
        let mut group = vec![anchor];

        for candidate in (anchor + 1)..themes.len() {
            if assigned[candidate] {
                continue;
            }
            let score = pair_score(similarities, &themes[anchor].id, &themes[candidate].id);
            if score >= threshold {
                assigned[candidate] = true;
                group.push(candidate);
            }
        }
        groups.push(group);
    }
    groups
}
