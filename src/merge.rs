//! Theme merger: collapse a group of themes into one node.

use crate::oracle::{GroupSummary, Judgment, Oracle};
use crate::theme::{union_files, ConsolidatedTheme, ConsolidationMethod};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

/// Wording used when the oracle cannot name a merged group.
pub fn fallback_summary(members: &[&ConsolidatedTheme]) -> GroupSummary {
    match members.first() {
        Some(first) => GroupSummary {
            name: first.name.clone(),
            description: format!(
                "{} (merged from {} similar themes)",
                first.description,
                members.len()
            ),
        },
        None => GroupSummary {
            name: "Merged changes".to_string(),
            description: String::new(),
        },
    }
}

/// Build the merged node from `members` and an already chosen `summary`.
///
/// Files are unioned, snippets concatenated in member order, confidence is
/// the mean and source themes are concatenated. Children of all members are
/// kept, re-parented under the new node.
pub fn combine(members: Vec<ConsolidatedTheme>, summary: GroupSummary) -> ConsolidatedTheme {
    let count = members.len().max(1) as f64;
    let level = members.first().map(|m| m.level).unwrap_or(0);
    let parent_id = members.first().and_then(|m| m.parent_id.clone());
    let confidence = members.iter().map(|m| m.confidence).sum::<f64>() / count;

    let mut merged = ConsolidatedTheme {
        id: Uuid::new_v4().to_string(),
        name: summary.name,
        description: summary.description,
        affected_files: Vec::new(),
        code_snippets: Vec::new(),
        confidence,
        context: String::new(),
        level,
        parent_id,
        child_themes: Vec::new(),
        source_themes: Vec::new(),
        consolidation_method: ConsolidationMethod::Merge,
        is_atomic: None,
        is_expanded: None,
        business_value: None,
        technical_purpose: None,
    };

    let mut contexts = Vec::new();
    for member in members {
        union_files(&mut merged.affected_files, &member.affected_files);
        merged.code_snippets.extend(member.code_snippets);
        if member.source_themes.is_empty() {
            merged.source_themes.push(member.id);
        } else {
            merged.source_themes.extend(member.source_themes);
        }
        if !member.context.trim().is_empty() {
            contexts.push(member.context);
        }
        merged.business_value = merged.business_value.or(member.business_value);
        merged.technical_purpose = merged.technical_purpose.or(member.technical_purpose);
        merged.child_themes.extend(member.child_themes);
    }
    merged.context = contexts.join("\n");

    let id = merged.id.clone();
    for child in &mut merged.child_themes {
        child.relevel(level + 1, Some(id.clone()));
    }
    merged
}

/// Merge one group. Single-member groups are returned unchanged; larger
/// groups get an oracle-written name, or the first member's wording when the
/// oracle fails.
pub async fn merge_group(members: Vec<ConsolidatedTheme>, oracle: &dyn Oracle) -> ConsolidatedTheme {
    let mut members = members;
    if members.len() == 1 {
        if let Some(single) = members.pop() {
            return single;
        }
    }

    let summary = {
        let refs: Vec<&ConsolidatedTheme> = members.iter().collect();
        match oracle.summarize_group(&refs, None).await {
            Judgment::Success(summary) => summary,
            Judgment::Failure { reason, .. } => {
                debug!(members = refs.len(), %reason, "group summary failed; using first member's wording");
                fallback_summary(&refs)
            }
        }
    };
    combine(members, summary)
}

/// Apply `groups` (index lists into `themes`) and return one node per group,
/// in group order. Summaries run concurrently, bounded by `max_concurrency`.
pub async fn merge_groups(
    themes: Vec<ConsolidatedTheme>,
    groups: &[Vec<usize>],
    oracle: &dyn Oracle,
    max_concurrency: usize,
) -> Vec<ConsolidatedTheme> {
    let mut slots: Vec<Option<ConsolidatedTheme>> = themes.into_iter().map(Some).collect();
    let member_lists: Vec<Vec<ConsolidatedTheme>> = groups
        .iter()
        .map(|group| group.iter().filter_map(|&i| slots.get_mut(i).and_then(Option::take)).collect())
        .collect();

    let semaphore = Semaphore::new(max_concurrency.max(1));
    let merged = join_all(member_lists.into_iter().filter(|m| !m.is_empty()).map(|members| {
        let semaphore = &semaphore;
        async move {
            let _permit = if members.len() > 1 {
                semaphore.acquire().await.ok()
            } else {
                None
            };
            merge_group(members, oracle).await
        }
    }))
    .await;

    // Anything a malformed group list left out is kept as-is.
    merged
        .into_iter()
        .chain(slots.into_iter().flatten())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::scripted::ScriptedOracle;
    use crate::oracle::FailureKind;
    use crate::theme::fixtures::node;

    #[tokio::test]
    async fn test_merge_group_combines_members() {
        let mut a = node("a", "Add session cache", &["src/session.rs"]);
        a.confidence = 0.6;
        let mut b = node("b", "Add session caching", &["src/session.rs", "src/cache.rs"]);
        b.confidence = 1.0;
        let oracle = ScriptedOracle::new().with_summary(|_, _| {
            Judgment::Success(GroupSummary {
                name: "Cache sessions".to_string(),
                description: "Adds a session cache".to_string(),
            })
        });

        let merged = merge_group(vec![a, b], &oracle).await;
        assert_eq!(merged.name, "Cache sessions");
        assert_eq!(merged.affected_files, vec!["src/session.rs", "src/cache.rs"]);
        assert_eq!(merged.code_snippets.len(), 3);
        assert!((merged.confidence - 0.8).abs() < 1e-9);
        assert_eq!(merged.source_themes, vec!["a", "b"]);
        assert_eq!(merged.consolidation_method, ConsolidationMethod::Merge);
        assert_ne!(merged.id, "a");
    }

    #[tokio::test]
    async fn test_merge_group_falls_back_to_first_member() {
        let a = node("a", "Add session cache", &["src/session.rs"]);
        let b = node("b", "Add session caching", &["src/session.rs"]);
        let oracle = ScriptedOracle::failing(FailureKind::Unavailable);

        let merged = merge_group(vec![a, b], &oracle).await;
        assert_eq!(merged.name, "Add session cache");
        assert!(merged.description.contains("merged from 2 similar themes"));
    }

    #[tokio::test]
    async fn test_single_member_passes_through() {
        let a = node("a", "Add session cache", &["src/session.rs"]);
        let oracle = ScriptedOracle::new();
        let out = merge_group(vec![a.clone()], &oracle).await;
        assert_eq!(out, a);
        assert_eq!(out.consolidation_method, ConsolidationMethod::Single);
        assert_eq!(ScriptedOracle::count(&oracle.calls.summarize_group), 0);
    }

    #[test]
    fn test_combine_reparents_children() {
        let mut a = node("a", "A", &["a.rs"]);
        a.child_themes.push(node("a1", "A1", &["a.rs"]));
        a.relevel(1, Some("root".to_string()));
        let b = {
            let mut b = node("b", "B", &["a.rs"]);
            b.relevel(1, Some("root".to_string()));
            b
        };
        let merged = combine(vec![a, b], fallback_summary(&[]));
        assert_eq!(merged.level, 1);
        assert_eq!(merged.parent_id.as_deref(), Some("root"));
        assert_eq!(merged.child_themes[0].level, 2);
        assert_eq!(merged.child_themes[0].parent_id.as_deref(), Some(merged.id.as_str()));
    }

    #[tokio::test]
    async fn test_merge_groups_preserves_group_order() {
        let themes = vec![
            node("a", "A", &["a.rs"]),
            node("b", "B", &["b.rs"]),
            node("c", "C", &["a.rs"]),
        ];
        let oracle = ScriptedOracle::new();
        let out = merge_groups(themes, &[vec![0, 2], vec![1]], &oracle, 2).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_themes, vec!["a", "c"]);
        assert_eq!(out[1].id, "b");
    }
}
