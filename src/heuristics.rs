//! Heuristic judgments
//!
//! Fast, keyword- and overlap-based stand-ins for every oracle judgment:
//! - Business domain from theme names, descriptions and file paths
//! - Pairwise similarity from file overlap and name tokens
//! - Duplicate groups from identical file sets
//! - A per-file expansion partition
//!
//! These are what the engine degrades to when the oracle fails, and what the
//! offline [`crate::oracle::HeuristicOracle`] answers with.

use crate::oracle::{
    AssignedCode, ChildAssignment, DomainVerdict, DuplicateGroup, ExpansionDecision,
    GroupSummary, MergeAction, Relationship, RelationshipVerdict, SimilarityVerdict,
};
use crate::text::{file_overlap, name_similarity, tokenize, verbs_incompatible};
use crate::theme::{ConsolidatedTheme, LineRange};
use std::collections::{BTreeMap, HashMap};

/// Domain used when no keyword matches.
pub const GENERAL_DOMAIN: &str = "General Changes";

/// Keyword table: domain label and the tokens that suggest it. Order is priority.
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("Testing", &["test", "tests", "spec", "mock", "fixture", "fixtures", "assert", "coverage"]),
    ("Authentication & Security", &["auth", "login", "logout", "token", "session", "password", "permission", "oauth", "jwt", "security", "credential"]),
    ("User Interface", &["ui", "component", "components", "button", "css", "style", "styles", "layout", "page", "view", "render", "modal", "frontend", "tsx", "jsx"]),
    ("API", &["api", "endpoint", "endpoints", "route", "routes", "handler", "handlers", "request", "response", "http", "rest", "graphql", "controller"]),
    ("Data & Storage", &["database", "db", "schema", "migration", "migrations", "query", "queries", "model", "models", "sql", "storage", "repository", "cache"]),
    ("Configuration", &["config", "configuration", "settings", "env", "yaml", "toml", "flag", "flags"]),
    ("Build & Infrastructure", &["ci", "docker", "dockerfile", "deploy", "deployment", "workflow", "pipeline", "build", "infra", "terraform", "makefile"]),
    ("Documentation", &["doc", "docs", "readme", "documentation", "changelog", "md"]),
    ("Error Handling & Logging", &["error", "errors", "logging", "log", "logs", "retry", "exception", "tracing"]),
];

/// Domain pairs that are never duplicates of each other.
const INCOMPATIBLE_DOMAINS: &[(&str, &str)] = &[
    ("User Interface", "API"),
    ("User Interface", "Data & Storage"),
    ("User Interface", "Build & Infrastructure"),
    ("Testing", "Documentation"),
    ("Documentation", "Data & Storage"),
    ("Documentation", "API"),
    ("Build & Infrastructure", "Data & Storage"),
];

fn theme_tokens(theme: &ConsolidatedTheme) -> Vec<String> {
    let mut tokens = tokenize(&theme.name);
    tokens.extend(tokenize(&theme.description));
    for file in &theme.affected_files {
        tokens.extend(tokenize(file));
    }
    tokens
}

/// Keyword-scored domain, or `None` when nothing matches.
pub fn detect_domain(theme: &ConsolidatedTheme) -> Option<&'static str> {
    let tokens = theme_tokens(theme);
    let mut best: Option<(&'static str, usize)> = None;
    for (domain, keywords) in DOMAIN_KEYWORDS {
        let hits = tokens
            .iter()
            .filter(|t| keywords.contains(&t.as_str()))
            .count();
        if hits == 0 {
            continue;
        }
        // Strictly greater keeps table order as the tie-breaker.
        if best.map(|(_, h)| hits > h).unwrap_or(true) {
            best = Some((domain, hits));
        }
    }
    best.map(|(domain, _)| domain)
}

/// Domain label for grouping, falling back to [`GENERAL_DOMAIN`].
pub fn domain_verdict(theme: &ConsolidatedTheme) -> DomainVerdict {
    match detect_domain(theme) {
        Some(domain) => DomainVerdict {
            domain: domain.to_string(),
            confidence: 0.5,
        },
        None => DomainVerdict {
            domain: GENERAL_DOMAIN.to_string(),
            confidence: 0.2,
        },
    }
}

pub fn domains_incompatible(a: &ConsolidatedTheme, b: &ConsolidatedTheme) -> bool {
    match (detect_domain(a), detect_domain(b)) {
        (Some(x), Some(y)) => INCOMPATIBLE_DOMAINS
            .iter()
            .any(|(p, q)| (*p == x && *q == y) || (*p == y && *q == x)),
        _ => false,
    }
}

/// Overlap-based similarity: 60% file overlap, 40% name tokens.
pub fn similarity_verdict(a: &ConsolidatedTheme, b: &ConsolidatedTheme) -> SimilarityVerdict {
    let file_score = file_overlap(&a.affected_files, &b.affected_files);
    let name_score = name_similarity(&a.name, &b.name);
    let combined = (0.6 * file_score + 0.4 * name_score).clamp(0.0, 1.0);
    SimilarityVerdict {
        combined_score: combined,
        name_score: Some(name_score),
        file_score: Some(file_score),
        should_merge: combined >= 0.85 && !verbs_incompatible(&a.name, &b.name),
        reasoning: format!(
            "heuristic: file overlap {:.2}, name similarity {:.2}",
            file_score, name_score
        ),
    }
}

/// Conservative "keep separate" judgment used when the oracle cannot answer.
pub fn keep_separate(reason: &str) -> SimilarityVerdict {
    SimilarityVerdict {
        combined_score: 0.0,
        name_score: None,
        file_score: None,
        should_merge: false,
        reasoning: reason.to_string(),
    }
}

/// Group themes with identical file sets and near-identical names.
pub fn duplicate_groups(themes: &[&ConsolidatedTheme]) -> Vec<DuplicateGroup> {
    let mut assigned = vec![false; themes.len()];
    let mut groups = Vec::new();
    for i in 0..themes.len() {
        if assigned[i] {
            continue;
        }
        let mut members = vec![i];
        for j in (i + 1)..themes.len() {
            if assigned[j] {
                continue;
            }
            let same_files = file_overlap(&themes[i].affected_files, &themes[j].affected_files) >= 1.0;
            if same_files
                && name_similarity(&themes[i].name, &themes[j].name) >= 0.8
                && !verbs_incompatible(&themes[i].name, &themes[j].name)
            {
                members.push(j);
            }
        }
        if members.len() > 1 {
            for &m in &members {
                assigned[m] = true;
            }
            groups.push(DuplicateGroup {
                indices: members,
                reasoning: "identical files and near-identical names".to_string(),
            });
        }
    }
    groups
}

/// Name/description for a group: the strongest member's wording.
pub fn group_summary(themes: &[&ConsolidatedTheme]) -> GroupSummary {
    let Some(lead) = themes.iter().copied().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) else {
        return GroupSummary {
            name: "Related changes".to_string(),
            description: String::new(),
        };
    };
    let description = if themes.len() > 1 {
        format!(
            "{} (consolidated from {} related themes)",
            lead.description,
            themes.len()
        )
    } else {
        lead.description.clone()
    };
    GroupSummary {
        name: lead.name.clone(),
        description,
    }
}

/// Parent wording for a domain bucket.
pub fn domain_parent_summary(domain: &str, themes: &[&ConsolidatedTheme]) -> GroupSummary {
    let names: Vec<&str> = themes.iter().take(3).map(|t| t.name.as_str()).collect();
    let mut description = format!("{} related changes: {}", themes.len(), names.join("; "));
    if themes.len() > names.len() {
        description.push_str("; ...");
    }
    GroupSummary {
        name: domain.to_string(),
        description,
    }
}

/// Split a multi-file node into one child per file, each taking all of that
/// file's lines. Single-file nodes are atomic; nodes that already have
/// children are left to them.
pub fn per_file_expansion(node: &ConsolidatedTheme) -> ExpansionDecision {
    if !node.child_themes.is_empty() {
        return ExpansionDecision {
            should_expand: false,
            is_atomic: false,
            confidence: 0.6,
            reasoning: "already decomposed".to_string(),
            children: Vec::new(),
        };
    }
    let mut by_file: BTreeMap<&str, Vec<LineRange>> = BTreeMap::new();
    for snippet in &node.code_snippets {
        by_file
            .entry(snippet.file.as_str())
            .or_default()
            .push(snippet.range());
    }
    for file in &node.affected_files {
        by_file.entry(file.as_str()).or_default();
    }

    if by_file.len() < 2 {
        return ExpansionDecision::atomic(0.6, "single file; nothing to split");
    }

    let children = by_file
        .into_iter()
        .map(|(file, ranges)| {
            let assigned_code = if ranges.is_empty() {
                vec![AssignedCode::whole_file(file)]
            } else {
                ranges
                    .into_iter()
                    .map(|r| AssignedCode::lines(file, r))
                    .collect()
            };
            ChildAssignment {
                name: format!("{}: {}", node.name, short_path(file)),
                description: format!("Changes to {} for {}", file, node.name),
                business_value: String::new(),
                technical_purpose: String::new(),
                assigned_code,
                rationale: "one child per touched file".to_string(),
            }
        })
        .collect();

    ExpansionDecision {
        should_expand: true,
        is_atomic: false,
        confidence: 0.5,
        reasoning: "multi-file theme split by file".to_string(),
        children,
    }
}

fn short_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Relationship estimate across levels, from the same overlap signals.
pub fn relationship_verdict(higher: &ConsolidatedTheme, lower: &ConsolidatedTheme) -> RelationshipVerdict {
    let sim = similarity_verdict(higher, lower);
    let relationship = if sim.combined_score >= 0.95 {
        Relationship::Duplicate
    } else if sim.combined_score >= 0.7 {
        Relationship::Overlap
    } else if sim.combined_score >= 0.3 {
        Relationship::Related
    } else {
        Relationship::Distinct
    };
    let action = match relationship {
        Relationship::Duplicate | Relationship::Overlap if higher.level < lower.level => MergeAction::MergeUp,
        Relationship::Duplicate | Relationship::Overlap if higher.level == lower.level => MergeAction::MergeSibling,
        Relationship::Duplicate | Relationship::Overlap => MergeAction::MergeDown,
        _ => MergeAction::KeepSeparate,
    };
    RelationshipVerdict {
        relationship,
        action,
        score: sim.combined_score,
        reasoning: sim.reasoning,
    }
}

/// Count how many themes would land in each heuristic domain.
pub fn domain_histogram(themes: &[ConsolidatedTheme]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for theme in themes {
        *counts.entry(domain_verdict(theme).domain).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::fixtures::node;

    #[test]
    fn test_detect_domain_by_keywords() {
        let ui = node("1", "Add login button component", &["web/components/Button.tsx"]);
        assert_eq!(detect_domain(&ui), Some("User Interface"));

        let api = node("2", "Add users endpoint", &["server/routes/users.rs"]);
        assert_eq!(detect_domain(&api), Some("API"));

        let unknown = node("3", "Tweak frobnicator", &["src/frob.rs"]);
        assert_eq!(detect_domain(&unknown), None);
        assert_eq!(domain_verdict(&unknown).domain, GENERAL_DOMAIN);
    }

    #[test]
    fn test_domains_incompatible() {
        let ui = node("1", "Restyle modal layout", &["web/modal.css"]);
        let api = node("2", "Add endpoint handler", &["server/api.rs"]);
        assert!(domains_incompatible(&ui, &api));
        assert!(!domains_incompatible(&ui, &ui));
    }

    #[test]
    fn test_similarity_verdict_identical_themes() {
        let a = node("1", "Add caching layer", &["src/cache.rs"]);
        let b = node("2", "Add caching layer", &["src/cache.rs"]);
        let verdict = similarity_verdict(&a, &b);
        assert!((verdict.combined_score - 1.0).abs() < 1e-9);
        assert!(verdict.should_merge);
    }

    #[test]
    fn test_duplicate_groups_requires_same_files() {
        let a = node("1", "Add caching layer", &["src/cache.rs"]);
        let b = node("2", "Add caching layer", &["src/cache.rs"]);
        let c = node("3", "Add caching layer", &["src/other.rs"]);
        let groups = duplicate_groups(&[&a, &b, &c]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].indices, vec![0, 1]);
    }

    #[test]
    fn test_per_file_expansion_partitions_by_file() {
        let multi = node("1", "Checkout", &["src/cart.rs", "src/pay.rs"]);
        let decision = per_file_expansion(&multi);
        assert!(decision.should_expand);
        assert_eq!(decision.children.len(), 2);
        assert_eq!(decision.children[0].assigned_code[0].file, "src/cart.rs");

        let single = node("2", "Cart", &["src/cart.rs"]);
        let decision = per_file_expansion(&single);
        assert!(!decision.should_expand);
        assert!(decision.is_atomic);
    }

    #[test]
    fn test_per_file_expansion_leaves_decomposed_nodes() {
        let mut parent = node("p", "Payments", &["a.rs", "b.rs"]);
        parent.child_themes.push(node("c", "Refunds", &["a.rs"]));
        let decision = per_file_expansion(&parent);
        assert!(!decision.should_expand);
        assert!(!decision.is_atomic);
    }
}
