//! Structural checks over a finished tree. Problems are reported, never repaired.

use crate::theme::{flatten, ConsolidatedTheme};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    DuplicateId { id: String },
    /// `parent_id` names a node that is not in the tree.
    Orphan { id: String, parent_id: String },
    /// `parent_id` disagrees with where the node actually sits.
    ParentMismatch {
        id: String,
        parent_id: Option<String>,
        structural_parent: Option<String>,
    },
    /// Following `parent_id` links from this node revisits a node.
    Cycle { id: String },
    LevelMismatch { id: String, level: u32, expected: u32 },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::DuplicateId { id } => write!(f, "id {} appears more than once", id),
            IntegrityIssue::Orphan { id, parent_id } => {
                write!(f, "{} points at missing parent {}", id, parent_id)
            }
            IntegrityIssue::ParentMismatch {
                id,
                parent_id,
                structural_parent,
            } => write!(
                f,
                "{} has parent_id {} but sits under {}",
                id,
                parent_id.as_deref().unwrap_or("<none>"),
                structural_parent.as_deref().unwrap_or("<root>")
            ),
            IntegrityIssue::Cycle { id } => write!(f, "parent chain of {} loops", id),
            IntegrityIssue::LevelMismatch { id, level, expected } => {
                write!(f, "{} is at level {} but should be at {}", id, level, expected)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

/// Check ids, parent links, parent chains and levels over the whole forest.
pub fn validate_tree(roots: &[ConsolidatedTheme]) -> IntegrityReport {
    let flat = flatten(roots);
    let mut issues = Vec::new();

    let mut by_id: HashMap<&str, &ConsolidatedTheme> = HashMap::with_capacity(flat.len());
    for node in &flat {
        match by_id.entry(node.theme.id.as_str()) {
            Entry::Occupied(_) => issues.push(IntegrityIssue::DuplicateId {
                id: node.theme.id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(node.theme);
            }
        }
    }

    for node in &flat {
        let theme = node.theme;
        if theme.parent_id.as_deref() != node.structural_parent {
            issues.push(IntegrityIssue::ParentMismatch {
                id: theme.id.clone(),
                parent_id: theme.parent_id.clone(),
                structural_parent: node.structural_parent.map(str::to_string),
            });
        }

        match theme.parent_id.as_deref() {
            None if theme.level != 0 => issues.push(IntegrityIssue::LevelMismatch {
                id: theme.id.clone(),
                level: theme.level,
                expected: 0,
            }),
            None => {}
            Some(parent_id) => match by_id.get(parent_id) {
                None => issues.push(IntegrityIssue::Orphan {
                    id: theme.id.clone(),
                    parent_id: parent_id.to_string(),
                }),
                Some(parent) if theme.level != parent.level + 1 => {
                    issues.push(IntegrityIssue::LevelMismatch {
                        id: theme.id.clone(),
                        level: theme.level,
                        expected: parent.level + 1,
                    })
                }
                Some(_) => {}
            },
        }

        let mut visited = HashSet::new();
        let mut current = Some(theme);
        while let Some(n) = current {
            if !visited.insert(n.id.as_str()) {
                issues.push(IntegrityIssue::Cycle { id: theme.id.clone() });
                break;
            }
            current = n.parent_id.as_deref().and_then(|p| by_id.get(p).copied());
        }
    }

    IntegrityReport {
        valid: issues.is_empty(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::fixtures::node;

    fn valid_tree() -> Vec<ConsolidatedTheme> {
        let mut child = node("child", "Child", &["a.rs"]);
        child.child_themes.push(node("leaf", "Leaf", &["a.rs"]));
        let mut root = node("root", "Root", &["a.rs"]);
        root.child_themes.push(child);
        root.relevel(0, None);
        vec![root, node("other", "Other", &["b.rs"])]
    }

    #[test]
    fn test_valid_tree_has_no_issues() {
        let report = validate_tree(&valid_tree());
        assert!(report.valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_orphan_is_reported() {
        let mut roots = valid_tree();
        roots[0].child_themes[0].child_themes[0].parent_id = Some("ghost".to_string());
        let report = validate_tree(&roots);
        assert!(!report.valid);
        assert!(report.issues.contains(&IntegrityIssue::Orphan {
            id: "leaf".to_string(),
            parent_id: "ghost".to_string(),
        }));
    }

    #[test]
    fn test_level_mismatch_is_reported() {
        let mut roots = valid_tree();
        roots[0].child_themes[0].child_themes[0].level = 5;
        let report = validate_tree(&roots);
        assert_eq!(
            report.issues,
            vec![IntegrityIssue::LevelMismatch {
                id: "leaf".to_string(),
                level: 5,
                expected: 2,
            }]
        );
    }

    #[test]
    fn test_parent_cycle_is_reported() {
        let mut a = node("a", "A", &["a.rs"]);
        let mut b = node("b", "B", &["a.rs"]);
        a.parent_id = Some("b".to_string());
        a.level = 1;
        b.parent_id = Some("a".to_string());
        b.level = 2;
        let report = validate_tree(&[a, b]);
        assert!(!report.valid);
        assert!(report.issues.contains(&IntegrityIssue::Cycle { id: "a".to_string() }));
        assert!(report.issues.contains(&IntegrityIssue::Cycle { id: "b".to_string() }));
    }

    #[test]
    fn test_duplicate_ids_are_reported() {
        let mut roots = valid_tree();
        roots[1].id = "root".to_string();
        let report = validate_tree(&roots);
        assert_eq!(
            report.issues,
            vec![IntegrityIssue::DuplicateId { id: "root".to_string() }]
        );
        assert!(report.issues[0].to_string().contains("more than once"));
    }
}
