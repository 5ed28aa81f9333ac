//! Theme data model
//!
//! A [`Theme`] is one flat slice of a code change as produced by the diff
//! ingestion step. A [`ConsolidatedTheme`] is a node of the drill-down tree the
//! pipeline builds from them. Children are owned exclusively by their parent, so
//! the tree can be rebuilt bottom-up without shared mutable state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Inclusive, 1-based line range inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// A range is usable when it names at least one line.
    pub fn is_valid(&self) -> bool {
        self.start >= 1 && self.end >= self.start
    }

    pub fn len(&self) -> u32 {
        if self.is_valid() {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersect(&self, other: &LineRange) -> Option<LineRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(LineRange::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "L{}", self.start)
        } else {
            write!(f, "L{}-L{}", self.start, self.end)
        }
    }
}

/// A block of changed code with its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnippet {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub content: String,
}

impl CodeSnippet {
    pub fn new(file: impl Into<String>, start_line: u32, end_line: u32, content: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            start_line,
            end_line,
            content: content.into(),
        }
    }

    pub fn range(&self) -> LineRange {
        LineRange::new(self.start_line, self.end_line)
    }

    /// Cut the snippet down to `range`, keeping the matching content lines.
    ///
    /// Content lines are mapped positionally onto `start_line..=end_line`; when the
    /// content is shorter than the range the missing tail is simply absent.
    pub fn slice(&self, range: &LineRange) -> Option<CodeSnippet> {
        let overlap = self.range().intersect(range)?;
        let skip = (overlap.start - self.start_line) as usize;
        let take = overlap.len() as usize;
        let content = self
            .content
            .lines()
            .skip(skip)
            .take(take)
            .collect::<Vec<_>>()
            .join("\n");
        Some(CodeSnippet {
            file: self.file.clone(),
            start_line: overlap.start,
            end_line: overlap.end,
            content,
        })
    }
}

/// Flat, unconsolidated theme as delivered by the ingestion step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub code_snippets: Vec<CodeSnippet>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub context: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// How a tree node came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationMethod {
    Single,
    Merge,
    Hierarchy,
    Expansion,
}

/// A node of the consolidated theme tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedTheme {
    pub id: String,
    pub name: String,
    pub description: String,
    pub affected_files: Vec<String>,
    pub code_snippets: Vec<CodeSnippet>,
    pub confidence: f64,
    #[serde(default)]
    pub context: String,
    pub level: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_themes: Vec<ConsolidatedTheme>,
    #[serde(default)]
    pub source_themes: Vec<String>,
    pub consolidation_method: ConsolidationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_atomic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_expanded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_purpose: Option<String>,
}

impl ConsolidatedTheme {
    /// Lift a flat theme into a level-0 tree node.
    pub fn from_theme(theme: Theme) -> Self {
        let mut affected_files = Vec::with_capacity(theme.affected_files.len());
        union_files(&mut affected_files, &theme.affected_files);
        // Files that only appear in snippets still belong to the theme.
        let snippet_files: Vec<String> = theme.code_snippets.iter().map(|s| s.file.clone()).collect();
        union_files(&mut affected_files, &snippet_files);

        Self {
            source_themes: vec![theme.id.clone()],
            id: theme.id,
            name: theme.name,
            description: theme.description,
            affected_files,
            code_snippets: theme.code_snippets,
            confidence: theme.confidence.clamp(0.0, 1.0),
            context: theme.context,
            level: 0,
            parent_id: None,
            child_themes: Vec::new(),
            consolidation_method: ConsolidationMethod::Single,
            is_atomic: None,
            is_expanded: None,
            business_value: None,
            technical_purpose: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child_themes.is_empty()
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.child_themes.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Deepest `level` found in this subtree.
    pub fn max_level(&self) -> u32 {
        self.child_themes
            .iter()
            .map(|c| c.max_level())
            .max()
            .unwrap_or(self.level)
            .max(self.level)
    }

    /// Total changed lines covered by the node's snippets.
    pub fn code_line_count(&self) -> u32 {
        self.code_snippets.iter().map(|s| s.range().len()).sum()
    }

    /// Rough size used to compare nodes: changed lines, or file count when the
    /// node carries no snippets.
    pub fn size_hint(&self) -> usize {
        let lines = self.code_line_count() as usize;
        if lines > 0 {
            lines
        } else {
            self.affected_files.len().max(1)
        }
    }

    /// Reassign `level` and `parent_id` for this node and every descendant.
    pub fn relevel(&mut self, level: u32, parent_id: Option<String>) {
        self.level = level;
        self.parent_id = parent_id;
        let id = self.id.clone();
        for child in &mut self.child_themes {
            child.relevel(level + 1, Some(id.clone()));
        }
    }

    pub fn find(&self, id: &str) -> Option<&ConsolidatedTheme> {
        if self.id == id {
            return Some(self);
        }
        self.child_themes.iter().find_map(|c| c.find(id))
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ConsolidatedTheme> {
        if self.id == id {
            return Some(self);
        }
        self.child_themes.iter_mut().find_map(|c| c.find_mut(id))
    }
}

/// Ordered-set union: append entries of `more` that `into` lacks.
pub fn union_files(into: &mut Vec<String>, more: &[String]) {
    let mut seen: HashSet<String> = into.iter().cloned().collect();
    for file in more {
        if seen.insert(file.clone()) {
            into.push(file.clone());
        }
    }
}

/// A node seen during a pre-order walk, with the id of its structural parent.
#[derive(Debug, Clone, Copy)]
pub struct FlatNode<'a> {
    pub theme: &'a ConsolidatedTheme,
    pub structural_parent: Option<&'a str>,
}

/// Pre-order walk over a forest.
pub fn flatten(roots: &[ConsolidatedTheme]) -> Vec<FlatNode<'_>> {
    fn walk<'a>(node: &'a ConsolidatedTheme, parent: Option<&'a str>, out: &mut Vec<FlatNode<'a>>) {
        out.push(FlatNode {
            theme: node,
            structural_parent: parent,
        });
        for child in &node.child_themes {
            walk(child, Some(node.id.as_str()), out);
        }
    }

    let mut out = Vec::new();
    for root in roots {
        walk(root, None, &mut out);
    }
    out
}

pub fn find_in<'a>(roots: &'a [ConsolidatedTheme], id: &str) -> Option<&'a ConsolidatedTheme> {
    roots.iter().find_map(|r| r.find(id))
}

pub fn find_in_mut<'a>(roots: &'a mut [ConsolidatedTheme], id: &str) -> Option<&'a mut ConsolidatedTheme> {
    roots.iter_mut().find_map(|r| r.find_mut(id))
}

/// Ids from the root down to `id` (inclusive), if `id` is in the forest.
pub fn path_to(roots: &[ConsolidatedTheme], id: &str) -> Option<Vec<String>> {
    fn walk(node: &ConsolidatedTheme, id: &str, path: &mut Vec<String>) -> bool {
        path.push(node.id.clone());
        if node.id == id {
            return true;
        }
        for child in &node.child_themes {
            if walk(child, id, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    for root in roots {
        let mut path = Vec::new();
        if walk(root, id, &mut path) {
            return Some(path);
        }
    }
    None
}

/// Detach the node with `id` from the forest and return it.
pub fn remove_node(roots: &mut Vec<ConsolidatedTheme>, id: &str) -> Option<ConsolidatedTheme> {
    if let Some(pos) = roots.iter().position(|r| r.id == id) {
        return Some(roots.remove(pos));
    }
    for root in roots.iter_mut() {
        if let Some(found) = remove_node(&mut root.child_themes, id) {
            return Some(found);
        }
    }
    None
}

/// Fold node `source_id` into node `target_id`.
///
/// The target gains the source's files, snippets and source themes, and
/// adopts its children; the target's ancestors gain the files as well. Nothing
/// changes (and `false` is returned) when either id is missing, the ids are
/// equal, or the source is an ancestor of the target.
pub fn absorb(roots: &mut Vec<ConsolidatedTheme>, target_id: &str, source_id: &str) -> bool {
    if target_id == source_id || find_in(roots, source_id).is_none() {
        return false;
    }
    match path_to(roots, target_id) {
        Some(path) if !path.iter().any(|id| id == source_id) => {}
        _ => return false,
    }
    let Some(source) = remove_node(roots, source_id) else {
        return false;
    };

    let ancestors = path_to(roots, target_id).unwrap_or_default();
    let Some(target) = find_in_mut(roots, target_id) else {
        return false;
    };
    union_files(&mut target.affected_files, &source.affected_files);
    for snippet in source.code_snippets {
        if !target.code_snippets.contains(&snippet) {
            target.code_snippets.push(snippet);
        }
    }
    let absorbed_ids = if source.source_themes.is_empty() {
        vec![source.id]
    } else {
        source.source_themes
    };
    union_files(&mut target.source_themes, &absorbed_ids);
    target.child_themes.extend(source.child_themes);
    let (level, parent_id) = (target.level, target.parent_id.clone());
    target.relevel(level, parent_id);
    let files = target.affected_files.clone();

    for ancestor in ancestors.iter().filter(|id| id.as_str() != target_id) {
        if let Some(node) = find_in_mut(roots, ancestor) {
            union_files(&mut node.affected_files, &files);
        }
    }
    true
}

pub fn total_nodes(roots: &[ConsolidatedTheme]) -> usize {
    roots.iter().map(|r| r.node_count()).sum()
}

pub fn max_level(roots: &[ConsolidatedTheme]) -> u32 {
    roots.iter().map(|r| r.max_level()).max().unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Flat theme touching `files`, one 10-line snippet per file.
    pub fn theme(id: &str, name: &str, files: &[&str]) -> Theme {
        Theme {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{} description", name),
            affected_files: files.iter().map(|f| f.to_string()).collect(),
            code_snippets: files
                .iter()
                .map(|f| CodeSnippet::new(*f, 1, 10, numbered_lines(1, 10)))
                .collect(),
            confidence: 0.8,
            context: String::new(),
        }
    }

    pub fn node(id: &str, name: &str, files: &[&str]) -> ConsolidatedTheme {
        ConsolidatedTheme::from_theme(theme(id, name, files))
    }

    pub fn numbered_lines(start: u32, end: u32) -> String {
        (start..=end)
            .map(|n| format!("line {}", n))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_line_range_validity() {
        assert!(LineRange::new(1, 1).is_valid());
        assert!(!LineRange::new(0, 3).is_valid());
        assert!(!LineRange::new(5, 4).is_valid());
        assert_eq!(LineRange::new(3, 7).len(), 5);
        assert_eq!(LineRange::new(3, 7).to_string(), "L3-L7");
        assert_eq!(LineRange::new(4, 4).to_string(), "L4");
    }

    #[test]
    fn test_snippet_slice_keeps_matching_lines() {
        let snippet = CodeSnippet::new("a.rs", 10, 14, numbered_lines(10, 14));
        let sliced = snippet.slice(&LineRange::new(12, 20)).unwrap();
        assert_eq!(sliced.start_line, 12);
        assert_eq!(sliced.end_line, 14);
        assert_eq!(sliced.content, "line 12\nline 13\nline 14");
        assert!(snippet.slice(&LineRange::new(1, 9)).is_none());
    }

    #[test]
    fn test_from_theme_collects_snippet_files() {
        let mut t = theme("t1", "Add login", &["src/auth.rs"]);
        t.code_snippets.push(CodeSnippet::new("src/session.rs", 1, 2, "a\nb"));
        t.affected_files.push("src/auth.rs".to_string());
        let node = ConsolidatedTheme::from_theme(t);
        assert_eq!(node.affected_files, vec!["src/auth.rs", "src/session.rs"]);
        assert_eq!(node.source_themes, vec!["t1"]);
        assert_eq!(node.consolidation_method, ConsolidationMethod::Single);
        assert_eq!(node.level, 0);
    }

    #[test]
    fn test_relevel_updates_descendants() {
        let mut root = node("root", "Root", &["a.rs"]);
        let mut child = node("child", "Child", &["a.rs"]);
        child.child_themes.push(node("grandchild", "Grandchild", &["a.rs"]));
        root.child_themes.push(child);

        root.relevel(2, Some("above".to_string()));
        let grandchild = root.find("grandchild").unwrap();
        assert_eq!(grandchild.level, 4);
        assert_eq!(grandchild.parent_id.as_deref(), Some("child"));
        assert_eq!(root.max_level(), 4);
        assert_eq!(root.node_count(), 3);
    }

    #[test]
    fn test_remove_and_path() {
        let mut root = node("root", "Root", &["a.rs"]);
        root.child_themes.push(node("child", "Child", &["a.rs"]));
        let mut roots = vec![root, node("other", "Other", &["b.rs"])];

        assert_eq!(
            path_to(&roots, "child"),
            Some(vec!["root".to_string(), "child".to_string()])
        );
        let removed = remove_node(&mut roots, "child").unwrap();
        assert_eq!(removed.id, "child");
        assert!(find_in(&roots, "child").is_none());
        assert_eq!(total_nodes(&roots), 2);
    }

    #[test]
    fn test_flatten_reports_structural_parent() {
        let mut root = node("root", "Root", &["a.rs"]);
        root.child_themes.push(node("child", "Child", &["a.rs"]));
        let flat = flatten(std::slice::from_ref(&root));
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].structural_parent, None);
        assert_eq!(flat[1].structural_parent, Some("root"));
    }
    #[test]
    fn test_absorb_moves_code_and_children_up() {
        let mut root = node("root", "Root", &["a.rs"]);
        let mut dup = node("dup", "Dup", &["a.rs", "b.rs"]);
        dup.child_themes.push(node("leaf", "Leaf", &["b.rs"]));
        let mut mid = node("mid", "Mid", &["a.rs"]);
        mid.child_themes.push(dup);
        root.child_themes.push(mid);
        root.child_themes.push(node("target", "Target", &["a.rs"]));
        root.relevel(0, None);
        let mut roots = vec![root];

        assert!(absorb(&mut roots, "target", "dup"));
        assert!(find_in(&roots, "dup").is_none());
        let target = find_in(&roots, "target").unwrap();
        assert_eq!(target.affected_files, vec!["a.rs", "b.rs"]);
        assert_eq!(target.source_themes, vec!["target", "dup"]);
        assert_eq!(target.child_themes[0].id, "leaf");
        assert_eq!(target.child_themes[0].level, 2);
        assert_eq!(target.child_themes[0].parent_id.as_deref(), Some("target"));
        assert!(roots[0].affected_files.contains(&"b.rs".to_string()));
    }

    #[test]
    fn test_absorb_refuses_ancestor_source() {
        let mut root = node("root", "Root", &["a.rs"]);
        root.child_themes.push(node("child", "Child", &["a.rs"]));
        let mut roots = vec![root];
        assert!(!absorb(&mut roots, "child", "root"));
        assert!(!absorb(&mut roots, "child", "missing"));
        assert_eq!(total_nodes(&roots), 2);
    }
}
