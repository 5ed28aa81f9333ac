//! Child partition validation
//!
//! A parent's code is, per file, the union of its snippets' line ranges. A file
//! listed in `affected_files` without snippets is a whole-file unit. Proposed
//! children must claim every parent line exactly once, may only reference the
//! parent's files, and every whole-file unit must be claimed by exactly one child.

use crate::error::PartitionError;
use crate::oracle::ChildAssignment;
use crate::theme::{union_files, CodeSnippet, ConsolidatedTheme, ConsolidationMethod, LineRange};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Sort and coalesce overlapping or adjacent ranges. Invalid ranges are dropped.
pub fn merge_ranges(mut ranges: Vec<LineRange>) -> Vec<LineRange> {
    ranges.retain(LineRange::is_valid);
    ranges.sort();
    let mut out: Vec<LineRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => out.push(range),
        }
    }
    out
}

/// Parts of `from` not covered by `minus`. Both inputs must be merged.
pub fn subtract_ranges(from: &[LineRange], minus: &[LineRange]) -> Vec<LineRange> {
    let mut out = Vec::new();
    for range in from {
        let mut cursor = range.start;
        for cut in minus {
            if cut.end < cursor || cut.start > range.end {
                continue;
            }
            if cut.start > cursor {
                out.push(LineRange::new(cursor, cut.start - 1));
            }
            cursor = cut.end.saturating_add(1);
            if cursor > range.end {
                break;
            }
        }
        if cursor <= range.end {
            out.push(LineRange::new(cursor, range.end));
        }
    }
    out
}

/// The parent's code, per file.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    /// Merged line ranges for files that have snippets.
    pub ranges: BTreeMap<String, Vec<LineRange>>,
    /// Files without snippets, claimed as a whole.
    pub whole_files: Vec<String>,
}

impl CodeMap {
    pub fn of(node: &ConsolidatedTheme) -> Self {
        let mut raw: BTreeMap<String, Vec<LineRange>> = BTreeMap::new();
        for snippet in &node.code_snippets {
            raw.entry(snippet.file.clone()).or_default().push(snippet.range());
        }
        let ranges: BTreeMap<String, Vec<LineRange>> = raw
            .into_iter()
            .map(|(file, ranges)| (file, merge_ranges(ranges)))
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();
        let whole_files = node
            .affected_files
            .iter()
            .filter(|f| !ranges.contains_key(f.as_str()))
            .cloned()
            .collect();
        Self { ranges, whole_files }
    }

    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.ranges.keys().cloned().collect();
        union_files(&mut files, &self.whole_files);
        files
    }

    fn contains_file(&self, file: &str) -> bool {
        self.ranges.contains_key(file) || self.whole_files.iter().any(|f| f == file)
    }
}

struct Claim {
    range: LineRange,
    child: usize,
}

/// Check that `children` exactly partition `node`'s code.
pub fn validate_partition(node: &ConsolidatedTheme, children: &[ChildAssignment]) -> Result<(), PartitionError> {
    let code = CodeMap::of(node);
    let mut claims: BTreeMap<&str, Vec<Claim>> = BTreeMap::new();
    let mut claimed_whole: HashMap<&str, usize> = HashMap::new();

    for (idx, child) in children.iter().enumerate() {
        if child.assigned_code.is_empty() {
            return Err(PartitionError::EmptyAssignment {
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                child: child.name.clone(),
            });
        }

        for assigned in &child.assigned_code {
            let file = assigned.file.as_str();
            if !code.contains_file(file) {
                return Err(PartitionError::ForeignFile {
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    child: child.name.clone(),
                    file: file.to_string(),
                    expected: code.files(),
                });
            }

            let requested = assigned.range();
            if let Some(range) = requested {
                if !range.is_valid() {
                    return Err(PartitionError::EmptySpan {
                        node_id: node.id.clone(),
                        node_name: node.name.clone(),
                        child: child.name.clone(),
                        file: file.to_string(),
                        range,
                    });
                }
            }

            let Some(parent_ranges) = code.ranges.get(file) else {
                match claimed_whole.get(file) {
                    Some(&owner) if owner != idx => {
                        return Err(PartitionError::DoubleAssignedFile {
                            node_id: node.id.clone(),
                            node_name: node.name.clone(),
                            file: file.to_string(),
                            first_child: children[owner].name.clone(),
                            second_child: child.name.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        claimed_whole.insert(file, idx);
                    }
                }
                continue;
            };

            match requested {
                None => {
                    let entry = claims.entry(file).or_default();
                    entry.extend(parent_ranges.iter().map(|&range| Claim { range, child: idx }));
                }
                Some(range) => {
                    if !subtract_ranges(&[range], parent_ranges).is_empty() {
                        return Err(PartitionError::OutOfBounds {
                            node_id: node.id.clone(),
                            node_name: node.name.clone(),
                            child: child.name.clone(),
                            file: file.to_string(),
                            range,
                        });
                    }
                    claims.entry(file).or_default().push(Claim { range, child: idx });
                }
            }
        }
    }

    for (file, file_claims) in claims.iter_mut() {
        file_claims.sort_by_key(|c| (c.range.start, c.range.end));
        let mut reach: Option<(u32, usize)> = None;
        for claim in file_claims.iter() {
            if let Some((end, owner)) = reach {
                if claim.range.start <= end && owner != claim.child {
                    return Err(PartitionError::DoubleAssigned {
                        node_id: node.id.clone(),
                        node_name: node.name.clone(),
                        file: file.to_string(),
                        range: LineRange::new(claim.range.start, end.min(claim.range.end)),
                        first_child: children[owner].name.clone(),
                        second_child: children[claim.child].name.clone(),
                    });
                }
            }
            reach = match reach {
                Some((end, owner)) if end >= claim.range.end => Some((end, owner)),
                _ => Some((claim.range.end, claim.child)),
            };
        }
    }

    for (file, parent_ranges) in &code.ranges {
        let covered = merge_ranges(
            claims
                .get(file.as_str())
                .map(|cs| cs.iter().map(|c| c.range).collect())
                .unwrap_or_default(),
        );
        let missing = subtract_ranges(parent_ranges, &covered);
        if !missing.is_empty() {
            return Err(PartitionError::Unassigned {
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                file: file.clone(),
                missing,
            });
        }
    }

    if let Some(file) = code.whole_files.iter().find(|f| !claimed_whole.contains_key(f.as_str())) {
        return Err(PartitionError::UnassignedFile {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            file: file.clone(),
        });
    }

    Ok(())
}

/// Build child nodes from a validated partition, one level below `node`.
/// Each child gets its assigned files and the parent's snippet text cut to
/// the assigned lines.
pub fn materialize_children(node: &ConsolidatedTheme, children: Vec<ChildAssignment>) -> Vec<ConsolidatedTheme> {
    children
        .into_iter()
        .map(|assignment| {
            let mut affected_files = Vec::new();
            let mut code_snippets: Vec<CodeSnippet> = Vec::new();
            for assigned in &assignment.assigned_code {
                union_files(&mut affected_files, std::slice::from_ref(&assigned.file));
                let parent_snippets = node.code_snippets.iter().filter(|s| s.file == assigned.file);
                let sliced: Vec<CodeSnippet> = match assigned.range() {
                    None => parent_snippets.cloned().collect(),
                    Some(range) => parent_snippets.filter_map(|s| s.slice(&range)).collect(),
                };
                // Merged parents often carry the same span more than once.
                for snippet in sliced {
                    let held = code_snippets
                        .iter()
                        .any(|s| s.file == snippet.file && s.range() == snippet.range());
                    if !held {
                        code_snippets.push(snippet);
                    }
                }
            }

            let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };
            ConsolidatedTheme {
                id: Uuid::new_v4().to_string(),
                name: assignment.name,
                description: assignment.description,
                affected_files,
                code_snippets,
                confidence: node.confidence,
                context: assignment.rationale,
                level: node.level + 1,
                parent_id: Some(node.id.clone()),
                child_themes: Vec::new(),
                source_themes: node.source_themes.clone(),
                consolidation_method: ConsolidationMethod::Expansion,
                is_atomic: None,
                is_expanded: None,
                business_value: non_empty(assignment.business_value),
                technical_purpose: non_empty(assignment.technical_purpose),
            }
        })
        .collect()
}
