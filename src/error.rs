//! Typed errors surfaced by the consolidation engine.
//!
//! Oracle failures never show up here: they degrade to heuristic or
//! conservative values inside each stage. What remains are the cases a caller
//! has to decide about: a child partition that does not add up, and a
//! configuration that makes every oracle call fail.

use crate::theme::LineRange;
use thiserror::Error;

/// A set of child code assignments that does not exactly cover its parent's code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("child '{child}' of '{node_name}' ({node_id}) has no code assigned")]
    EmptyAssignment {
        node_id: String,
        node_name: String,
        child: String,
    },

    #[error("child '{child}' of '{node_name}' ({node_id}) has an empty span {range} in {file}")]
    EmptySpan {
        node_id: String,
        node_name: String,
        child: String,
        file: String,
        range: LineRange,
    },

    #[error(
        "child '{child}' of '{node_name}' ({node_id}) references {file}, which is not among the parent's files {expected:?}"
    )]
    ForeignFile {
        node_id: String,
        node_name: String,
        child: String,
        file: String,
        expected: Vec<String>,
    },

    #[error(
        "child '{child}' of '{node_name}' ({node_id}) claims {file} {range}, outside the parent's code"
    )]
    OutOfBounds {
        node_id: String,
        node_name: String,
        child: String,
        file: String,
        range: LineRange,
    },

    #[error(
        "'{node_name}' ({node_id}): {file} {range} is assigned to both '{first_child}' and '{second_child}'"
    )]
    DoubleAssigned {
        node_id: String,
        node_name: String,
        file: String,
        range: LineRange,
        first_child: String,
        second_child: String,
    },

    #[error("'{node_name}' ({node_id}): whole file {file} is assigned to both '{first_child}' and '{second_child}'")]
    DoubleAssignedFile {
        node_id: String,
        node_name: String,
        file: String,
        first_child: String,
        second_child: String,
    },

    #[error("'{node_name}' ({node_id}): {file} lines {} are not assigned to any child", format_ranges(.missing))]
    Unassigned {
        node_id: String,
        node_name: String,
        file: String,
        missing: Vec<LineRange>,
    },

    #[error("'{node_name}' ({node_id}): file {file} is not assigned to any child")]
    UnassignedFile {
        node_id: String,
        node_name: String,
        file: String,
    },
}

impl PartitionError {
    pub fn node_id(&self) -> &str {
        match self {
            PartitionError::EmptyAssignment { node_id, .. }
            | PartitionError::EmptySpan { node_id, .. }
            | PartitionError::ForeignFile { node_id, .. }
            | PartitionError::OutOfBounds { node_id, .. }
            | PartitionError::DoubleAssigned { node_id, .. }
            | PartitionError::DoubleAssignedFile { node_id, .. }
            | PartitionError::Unassigned { node_id, .. }
            | PartitionError::UnassignedFile { node_id, .. } => node_id,
        }
    }
}

fn format_ranges(ranges: &[LineRange]) -> String {
    ranges
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// The oracle (or the engine configuration) cannot work at all, e.g. no API key.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Raised only when `strict_partition` is enabled; otherwise the subtree is kept unexpanded.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned_message_names_missing_span() {
        let err = PartitionError::Unassigned {
            node_id: "n1".to_string(),
            node_name: "Checkout flow".to_string(),
            file: "src/cart.rs".to_string(),
            missing: vec![LineRange::new(7, 7), LineRange::new(10, 12)],
        };
        let msg = err.to_string();
        assert!(msg.contains("src/cart.rs"));
        assert!(msg.contains("L7, L10-L12"));
        assert_eq!(err.node_id(), "n1");
    }

    #[test]
    fn test_partition_error_converts_into_consolidation_error() {
        let err: ConsolidationError = PartitionError::UnassignedFile {
            node_id: "n1".to_string(),
            node_name: "Root".to_string(),
            file: "a.rs".to_string(),
        }
        .into();
        assert!(matches!(err, ConsolidationError::Partition(_)));
    }
}
