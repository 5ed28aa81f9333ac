//! canopy library crate
//!
//! Consolidates flat, independently derived change themes into a deduplicated
//! drill-down tree. [`ConsolidationPipeline`] runs the whole thing; the stage
//! modules are public so benchmarks and other tools can drive them directly.

pub mod cache;
pub mod config;
pub mod cross_level;
pub mod dedup;
pub mod error;
pub mod expansion;
pub mod grouping;
pub mod heuristics;
pub mod hierarchy;
pub mod integrity;
pub mod merge;
pub mod metrics;
pub mod oracle;
pub mod pipeline;
pub mod similarity;
pub mod text;
pub mod theme;

pub use config::{ConsolidationConfig, Settings};
pub use error::{ConsolidationError, PartitionError};
pub use pipeline::{ConsolidationOutcome, ConsolidationPipeline};
pub use theme::{ConsolidatedTheme, Theme};
