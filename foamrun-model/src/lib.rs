//! Core data model definitions shared across FoamRun crates.
#![allow(missing_docs)]

pub mod field;
pub mod run;
pub mod series;

// Intentionally curated re-exports for downstream consumers.
pub use field::{FieldKind, FieldValue};
pub use run::{RunRecord, RunStatus};
pub use series::{PlotData, PlotPoint, ResidualData, SeriesMap};
