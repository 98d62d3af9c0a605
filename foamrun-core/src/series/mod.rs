//! Time-directory indexing and time-series assembly.

pub mod engine;
pub mod time_dirs;

pub use engine::{pressure_coefficient, SnapshotEngine};
pub use time_dirs::TimeIndex;
