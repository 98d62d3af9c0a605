//! # FoamRun Core
//!
//! Data-plane services for the FoamRun CFD orchestrator: field file
//! parsing, time-series assembly, incremental solver-log extraction,
//! cache governance, container execution, and the run journal.

pub mod cache;
pub mod docker;
pub mod error;
pub mod fields;
pub mod journal;
pub mod residuals;
pub mod security;
pub mod series;

pub use cache::CacheGovernor;
pub use docker::{
    ContainerHandle, ContainerRunner, Mount, RunOutput, RunnerConfig, StreamingRun,
};
pub use error::{CoreError, Result};
pub use fields::{FieldReader, ReadOptions};
pub use journal::RunJournal;
pub use residuals::ResidualParser;
pub use series::{SnapshotEngine, TimeIndex};
