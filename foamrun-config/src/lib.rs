//! Persistent configuration for FoamRun.
//!
//! This crate owns the `case_config.json` file: defaults, loading with
//! merge-over-defaults semantics, and atomic-ish save. Both the server
//! binary and the core services read their Docker image, solver version,
//! and case-root settings through it.

pub mod settings;

pub use settings::{ConfigError, Settings, CONFIG_FILE};
