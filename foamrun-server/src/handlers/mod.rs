//! Request handlers.

pub mod case;
pub mod geometry;
pub mod plot;
pub mod run;
pub mod runs;
pub mod ws;

use crate::errors::AppError;
use crate::AppState;
use foamrun_core::security;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Query string shared by the snapshot endpoints.
#[derive(Debug, Deserialize)]
pub struct TutorialQuery {
    pub tutorial: String,
}

/// Resolve a tutorial name against the configured case root. Every path
/// consumed by the data plane goes through here first.
pub(crate) fn resolve_case(state: &AppState, tutorial: &str) -> Result<PathBuf, AppError> {
    let root = state.case_root();
    Ok(security::resolve(&root, tutorial)?)
}

/// Mtime as fractional Unix seconds, used as an opaque validator
/// component.
pub(crate) fn mtime_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn path_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
