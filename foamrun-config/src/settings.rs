use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default on-disk configuration file name.
pub const CONFIG_FILE: &str = "case_config.json";

const DEFAULT_DOCKER_IMAGE: &str = "haldardhruv/ubuntu_noble_openfoam:v12";
const DEFAULT_OPENFOAM_VERSION: &str = "12";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Contents of `case_config.json`.
///
/// Field names mirror the on-disk keys, which are uppercase for the
/// operator-facing settings and snake_case for the flags written by the
/// startup permission probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "CASE_ROOT")]
    pub case_root: PathBuf,

    #[serde(rename = "DOCKER_IMAGE")]
    pub docker_image: String,

    #[serde(rename = "OPENFOAM_VERSION")]
    pub openfoam_version: String,

    /// Extra WebSocket `Origin` values accepted besides the server's own.
    #[serde(rename = "ALLOWED_ORIGINS", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_setup_done: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_run_as_user: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_gid: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        let case_root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("tutorial_cases");
        Self {
            case_root,
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            openfoam_version: DEFAULT_OPENFOAM_VERSION.to_string(),
            allowed_origins: Vec::new(),
            initial_setup_done: None,
            docker_run_as_user: None,
            docker_uid: None,
            docker_gid: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unreadable. A malformed file is logged and ignored rather
    /// than aborting startup.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Could not parse config file {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Could not read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Persist the settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Solver environment file sourced inside the container.
    pub fn bashrc_path(&self) -> String {
        format!("/opt/openfoam{}/etc/bashrc", self.openfoam_version)
    }

    /// Fixed container path the host case root is bound to.
    pub fn container_run_path(&self) -> String {
        format!("/home/foam/OpenFOAM/{}/run", self.openfoam_version)
    }
}
