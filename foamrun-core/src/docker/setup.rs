//! First-run environment checks: docker binary, daemon reachability,
//! image availability, and the file-permission probe that decides whether
//! containers must run with the host user's uid/gid.

use crate::docker::runner::{ContainerRunner, Mount, RunnerConfig};
use crate::docker::script;
use crate::error::{CoreError, Result};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Overall wall-clock budget for the startup checks, image pull included.
pub const SETUP_TIME_BUDGET: Duration = Duration::from_secs(300);

const CONTAINER_CHECK_PATH: &str = "/tmp/foamrun_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Progress of the startup checks, served by `/api/startup_status`.
#[derive(Debug, Clone, Serialize)]
pub struct StartupStatus {
    pub status: SetupState,
    pub message: String,
}

impl StartupStatus {
    pub fn pending() -> Self {
        Self {
            status: SetupState::Pending,
            message: "Startup checks not yet run".into(),
        }
    }
}

/// What the permission probe decided; persisted into the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupOutcome {
    pub run_as_user: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Run the startup checks. The caller wraps this in
/// [`SETUP_TIME_BUDGET`] and persists the outcome flags.
pub async fn run_initial_setup(
    runner: &ContainerRunner,
    cfg: &RunnerConfig,
    case_root: &Path,
    on_status: impl Fn(&str),
) -> Result<SetupOutcome> {
    info!("Performing first-time setup checks");

    if which::which("docker").is_err() {
        return Err(CoreError::RuntimeUnavailable(
            "Docker is not installed or not in PATH. Please install Docker first.".into(),
        ));
    }

    runner.ping().await?;

    if !runner.image_exists(&cfg.image).await? {
        let msg = format!(
            "Docker image '{}' not found. Pulling now... (large download)",
            cfg.image
        );
        info!("{msg}");
        on_status(&msg);
        runner.pull_image(&cfg.image).await?;
        info!("Image {} pulled successfully", cfg.image);
    }

    permission_probe(runner, cfg, case_root).await
}

/// Check whether a container writing into the mounted case root produces
/// files the host user cannot delete, and if so whether a uid/gid mapping
/// fixes it. Non-Linux hosts delegate permissions to the runtime VM.
#[cfg(unix)]
async fn permission_probe(
    runner: &ContainerRunner,
    cfg: &RunnerConfig,
    case_root: &Path,
) -> Result<SetupOutcome> {
    std::fs::create_dir_all(case_root)?;

    let filename = format!(".permission_test_{}", Uuid::new_v4().simple());
    let host_probe = case_root.join(&filename);
    let mounts = [Mount {
        host: case_root.to_path_buf(),
        container: CONTAINER_CHECK_PATH.to_string(),
    }];

    info!("Permission check: attempting default write");
    let default_cfg = RunnerConfig {
        run_as_user: None,
        ..cfg.clone()
    };
    let job = script::touch_probe_job(CONTAINER_CHECK_PATH, &filename);
    let output = runner.run_blocking(&default_cfg, &job, &mounts, None).await?;

    if output.exit_code == 0 && host_probe.exists() {
        match std::fs::remove_file(&host_probe) {
            Ok(()) => {
                info!("Permission check passed with default container user");
                return Ok(SetupOutcome::default());
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!("Probe file is not deletable by the host user; retrying with uid mapping");
                // The root-owned probe must be removed through a container.
                let cleanup = script::remove_probe_job(CONTAINER_CHECK_PATH, &filename);
                if let Err(e) = runner.run_blocking(&default_cfg, &cleanup, &mounts, None).await {
                    warn!("Could not clean up probe file: {e}");
                }
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        warn!("Default permission check failed; retrying with uid mapping");
    }

    let (uid, gid) = current_uid_gid();
    let user_cfg = RunnerConfig {
        run_as_user: Some((uid, gid)),
        ..cfg.clone()
    };
    info!("Permission check: attempting write as {uid}:{gid}");
    let output = runner.run_blocking(&user_cfg, &job, &mounts, None).await?;
    if output.exit_code != 0 || !host_probe.exists() {
        return Err(CoreError::Docker(
            "Container failed to write test file with user mapping".into(),
        ));
    }
    std::fs::remove_file(&host_probe)?;

    info!("Permission check passed with uid mapping");
    Ok(SetupOutcome {
        run_as_user: true,
        uid: Some(uid),
        gid: Some(gid),
    })
}

#[cfg(not(unix))]
async fn permission_probe(
    _runner: &ContainerRunner,
    _cfg: &RunnerConfig,
    _case_root: &Path,
) -> Result<SetupOutcome> {
    Ok(SetupOutcome::default())
}

#[cfg(unix)]
fn current_uid_gid() -> (u32, u32) {
    // Safety: getuid/getgid cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}
