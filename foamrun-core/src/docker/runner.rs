use crate::docker::script::{self, ShellJob};
use crate::error::{CoreError, Result};
use crate::security::sanitize::redact_paths;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of the decoded-line channel. A slow consumer blocks the
/// reader, leaving buffered bytes with the runtime instead of in memory.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Everything the runner needs to start a container for the current
/// configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub image: String,
    pub bashrc: String,
    pub container_run_path: String,
    /// `--user uid:gid` mapping chosen by the startup permission probe.
    pub run_as_user: Option<(u32, u32)>,
}

/// One host directory bound read-write into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

/// Captured output of a blocking run.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// A started container, identified by its generated name. Teardown is
/// idempotent: kill if still running, then remove.
#[derive(Debug)]
pub struct ContainerHandle {
    name: String,
    torn_down: AtomicBool,
}

impl ContainerHandle {
    fn new(name: String) -> Self {
        Self {
            name,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kill and remove the container. Errors here are logged and
    /// swallowed; the container may already be gone.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = Command::new("docker")
            .args(["kill", &self.name])
            .output()
            .await
        {
            warn!("Could not kill container {}: {e}", self.name);
        }
        if let Err(e) = Command::new("docker")
            .args(["rm", "-f", &self.name])
            .output()
            .await
        {
            warn!("Could not remove container {}: {e}", self.name);
        }
    }
}

/// A streaming run: decoded output lines plus the eventual exit code.
/// Dropping `lines` makes the reader's send fail, which triggers
/// teardown: channel closure is the cancellation primitive.
#[derive(Debug)]
pub struct StreamingRun {
    pub handle: Arc<ContainerHandle>,
    pub lines: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<i64>,
}

/// Container execution over the docker CLI.
#[derive(Debug, Clone, Default)]
pub struct ContainerRunner;

impl ContainerRunner {
    pub fn new() -> Self {
        Self
    }

    /// Check that the docker daemon answers.
    pub async fn ping(&self) -> Result<()> {
        let output = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(spawn_error)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("permission denied") {
            return Err(CoreError::Docker(
                "Docker exists but permission denied. Add your user to the 'docker' group and re-login."
                    .into(),
            ));
        }
        Err(CoreError::RuntimeUnavailable(redact_paths(&stderr)))
    }

    /// Whether the configured image is already present locally.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(spawn_error)?;
        Ok(output.success())
    }

    /// Pull the configured image.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let output = Command::new("docker")
            .args(["pull", image])
            .output()
            .await
            .map_err(spawn_error)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CoreError::Docker(redact_paths(&String::from_utf8_lossy(
                &output.stderr,
            ))))
        }
    }

    /// Run a job to completion and capture its output. The container is
    /// removed by the runtime (`--rm`) on every exit path.
    pub async fn run_blocking(
        &self,
        cfg: &RunnerConfig,
        job: &ShellJob,
        mounts: &[Mount],
        workdir: Option<&str>,
    ) -> Result<RunOutput> {
        let name = container_name();
        let mut cmd = docker_run_command(cfg, &name, job, mounts, workdir, true);

        let output = cmd.output().await.map_err(spawn_error)?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if daemon_unreachable(&stderr) {
            return Err(CoreError::RuntimeUnavailable(redact_paths(&stderr)));
        }

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code: output.status.code().unwrap_or(-1) as i64,
        })
    }

    /// Start a job and stream its decoded output lines. A dedicated
    /// reader per stream feeds the bounded channel; a supervisor waits
    /// for the process, tears the container down, and reports the exit
    /// code.
    pub async fn run_streaming(
        &self,
        cfg: &RunnerConfig,
        job: &ShellJob,
        mounts: &[Mount],
        workdir: Option<&str>,
    ) -> Result<StreamingRun> {
        let name = container_name();
        let mut cmd = docker_run_command(cfg, &name, job, mounts, workdir, false);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = Arc::new(ContainerHandle::new(name));
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(stdout) = stdout {
            tokio::spawn(pump_lines(stdout, tx.clone(), handle.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump_lines(stderr, tx, handle.clone()));
        }

        let supervisor_handle = handle.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1) as i64,
                Err(e) => {
                    warn!("Error waiting for container process: {e}");
                    -1
                }
            };
            supervisor_handle.teardown().await;
            let _ = exit_tx.send(code);
        });

        Ok(StreamingRun {
            handle,
            lines: rx,
            exit: exit_rx,
        })
    }

    /// Explicitly stop a streaming run. Idempotent.
    pub async fn stop(&self, handle: &ContainerHandle) {
        handle.teardown().await;
    }

    /// Tutorials shipped in the image, as sorted `category/case` names.
    pub async fn list_tutorials(&self, cfg: &RunnerConfig) -> Result<Vec<String>> {
        let job = script::list_tutorials_job(&cfg.bashrc);
        let output = self.run_blocking(cfg, &job, &[], None).await?;
        if output.exit_code != 0 {
            return Err(CoreError::Docker(redact_paths(&output.stderr)));
        }

        let mut tutorials: Vec<String> = output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("./").map(str::to_string))
            .collect();
        tutorials.sort();
        Ok(tutorials)
    }
}

/// Read decoded lines into the channel. A failed send means the consumer
/// is gone: initiate teardown so the container stops within one poll
/// interval.
async fn pump_lines<R: AsyncRead + Unpin>(
    stream: R,
    tx: mpsc::Sender<String>,
    handle: Arc<ContainerHandle>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    debug!("Log consumer closed; tearing down {}", handle.name());
                    handle.teardown().await;
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading container output: {e}");
                break;
            }
        }
    }
}

fn docker_run_command(
    cfg: &RunnerConfig,
    name: &str,
    job: &ShellJob,
    mounts: &[Mount],
    workdir: Option<&str>,
    remove: bool,
) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("run").arg("--name").arg(name);
    if remove {
        cmd.arg("--rm");
    }
    for mount in mounts {
        cmd.arg("-v")
            .arg(format!("{}:{}:rw", mount.host.display(), mount.container));
    }
    if let Some(workdir) = workdir {
        cmd.arg("-w").arg(workdir);
    }
    if let Some((uid, gid)) = cfg.run_as_user {
        cmd.arg("--user").arg(format!("{uid}:{gid}"));
    }
    cmd.arg(&cfg.image).arg("bash").arg("-c").arg(&job.script);
    for arg in &job.args {
        cmd.arg(arg);
    }
    cmd.kill_on_drop(true);
    cmd
}

fn container_name() -> String {
    format!("foamrun-{}", uuid::Uuid::new_v4().simple())
}

fn spawn_error(e: std::io::Error) -> CoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CoreError::RuntimeUnavailable("docker binary not found".into())
    } else {
        CoreError::Io(e)
    }
}

fn daemon_unreachable(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("cannot connect to the docker daemon")
        || lowered.contains("is the docker daemon running")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RunnerConfig {
        RunnerConfig {
            image: "example/openfoam:v12".into(),
            bashrc: "/opt/openfoam12/etc/bashrc".into(),
            container_run_path: "/home/foam/OpenFOAM/12/run".into(),
            run_as_user: None,
        }
    }

    #[test]
    fn run_command_shape() {
        let job = script::solver_job(&cfg().bashrc, "/home/foam/OpenFOAM/12/run/cavity", "blockMesh")
            .unwrap();
        let mounts = [Mount {
            host: PathBuf::from("/data/cases"),
            container: cfg().container_run_path.clone(),
        }];
        let cmd = docker_run_command(&cfg(), "foamrun-test", &job, &mounts, Some("/work"), true);

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"/data/cases:/home/foam/OpenFOAM/12/run:rw".to_string()));
        assert!(args.contains(&"example/openfoam:v12".to_string()));
        assert!(args.contains(&"bash".to_string()));
        // User argv rides behind the script as positional parameters.
        assert_eq!(args.last().unwrap(), "blockMesh");
    }

    #[test]
    fn user_mapping_added_when_configured() {
        let mut config = cfg();
        config.run_as_user = Some((1000, 1000));
        let job = script::list_tutorials_job(&config.bashrc);
        let cmd = docker_run_command(&config, "foamrun-test", &job, &[], None, true);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let pos = args.iter().position(|a| a == "--user").unwrap();
        assert_eq!(args[pos + 1], "1000:1000");
    }

    #[test]
    fn daemon_detection_matches_cli_messages() {
        assert!(daemon_unreachable(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        ));
        assert!(!daemon_unreachable("Error: No such image: foo"));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let handle = ContainerHandle::new("foamrun-gone".into());
        handle.teardown().await;
        // Second call is a no-op regardless of the first one's outcome.
        handle.teardown().await;
        assert!(handle.torn_down.load(Ordering::SeqCst));
    }
}
