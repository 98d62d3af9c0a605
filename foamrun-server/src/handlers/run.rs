use crate::errors::{AppError, AppResult};
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use foamrun_core::docker::script;
use foamrun_core::security;
use foamrun_core::{CoreError, Mount};
use foamrun_model::RunStatus;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub tutorial: Option<String>,
    pub command: Option<String>,
    #[serde(rename = "caseDir")]
    pub case_dir: Option<String>,
}

/// `POST /run`: execute a validated solver command in a container bound
/// to the case directory, journal the run, and stream stdout lines as a
/// chunked `text/plain` response. Client disconnect tears the container
/// down through channel closure.
pub async fn run_case(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> AppResult<Response> {
    let command = req
        .command
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::bad_request("No command provided"))?;
    let (tutorial, case_dir) = match (req.tutorial, req.case_dir) {
        (Some(t), Some(c)) if !t.is_empty() && !c.is_empty() => (t, c),
        _ => return Err(AppError::bad_request("Missing tutorial or caseDir")),
    };

    security::validate_command(&command)?;

    let case_root = PathBuf::from(&case_dir);
    security::assert_safe_root(&case_root)?;
    security::resolve(&case_root, &tutorial)
        .map_err(|e| match e {
            CoreError::NotFound(_) | CoreError::InvalidPath(_) => {
                AppError::bad_request("Invalid tutorial path")
            }
            other => other.into(),
        })?;
    let host_root = case_root
        .canonicalize()
        .map_err(CoreError::Io)?;

    let cfg = state.runner_config();
    let container_case = format!("{}/{}", cfg.container_run_path, tutorial);
    let job = script::solver_job(&cfg.bashrc, &container_case, &command)?;
    let mounts = [Mount {
        host: host_root,
        container: cfg.container_run_path.clone(),
    }];

    // Fail with 503 before committing to a streaming response.
    state.runner.ping().await?;
    let run = state
        .runner
        .run_streaming(&cfg, &job, &mounts, Some(&container_case))
        .await?;

    let start_time = Utc::now();
    let case_name = tutorial
        .rsplit('/')
        .next()
        .unwrap_or(&tutorial)
        .to_string();
    let run_id = state
        .journal
        .record_start(&case_name, &tutorial, &command, start_time)
        .await?;

    // The finalizer outlives the response: it fires on normal exit, on
    // failure, and after a teardown caused by client disconnect.
    let journal = state.journal.clone();
    let exit = run.exit;
    tokio::spawn(async move {
        let code = exit.await.unwrap_or(-1);
        let end_time = Utc::now();
        let duration = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
        if let Err(e) = journal
            .record_end(run_id, RunStatus::from_exit_code(code), end_time, duration)
            .await
        {
            error!("Could not finalize run {run_id}: {e}");
        }
    });

    Ok(stream_response(run.lines))
}

#[derive(Debug, Deserialize)]
pub struct LoadTutorialRequest {
    pub tutorial: Option<String>,
}

/// `POST /load_tutorial`: copy a tutorial from the image into the case
/// root, streaming the container's output.
pub async fn load_tutorial(
    State(state): State<AppState>,
    Json(req): Json<LoadTutorialRequest>,
) -> AppResult<Response> {
    let tutorial = req
        .tutorial
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::bad_request("No tutorial selected"))?;

    let case_root = state.case_root();
    security::resolve_new(&case_root, &tutorial)
        .map_err(|_| AppError::bad_request("Invalid tutorial path"))?;
    std::fs::create_dir_all(&case_root).map_err(CoreError::Io)?;
    let host_root = case_root.canonicalize().map_err(CoreError::Io)?;

    let cfg = state.runner_config();
    let container_case = format!("{}/{}", cfg.container_run_path, tutorial);
    let job = script::load_tutorial_job(&cfg.bashrc, &container_case, &tutorial);
    let mounts = [Mount {
        host: host_root,
        container: cfg.container_run_path.clone(),
    }];

    state.runner.ping().await?;
    let run = state
        .runner
        .run_streaming(&cfg, &job, &mounts, Some(&cfg.container_run_path))
        .await?;

    Ok(stream_response(run.lines))
}

fn stream_response(lines: mpsc::Receiver<String>) -> Response {
    let body = Body::from_stream(
        ReceiverStream::new(lines)
            .map(|mut line| {
                line.push('\n');
                Ok::<Bytes, Infallible>(Bytes::from(line))
            }),
    );
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
