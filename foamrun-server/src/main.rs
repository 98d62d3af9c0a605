//! # FoamRun Server
//!
//! Orchestrator and observability service for containerized CFD runs.
//!
//! ## Overview
//!
//! The server binds a case directory on the host into an OpenFOAM
//! container, runs solver and utility commands inside it, and streams the
//! solver's stdout plus continuously-updated on-disk field and log data
//! back to clients in near real time:
//!
//! - **Execution**: validated commands run in throwaway containers with
//!   guaranteed teardown, journaled to SQLite
//! - **Snapshots**: field files are parsed into aligned time series with
//!   an append-only stable-history cache and per-case LRU eviction
//! - **Residuals**: the solver log is re-read incrementally from the last
//!   parsed offset
//! - **Delivery**: JSON endpoints with ETag/Last-Modified validation, a
//!   chunked text stream for live runs, and a WebSocket push channel

/// HTTP and WebSocket handlers.
pub mod handlers;

/// Middleware implementations.
pub mod middleware;

/// Error types and handling.
pub mod errors;


use axum::{
    response::Html,
    routing::{get, post},
    Router,
};
use clap::Parser;
use foamrun_config::{Settings, CONFIG_FILE};
use foamrun_core::docker::{
    run_initial_setup, SetupState, StartupStatus, SETUP_TIME_BUDGET,
};
use foamrun_core::{
    CacheGovernor, ContainerRunner, ResidualParser, RunJournal, RunnerConfig, SnapshotEngine,
};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Request bodies (geometry uploads included) are capped at 500 MiB.
const MAX_BODY_BYTES: usize = 500 * 1024 * 1024;

/// Command line arguments for the FoamRun server
#[derive(Parser, Debug)]
#[command(name = "foamrun-server")]
#[command(about = "Orchestrator and observability service for containerized CFD simulations")]
struct Args {
    /// Bind address
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 5000)]
    port: u16,

    /// Path to the persistent configuration file
    #[arg(long, env = "FOAMRUN_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Enforce CSRF token validation on mutating requests
    #[arg(long, env = "FOAMRUN_ENABLE_CSRF", default_value_t = false)]
    enable_csrf: bool,
}

// Server application state
#[derive(Clone)]
pub struct AppState {
    pub config_path: PathBuf,
    pub settings: Arc<RwLock<Settings>>,
    pub cache: Arc<CacheGovernor>,
    pub snapshots: Arc<SnapshotEngine>,
    pub residuals: Arc<ResidualParser>,
    pub runner: Arc<ContainerRunner>,
    pub journal: Arc<RunJournal>,
    pub startup: Arc<RwLock<StartupStatus>>,
    /// WebSocket `Origin` values accepted in addition to the configured
    /// extras.
    pub self_origins: Arc<Vec<String>>,
    pub enforce_csrf: bool,
}

impl AppState {
    pub fn case_root(&self) -> PathBuf {
        self.settings.read().case_root.clone()
    }

    /// Runner parameters derived from the current settings.
    pub fn runner_config(&self) -> RunnerConfig {
        let settings = self.settings.read();
        let run_as_user = match (settings.docker_run_as_user, settings.docker_uid, settings.docker_gid)
        {
            (Some(true), Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        };
        RunnerConfig {
            image: settings.docker_image.clone(),
            bashrc: settings.bashrc_path(),
            container_run_path: settings.container_run_path(),
            run_as_user,
        }
    }

    /// Persist the current settings, logging rather than failing the
    /// request on error.
    pub fn save_settings(&self) {
        let settings = self.settings.read().clone();
        if let Err(e) = settings.save(&self.config_path) {
            error!("Could not save config: {e}");
        }
    }
}

fn build_state(
    config_path: PathBuf,
    journal: RunJournal,
    port: u16,
    enforce_csrf: bool,
) -> AppState {
    let settings = Settings::load(&config_path);
    let cache = Arc::new(CacheGovernor::from_env());

    let self_origins = vec![
        format!("http://localhost:{port}"),
        format!("http://127.0.0.1:{port}"),
    ];

    AppState {
        config_path,
        settings: Arc::new(RwLock::new(settings)),
        snapshots: Arc::new(SnapshotEngine::new(cache.clone())),
        residuals: Arc::new(ResidualParser::new(cache.clone())),
        cache,
        runner: Arc::new(ContainerRunner::new()),
        journal: Arc::new(journal),
        startup: Arc::new(RwLock::new(StartupStatus::pending())),
        self_origins: Arc::new(self_origins),
        enforce_csrf,
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get_case_root", get(handlers::case::get_case_root))
        .route("/set_case", post(handlers::case::set_case))
        .route("/get_docker_config", get(handlers::case::get_docker_config))
        .route("/set_docker_config", post(handlers::case::set_docker_config))
        .route("/load_tutorial", post(handlers::run::load_tutorial))
        .route("/run", post(handlers::run::run_case))
        .route("/api/plot_data", get(handlers::plot::plot_data))
        .route("/api/residuals", get(handlers::plot::residuals))
        .route("/api/latest_data", get(handlers::plot::latest_data))
        .route(
            "/api/available_fields",
            get(handlers::plot::available_fields),
        )
        .route("/api/runs", get(handlers::runs::list_runs))
        .route("/api/case/create", post(handlers::case::create_case))
        .route(
            "/api/geometry/upload",
            post(handlers::geometry::upload_geometry),
        )
        .route("/api/tutorials", get(handlers::case::tutorials))
        .route("/api/startup_status", get(handlers::case::startup_status))
        .route("/api/clear_cache", post(handlers::case::clear_cache))
        .route("/ws/data", get(handlers::ws::ws_data))
        .layer(axum::middleware::from_fn(
            middleware::cache_headers::apply_cache_policy,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::csrf::csrf_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Landing page; the full UI is served by a separate frontend.
async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\n<html><head><title>FoamRun</title></head>\n\
         <body><h1>FoamRun</h1>\n\
         <p>CFD orchestration service is running. See <code>/api/startup_status</code>.</p>\n\
         </body></html>",
    )
}

/// Run the startup checks in the background and persist their outcome.
fn spawn_startup_checks(state: AppState) {
    tokio::spawn(async move {
        if state.settings.read().initial_setup_done == Some(true) {
            *state.startup.write() = StartupStatus {
                status: SetupState::Completed,
                message: "Initial setup already completed".into(),
            };
            return;
        }

        *state.startup.write() = StartupStatus {
            status: SetupState::Running,
            message: "Running startup checks".into(),
        };

        let cfg = state.runner_config();
        let case_root = state.case_root();
        let status_handle = state.startup.clone();
        let on_status = move |message: &str| {
            status_handle.write().message = message.to_string();
        };

        let result = tokio::time::timeout(
            SETUP_TIME_BUDGET,
            run_initial_setup(&state.runner, &cfg, &case_root, on_status),
        )
        .await;

        match result {
            Ok(Ok(outcome)) => {
                {
                    let mut settings = state.settings.write();
                    settings.initial_setup_done = Some(true);
                    settings.docker_run_as_user = Some(outcome.run_as_user);
                    settings.docker_uid = outcome.uid;
                    settings.docker_gid = outcome.gid;
                }
                state.save_settings();
                *state.startup.write() = StartupStatus {
                    status: SetupState::Completed,
                    message: "Startup checks passed".into(),
                };
                info!("Startup checks passed");
            }
            Ok(Err(e)) => {
                let err: errors::AppError = e.into();
                warn!("Startup checks failed: {}", err.message);
                *state.startup.write() = StartupStatus {
                    status: SetupState::Failed,
                    message: err.message,
                };
            }
            Err(_) => {
                warn!("Startup checks timed out");
                *state.startup.write() = StartupStatus {
                    status: SetupState::Failed,
                    message: "Startup checks timed out".into(),
                };
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let journal_path = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.join("runs.db"))
        .unwrap_or_else(|| PathBuf::from("runs.db"));
    let journal = RunJournal::open(&journal_path).await?;

    let state = build_state(args.config, journal, args.port, args.enable_csrf);
    {
        let case_root = state.case_root();
        if let Err(e) = std::fs::create_dir_all(&case_root) {
            warn!("Could not create case root: {e}");
        }
    }
    spawn_startup_checks(state.clone());

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("FoamRun server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
