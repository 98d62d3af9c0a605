use crate::handlers::{mtime_secs, path_mtime, resolve_case, TutorialQuery};
use crate::handlers::plot::LOG_FILE;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WS_MAX_POINTS: usize = 100;

/// `GET /ws/data?tutorial=`: push `{plot_data, residuals, timestamp}`
/// frames whenever the case's observable state changes. Connections from
/// origins outside the allow-list are rejected before the upgrade.
pub async fn ws_data(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TutorialQuery>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let case_dir = match resolve_case(&state, &query.tutorial) {
        Ok(dir) => dir,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| poll_case(socket, state, case_dir))
}

/// A browser's `Origin` must match the server's own origins or a
/// configured extra; requests without one (curl, native clients) pass.
pub(crate) fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    state.self_origins.iter().any(|o| o == origin)
        || state
            .settings
            .read()
            .allowed_origins
            .iter()
            .any(|o| o == origin)
}

async fn poll_case(mut socket: WebSocket, state: AppState, case_dir: PathBuf) {
    let mut last_validator: Option<(f64, f64)> = None;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let validator = observable_state(&state, &case_dir);
                if last_validator == Some(validator) {
                    continue;
                }

                let engine = state.snapshots.clone();
                let parser = state.residuals.clone();
                let dir = case_dir.clone();
                let computed = tokio::task::spawn_blocking(move || {
                    let plot = engine.snapshot(&dir, WS_MAX_POINTS);
                    let residuals = parser.residuals(&dir, LOG_FILE);
                    (plot, residuals)
                })
                .await;

                let (plot, residuals) = match computed {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Error in websocket poll: {e}");
                        continue;
                    }
                };

                let frame = json!({
                    "plot_data": plot,
                    "residuals": residuals,
                    "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
                });
                if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
                last_validator = Some(validator);
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!("WebSocket client disconnected");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// The change detector: (log mtime, latest time-dir mtime). Either value
/// moving means new data is observable.
fn observable_state(state: &AppState, case_dir: &Path) -> (f64, f64) {
    let log_mtime = path_mtime(&case_dir.join(LOG_FILE))
        .map(mtime_secs)
        .unwrap_or(0.0);

    let times = state.snapshots.index().list_times(case_dir, None);
    let latest_mtime = times
        .last()
        .and_then(|latest| path_mtime(&case_dir.join(latest)))
        .map(mtime_secs)
        .unwrap_or(0.0);

    (log_mtime, latest_mtime)
}
