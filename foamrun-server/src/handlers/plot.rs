use crate::errors::{AppError, AppResult};
use crate::handlers::{mtime_secs, path_mtime, resolve_case, TutorialQuery};
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

pub const LOG_FILE: &str = "log.foamRun";

/// Points served per series; steady-state polling reads a bounded window.
const MAX_POINTS: usize = 100;

/// `GET /api/plot_data?tutorial=`: time series with ETag validation.
/// The validator pairs the case directory's mtime with the latest time
/// step's mtime, so a 304 costs two stats.
pub async fn plot_data(
    State(state): State<AppState>,
    Query(query): Query<TutorialQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let case_dir = resolve_case(&state, &query.tutorial)?;

    let case_mtime = path_mtime(&case_dir);
    let times = state.snapshots.index().list_times(&case_dir, case_mtime);
    let latest_mtime = times
        .last()
        .and_then(|latest| path_mtime(&case_dir.join(latest)));

    let etag = match (case_mtime, latest_mtime) {
        (Some(case), Some(latest)) => Some(format!(
            "\"{}-{}\"",
            mtime_secs(case),
            mtime_secs(latest)
        )),
        _ => None,
    };

    if let Some(etag) = &etag {
        if if_none_match(&headers, etag) {
            return Ok(not_modified(etag, None));
        }
    }

    let engine = state.snapshots.clone();
    let dir = case_dir.clone();
    let data = tokio::task::spawn_blocking(move || {
        engine.snapshot_with_hints(&dir, MAX_POINTS, case_mtime, latest_mtime)
    })
    .await
    .map_err(|_| AppError::internal("An internal server error occurred."))?;

    let mut response = Json(data).into_response();
    attach_validator(&mut response, etag.as_deref(), None);
    Ok(response)
}

/// `GET /api/residuals?tutorial=`: residual history validated by the
/// log's (mtime, size) pair, with Last-Modified alongside the ETag.
pub async fn residuals(
    State(state): State<AppState>,
    Query(query): Query<TutorialQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let case_dir = resolve_case(&state, &query.tutorial)?;
    let log_path = case_dir.join(LOG_FILE);

    let validators = std::fs::metadata(&log_path)
        .ok()
        .and_then(|meta| Some((meta.modified().ok()?, meta.len())));
    let etag =
        validators.map(|(mtime, size)| format!("\"{}-{}\"", mtime_secs(mtime), size));
    let last_modified = validators.map(|(mtime, _)| httpdate::fmt_http_date(mtime));

    if let Some(etag) = &etag {
        if if_none_match(&headers, etag) {
            return Ok(not_modified(etag, last_modified.as_deref()));
        }
    }
    if headers.get(header::IF_NONE_MATCH).is_none() {
        if let (Some((mtime, _)), Some(since)) = (validators, if_modified_since(&headers)) {
            if whole_seconds(mtime) <= whole_seconds(since) {
                return Ok(not_modified(
                    etag.as_deref().unwrap_or(""),
                    last_modified.as_deref(),
                ));
            }
        }
    }

    let parser = state.residuals.clone();
    let dir = case_dir.clone();
    let data = tokio::task::spawn_blocking(move || parser.residuals(&dir, LOG_FILE))
        .await
        .map_err(|_| AppError::internal("An internal server error occurred."))?;

    let mut response = Json(data).into_response();
    attach_validator(&mut response, etag.as_deref(), last_modified.as_deref());
    Ok(response)
}

/// `GET /api/latest_data?tutorial=`: one sample per field from the
/// newest time step.
pub async fn latest_data(
    State(state): State<AppState>,
    Query(query): Query<TutorialQuery>,
) -> AppResult<Response> {
    let case_dir = resolve_case(&state, &query.tutorial)?;
    let engine = state.snapshots.clone();
    let point = tokio::task::spawn_blocking(move || engine.latest_data(&case_dir))
        .await
        .map_err(|_| AppError::internal("An internal server error occurred."))?;

    Ok(Json(point.unwrap_or_default()).into_response())
}

/// `GET /api/available_fields?tutorial=`: file names of the newest
/// time step.
pub async fn available_fields(
    State(state): State<AppState>,
    Query(query): Query<TutorialQuery>,
) -> AppResult<Response> {
    let case_dir = resolve_case(&state, &query.tutorial)?;
    let engine = state.snapshots.clone();
    let fields = tokio::task::spawn_blocking(move || engine.available_fields(&case_dir))
        .await
        .map_err(|_| AppError::internal("An internal server error occurred."))?;

    Ok(Json(json!({ "fields": fields })).into_response())
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag)
}

fn if_modified_since(headers: &HeaderMap) -> Option<SystemTime> {
    let value = headers.get(header::IF_MODIFIED_SINCE)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

fn whole_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn not_modified(etag: &str, last_modified: Option<&str>) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    attach_validator(&mut response, Some(etag).filter(|e| !e.is_empty()), last_modified);
    response
}

fn attach_validator(response: &mut Response, etag: Option<&str>, last_modified: Option<&str>) {
    if let Some(value) = etag.and_then(|e| HeaderValue::from_str(e).ok()) {
        response.headers_mut().insert(header::ETAG, value);
    }
    if let Some(value) = last_modified.and_then(|lm| HeaderValue::from_str(lm).ok()) {
        response.headers_mut().insert(header::LAST_MODIFIED, value);
    }
}
