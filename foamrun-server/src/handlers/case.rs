use crate::errors::{AppError, AppResult};
use crate::AppState;
use axum::extract::{Query, State};
use axum::Json;
use foamrun_core::security;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

pub async fn get_case_root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "caseDir": state.case_root().display().to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct SetCaseRequest {
    #[serde(rename = "caseDir")]
    pub case_dir: Option<String>,
}

pub async fn set_case(
    State(state): State<AppState>,
    Json(req): Json<SetCaseRequest>,
) -> AppResult<Json<Value>> {
    let case_dir = req
        .case_dir
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::bad_request("No caseDir provided"))?;

    let path = PathBuf::from(&case_dir);
    security::assert_safe_root(&path)?;
    std::fs::create_dir_all(&path).map_err(foamrun_core::CoreError::Io)?;
    let resolved = path
        .canonicalize()
        .map_err(foamrun_core::CoreError::Io)?;

    {
        let mut settings = state.settings.write();
        settings.case_root = resolved.clone();
    }
    state.save_settings();
    info!("Case root set to {}", resolved.display());

    Ok(Json(json!({
        "caseDir": resolved.display().to_string(),
        "output": "Case root updated",
    })))
}

pub async fn get_docker_config(State(state): State<AppState>) -> Json<Value> {
    let settings = state.settings.read();
    Json(json!({
        "dockerImage": settings.docker_image,
        "openfoamVersion": settings.openfoam_version,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DockerConfigRequest {
    #[serde(rename = "dockerImage")]
    pub docker_image: Option<String>,
    #[serde(rename = "openfoamVersion")]
    pub openfoam_version: Option<Value>,
}

pub async fn set_docker_config(
    State(state): State<AppState>,
    Json(req): Json<DockerConfigRequest>,
) -> Json<Value> {
    {
        let mut settings = state.settings.write();
        if let Some(image) = req.docker_image {
            settings.docker_image = image;
        }
        if let Some(version) = req.openfoam_version {
            // Accept both string and numeric versions.
            settings.openfoam_version = match version {
                Value::String(s) => s,
                other => other.to_string(),
            };
        }
    }
    state.save_settings();

    let settings = state.settings.read();
    Json(json!({
        "output": "Docker config updated",
        "dockerImage": settings.docker_image,
        "openfoamVersion": settings.openfoam_version,
    }))
}

pub async fn startup_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.startup.read().clone();
    Json(serde_json::to_value(status).unwrap_or_else(|_| json!({})))
}

/// Tutorials available in the configured image. Failures degrade to an
/// empty list so a stopped daemon does not break the landing page.
pub async fn tutorials(State(state): State<AppState>) -> Json<Value> {
    let cfg = state.runner_config();
    let tutorials = match state.runner.list_tutorials(&cfg).await {
        Ok(tutorials) => tutorials,
        Err(e) => {
            warn!("Could not fetch tutorials: {e}");
            Vec::new()
        }
    };
    Json(json!({ "tutorials": tutorials }))
}

#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    #[serde(rename = "caseName")]
    pub case_name: Option<String>,
}

/// `POST /api/case/create`: lay out an empty case skeleton under the
/// case root. Dictionary templating belongs to a collaborator; only the
/// directory structure is created here, and only through resolved paths.
pub async fn create_case(
    State(state): State<AppState>,
    Json(req): Json<CreateCaseRequest>,
) -> AppResult<Json<Value>> {
    let name = req
        .case_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::bad_request("No caseName provided"))?;

    let root = state.case_root();
    let case_dir = security::resolve_new(&root, &name)?;
    std::fs::create_dir_all(&case_dir).map_err(foamrun_core::CoreError::Io)?;
    for subdir in ["0", "constant/triSurface", "system"] {
        let path = security::safe_join(&case_dir, subdir.split('/'))?;
        std::fs::create_dir_all(path).map_err(foamrun_core::CoreError::Io)?;
    }

    Ok(Json(json!({
        "status": "ok",
        "caseName": name,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ClearCacheQuery {
    pub tutorial: Option<String>,
}

pub async fn clear_cache(
    State(state): State<AppState>,
    Query(query): Query<ClearCacheQuery>,
) -> AppResult<Json<Value>> {
    match query.tutorial {
        Some(tutorial) => {
            let root = state.case_root();
            let case_dir = security::resolve_new(&root, &tutorial)?;
            state.cache.clear(&case_dir);
        }
        None => state.cache.clear_all(),
    }
    Ok(Json(json!({ "status": "ok" })))
}
