use crate::errors::{AppError, AppResult};
use crate::handlers::resolve_case;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use foamrun_core::security;
use serde::Deserialize;
use serde_json::json;

const ALLOWED_EXTENSIONS: [&str; 3] = [".stl", ".obj", ".gz"];

#[derive(Debug, Deserialize)]
pub struct GeometryUploadQuery {
    pub tutorial: String,
    pub filename: String,
}

/// `POST /api/geometry/upload?tutorial=&filename=`: validate the upload
/// destination. Storage itself belongs to the geometry collaborator;
/// this surface only runs the case and file name through path
/// resolution and reports where the file would land.
pub async fn upload_geometry(
    State(state): State<AppState>,
    Query(query): Query<GeometryUploadQuery>,
) -> AppResult<Response> {
    let case_dir = resolve_case(&state, &query.tutorial)?;

    let filename = query.filename;
    if !security::is_safe_script_name(&filename)
        || !ALLOWED_EXTENSIONS
            .iter()
            .any(|ext| filename.to_lowercase().ends_with(ext))
    {
        return Err(AppError::bad_request(
            "Only .stl, .obj, and .gz files are allowed.",
        ));
    }

    // Nothing is written here; the validated destination is handed to
    // the collaborator that owns geometry storage.
    security::safe_join(&case_dir, ["constant", "triSurface", &filename])?;

    Ok((
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "status": "delegated",
            "message": "Geometry storage is handled by the geometry service",
            "destination": format!("constant/triSurface/{filename}"),
        })),
    )
        .into_response())
}
