//! Image inspection endpoints.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use vantage_image::InspectRequest;

use crate::{error::ApiError, non_empty, AppState};

#[derive(Deserialize)]
pub(crate) struct ImageParams {
    image: String,
    namespace: Option<String>,
    pod: Option<String>,
}

impl ImageParams {
    fn request(self) -> Result<InspectRequest, ApiError> {
        if self.image.is_empty() {
            return Err(ApiError::BadRequest("image parameter required".into()));
        }
        Ok(InspectRequest {
            image: self.image,
            namespace: non_empty(self.namespace),
            pod: non_empty(self.pod),
        })
    }
}

pub(crate) async fn metadata(
    State(state): State<AppState>,
    Query(params): Query<ImageParams>,
) -> Result<Json<vantage_image::ImageMetadata>, ApiError> {
    let req = params.request()?;
    Ok(Json(state.inspector.metadata(&req).await?))
}

pub(crate) async fn inspect(
    State(state): State<AppState>,
    Query(params): Query<ImageParams>,
) -> Result<Json<vantage_image::ImageFilesystem>, ApiError> {
    let req = params.request()?;
    Ok(Json(state.inspector.inspect(&req).await?))
}

#[derive(Deserialize)]
pub(crate) struct FileParams {
    image: String,
    path: String,
    namespace: Option<String>,
    pod: Option<String>,
}

pub(crate) async fn file(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.path.is_empty() {
        return Err(ApiError::BadRequest("path parameter required".into()));
    }
    let req = InspectRequest {
        image: params.image,
        namespace: non_empty(params.namespace),
        pod: non_empty(params.pod),
    };
    let (content, filename) = state.inspector.file(&req, &params.path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        content,
    ))
}
