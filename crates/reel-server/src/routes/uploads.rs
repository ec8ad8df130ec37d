//! Upload handoff routes.
//!
//! The caller has already written the upload into the configured upload
//! directory; the body names that file and its declared MIME type. The
//! response is sent as soon as the upload is admitted; processing runs in
//! the background.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use reel_core::{AssetKey, EntityId, JobId, MediaKind, MediaStatus};
use reel_pipeline::StagedUpload;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    /// File name inside the upload directory.
    pub file: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub id: EntityId,
    pub kind: MediaKind,
    pub job_id: JobId,
    pub status: MediaStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: EntityId,
    pub cancelled: bool,
}

async fn hand_off(
    ctx: &AppContext,
    raw_id: String,
    kind: MediaKind,
    body: UploadRequest,
) -> Result<(StatusCode, Json<UploadAccepted>), AppError> {
    let id = EntityId::parse(raw_id)?;
    let upload = StagedUpload::in_upload_dir(
        &ctx.config.media.upload_dir,
        &body.file,
        id.clone(),
        kind,
        body.mime_type,
    )?;

    let (job_id, _handle) = ctx.controller.submit(upload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            id,
            kind,
            job_id,
            status: MediaStatus::Processing,
        }),
    ))
}

/// POST /api/videos/{id}/upload
pub async fn upload_video(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadAccepted>), AppError> {
    hand_off(&ctx, id, MediaKind::Video, body).await
}

/// POST /api/videos/{id}/thumbnail
pub async fn upload_thumbnail(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadAccepted>), AppError> {
    hand_off(&ctx, id, MediaKind::Thumbnail, body).await
}

/// POST /api/users/{id}/avatar
pub async fn upload_avatar(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadAccepted>), AppError> {
    hand_off(&ctx, id, MediaKind::ProfilePicture, body).await
}

/// DELETE /api/videos/{id}/upload -- cancel an in-flight transcode.
pub async fn cancel_video(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    let id = EntityId::parse(id)?;
    let key = AssetKey::video(id.clone());
    if !ctx.controller.cancel(&key) {
        return Err(reel_core::Error::not_found("transcode job", &key).into());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            id,
            cancelled: true,
        }),
    ))
}
