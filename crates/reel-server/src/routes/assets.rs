//! Status and locator lookups.

use axum::extract::{Path, State};
use axum::Json;
use reel_core::{
    AssetKey, AssetRecord, Derivative, EntityId, MediaKind, MediaStatus, VariantRecord,
};
use serde::Serialize;

use crate::context::AppContext;
use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct ImageAssetResponse {
    pub status: MediaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub derivatives: Vec<Derivative>,
}

impl From<AssetRecord> for ImageAssetResponse {
    fn from(r: AssetRecord) -> Self {
        Self {
            status: r.status,
            diagnostic: r.diagnostic,
            derivatives: r.derivatives,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VideoResponse {
    pub id: EntityId,
    pub status: MediaStatus,
    /// Master playlist URL; present only when READY.
    pub stream_url: Option<String>,
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub variants: Vec<VariantRecord>,
    pub thumbnail: Option<ImageAssetResponse>,
}

/// GET /api/videos/{id}
pub async fn get_video(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<VideoResponse>, AppError> {
    let id = EntityId::parse(id)?;
    let store = ctx.controller.store();
    let video = store.get(&AssetKey::video(id.clone())).await?;
    let thumbnail = store
        .get(&AssetKey::new(id.clone(), MediaKind::Thumbnail))
        .await?;

    if video.is_none() && thumbnail.is_none() {
        return Err(reel_core::Error::not_found("video", &id).into());
    }

    let video = video.unwrap_or_else(|| AssetRecord::pending(AssetKey::video(id.clone())));
    let stream_url = video.stream_url().map(str::to_string);
    let ready = video.status == MediaStatus::Ready;

    Ok(Json(VideoResponse {
        id,
        status: video.status,
        stream_url,
        duration: video.duration_secs,
        width: video.source_width,
        height: video.source_height,
        diagnostic: video.diagnostic,
        variants: if ready { video.variants } else { Vec::new() },
        thumbnail: thumbnail.map(ImageAssetResponse::from),
    }))
}

/// GET /api/users/{id}/avatar
pub async fn get_avatar(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<ImageAssetResponse>, AppError> {
    let id = EntityId::parse(id)?;
    let record = ctx
        .controller
        .store()
        .get(&AssetKey::new(id.clone(), MediaKind::ProfilePicture))
        .await?
        .ok_or_else(|| reel_core::Error::not_found("avatar", &id))?;
    Ok(Json(record.into()))
}
