//! HTTP handler for track separation.

use axum::{Json, extract::State};

use crate::{
    AppState,
    api::models::process::{ProcessRequest, ProcessResponse},
    errors::{ErrorBody, Result},
};

/// Separate a track into stems.
#[utoipa::path(
    post,
    path = "/process",
    tag = "process",
    summary = "Separate a track",
    description = "Download the audio at `url`, split it into stems and publish each stem to the object store.

Returns the public URL of every stem, keyed by stem name. Stems are stored as `<stem>_<source file name without extension>.wav`, so resubmitting a URL (or another URL with the same file name) overwrites the earlier objects.",
    request_body = ProcessRequest,
    responses(
        (status = 200, description = "Stems published", body = ProcessResponse),
        (status = 400, description = "The source audio could not be downloaded", body = ErrorBody),
        (status = 500, description = "Separation or upload failed", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all, fields(url = %request.url))]
pub async fn process(State(state): State<AppState>, Json(request): Json<ProcessRequest>) -> Result<Json<ProcessResponse>> {
    let urls = state.pipeline.process(&request.url).await?;
    Ok(Json(urls.into()))
}
