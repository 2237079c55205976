//! Staged downloads.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::debug;

use crate::api::error::ApiResult;
use crate::api::models::{ArtifactResponse, Delivery, DownloadParams};
use crate::api::server::AppState;

/// Create the download router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(download_query).post(download_json))
}

async fn download_query(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    download(state, params).await
}

async fn download_json(
    State(state): State<AppState>,
    params: Result<Json<DownloadParams>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(params) = params?;
    download(state, params).await
}

async fn download(state: AppState, params: DownloadParams) -> ApiResult<Response> {
    let request = state
        .pipeline
        .request(
            params.url.as_deref(),
            params.format.as_deref(),
            params.proxy.as_deref(),
        )?
        .with_extract_audio(params.extract_audio.unwrap_or(true));

    let artifact = state.pipeline.stage(&request, &state.store).await?;

    match params.delivery.unwrap_or_default() {
        Delivery::Artifact => Ok(Json(ArtifactResponse::from(&artifact)).into_response()),
        Delivery::File => {
            debug!(id = %artifact.id, "Delivering staged file");
            let read = state
                .store
                .read(&artifact, None)
                .await?
                .evict_after(state.store.clone(), artifact.id.clone());
            Ok(read.into_response())
        }
    }
}
