//! Staged artifact retrieval.

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::error::Error;

/// Create the artifacts router.
pub fn router() -> Router<AppState> {
    Router::new().route("/{id}", get(get_artifact).delete(delete_artifact))
}

/// Serve an artifact, honoring a single byte range.
async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let artifact = state.store.get(&id).await?;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let read = state.store.read(&artifact, range).await?;
    Ok(read.into_response())
}

async fn delete_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.remove(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::ArtifactNotFound(id).into())
    }
}
