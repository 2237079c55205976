//! Metadata lookup.

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::models::InfoParams;
use crate::api::server::AppState;
use crate::pipeline::curate;

/// Create the info router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_info))
}

/// Curated metadata by default, the extractor's raw record with `full`.
async fn get_info(
    State(state): State<AppState>,
    params: Result<Query<InfoParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    let request = state
        .pipeline
        .request(params.url.as_deref(), None, params.proxy.as_deref())?;
    let record = state.pipeline.probe(&request).await?;

    if params.full.unwrap_or(false) {
        Ok(Json(record).into_response())
    } else {
        Ok(Json(curate(&record)).into_response())
    }
}
