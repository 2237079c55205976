//! Live audio conversion.

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::models::ConvertParams;
use crate::api::server::AppState;
use crate::store::attachment_header;

/// Create the convert router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(convert_query).post(convert_json))
}

async fn convert_query(
    State(state): State<AppState>,
    params: Result<Query<ConvertParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = params?;
    convert(state, params).await
}

async fn convert_json(
    State(state): State<AppState>,
    params: Result<Json<ConvertParams>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(params) = params?;
    convert(state, params).await
}

/// Stream `url` re-encoded to the requested format.
///
/// Headers go out only once the transcoder has produced audio, so every
/// failure up to that point is reported as a regular error response.
async fn convert(state: AppState, params: ConvertParams) -> ApiResult<Response> {
    let request = state.pipeline.request(
        params.url.as_deref(),
        params.format.as_deref(),
        params.proxy.as_deref(),
    )?;
    let stream = state.pipeline.stream(&request).await?;
    let format = stream.format();

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(format.content_type()),
        ),
        (
            header::CONTENT_DISPOSITION,
            attachment_header(&format!("audio.{}", format.extension())),
        ),
    ];
    Ok((headers, Body::from_stream(stream.into_body_stream())).into_response())
}
