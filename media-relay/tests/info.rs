//! `/info` and `/health`.

#![cfg(unix)]

mod common;

use axum::http::StatusCode;

use common::*;

const METADATA: &str = r#"printf '%s' '{"id":"abc123","title":"A talk","duration":61,"uploader":"Someone","thumbnail":"https://img/abc.jpg","webpage_url":"https://valid/watch?v=abc123","formats":[{"format_id":"140","ext":"m4a","acodec":"mp4a.40.2","url":"https://cdn/140"},{"format_id":"137","ext":"mp4","acodec":"none","url":"https://cdn/137"}]}'"#;

#[tokio::test]
async fn curated_by_default() {
    let app = TestApp::new(METADATA, TRANSCODER_COPY).await;

    let response = app.get("/info?url=https%3A%2F%2Fvalid").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "abc123");
    assert_eq!(body["author"], "Someone");
    assert_eq!(body["duration"], 61.0);
    assert_eq!(body["format"]["format_id"], "140");
    assert!(body.get("formats").is_none());
}

#[tokio::test]
async fn full_returns_the_raw_record() {
    let app = TestApp::new(METADATA, TRANSCODER_COPY).await;

    let response = app.get("/info?url=https%3A%2F%2Fvalid&full=true").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["uploader"], "Someone");
    assert_eq!(body["formats"].as_array().unwrap().len(), 2);

    let response = app.get("/info?url=https%3A%2F%2Fvalid&full=sometimes").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "invalid_request");
}

#[tokio::test]
async fn classified_probe_failure() {
    let app = TestApp::new(
        "echo 'ERROR: [generic] Unable to download webpage: HTTP Error 404: Not Found' >&2; exit 1",
        TRANSCODER_COPY,
    )
    .await;

    let response = app.get("/info?url=https%3A%2F%2Fvalid").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "video_unavailable");
}

#[tokio::test]
async fn missing_url() {
    let app = TestApp::new(METADATA, TRANSCODER_COPY).await;
    let response = app.get("/info").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "missing_url");
}

#[tokio::test]
async fn health_reports_liveness() {
    let app = TestApp::new(METADATA, TRANSCODER_COPY).await;
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["uptime_secs"].is_u64());
}
