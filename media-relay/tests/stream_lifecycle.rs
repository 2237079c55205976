//! Run outcomes of streaming delivery, observed through the pipeline API.

#![cfg(unix)]

mod common;

use std::time::Duration;

use futures::StreamExt;

use common::*;
use media_relay::pipeline::{Outcome, Stage};
use media_relay::{Pipeline, PipelineConfig};

fn pipeline(extractor: &str, transcoder: &str, timeout: Duration) -> Pipeline {
    Pipeline::new(PipelineConfig {
        extractor: tool(extractor, "yt-dlp"),
        transcoder: tool(transcoder, "ffmpeg"),
        timeout,
        ..Default::default()
    })
}

#[tokio::test]
async fn completed_stream_succeeds() {
    let pipeline = pipeline(EXTRACTOR_OK, TRANSCODER_COPY, Duration::from_secs(10));
    let request = pipeline.request(Some("https://valid"), None, None).unwrap();

    let stream = pipeline.stream(&request).await.unwrap();
    let run = stream.run().clone();
    let chunks: Vec<_> = stream.into_body_stream().collect().await;
    let body: Vec<u8> = chunks
        .into_iter()
        .flat_map(|c| c.unwrap().to_vec())
        .collect();

    assert_eq!(body, b"media-bytes");
    assert_eq!(run.outcome(), Outcome::Success);
    assert_eq!(run.stages(), vec![Stage::Extractor, Stage::Transcoder]);
    for (_, exit) in run.wait_processes().await {
        assert!(exit.success());
    }
}

#[tokio::test]
async fn dropped_body_cancels_the_run() {
    let pipeline = pipeline(
        "printf 'media-bytes'; exec sleep 30",
        "exec cat",
        Duration::from_secs(30),
    );
    let request = pipeline.request(Some("https://valid"), None, None).unwrap();

    let stream = pipeline.stream(&request).await.unwrap();
    let run = stream.run().clone();
    let mut body = Box::pin(stream.into_body_stream());
    assert!(body.next().await.unwrap().is_ok());
    assert!(run.outcome().is_pending());

    drop(body);
    assert_eq!(run.outcome(), Outcome::ClientCancelled);
    let exits = tokio::time::timeout(Duration::from_secs(5), run.wait_processes())
        .await
        .unwrap();
    assert_eq!(exits.len(), 2);
    let (_, extractor) = exits
        .iter()
        .find(|(stage, _)| *stage == Stage::Extractor)
        .unwrap();
    assert!(extractor.killed);
}

#[tokio::test]
async fn extractor_failure_after_output_aborts_the_body() {
    let pipeline = pipeline(
        "printf 'media-bytes'; sleep 0.2; echo 'ERROR: connection timed out' >&2; exit 1",
        "exec cat",
        Duration::from_secs(10),
    );
    let request = pipeline.request(Some("https://valid"), None, None).unwrap();

    let stream = pipeline.stream(&request).await.unwrap();
    let run = stream.run().clone();
    let results: Vec<_> = stream.into_body_stream().collect().await;

    assert!(results.first().unwrap().is_ok());
    assert!(results.last().unwrap().is_err());
    assert!(matches!(run.outcome(), Outcome::Failed { .. }));
    assert_eq!(run.ended_error().unwrap().code(), "upstream_timeout");
}

#[tokio::test]
async fn failed_extractor_without_output_is_an_upstream_error() {
    let pipeline = pipeline("exit 1", "exec cat", Duration::from_secs(10));
    let request = pipeline.request(Some("https://valid"), None, None).unwrap();

    let err = pipeline.stream(&request).await.err().unwrap();
    assert_eq!(err.code(), "upstream_error");
    assert_eq!(
        err.to_string(),
        media_relay::pipeline::classify::NO_DIAGNOSTICS_MESSAGE
    );
}
