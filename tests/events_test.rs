//! Integration tests for the SSE events endpoint.

mod common;

use std::time::Duration;

use common::TestHarness;
use futures::StreamExt;

#[tokio::test]
async fn sse_stream_connects() {
    let h = TestHarness::new();
    let addr = h.serve().await;

    let resp = reqwest::get(format!("http://{addr}/api/events")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let ct = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(ct.contains("text/event-stream"), "expected SSE content-type, got: {ct}");
}

#[tokio::test]
async fn sse_rejects_unknown_category() {
    let h = TestHarness::new();
    let addr = h.serve().await;

    let resp = reqwest::get(format!("http://{addr}/api/events?category=admin"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn sse_replays_status_changes() {
    let h = TestHarness::new();
    let addr = h.serve().await;
    h.stage_file("ev.mp4");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/videos/ev/upload"))
        .json(&serde_json::json!({"file": "ev.mp4", "mime_type": "video/mp4"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let resp = reqwest::get(format!("http://{addr}/api/events?category=status"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut body = resp.bytes_stream();
    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            seen.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if seen.contains("\"READY\"") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    assert!(found, "no READY event in: {seen}");
    assert!(!seen.contains("upload_accepted"), "pipeline events must be filtered out");
}
