//! End-to-end pipeline tests: registry -> scheduler -> recovery -> dispatcher
//! -> transport, with real HTTP checks against a mock server.

use std::time::Duration;

use titan_agent::actors::messages::TargetId;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn healthy_check_is_published_as_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions::default());
    pipeline
        .registry
        .add_target(http_target("web-1", format!("{}/health", server.uri())))
        .await
        .unwrap();

    pipeline
        .scheduler
        .check_now(TargetId::new("web-1"))
        .await
        .unwrap();

    wait_for_published(&pipeline.published, 1, Duration::from_secs(5)).await;

    let published = pipeline.published.lock().unwrap().clone();
    assert_eq!(published[0].destination, "titan/checks");

    let document = &published[0].document;
    assert_eq!(document["targetId"], "web-1");
    assert_eq!(document["status"], "success");
    assert!(document["latencyMs"].is_u64());
    assert!(document["timestamp"].is_string());
}

#[tokio::test]
async fn failing_check_document_carries_diagnostic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions::default());
    pipeline
        .registry
        .add_target(http_target("web-1", format!("{}/health", server.uri())))
        .await
        .unwrap();

    pipeline
        .scheduler
        .check_now(TargetId::new("web-1"))
        .await
        .unwrap();

    wait_for_published(&pipeline.published, 1, Duration::from_secs(5)).await;

    let published = pipeline.published.lock().unwrap().clone();
    let document = &published[0].document;
    assert_eq!(document["status"], "failure");
    assert!(
        document["diagnostic"]
            .as_str()
            .unwrap()
            .contains("unexpected status code")
    );
}

#[tokio::test]
async fn removed_target_is_forgotten_everywhere() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions::default());
    let id = TargetId::new("web-1");

    pipeline
        .registry
        .add_target(http_target("web-1", format!("{}/health", server.uri())))
        .await
        .unwrap();
    pipeline.scheduler.check_now(id.clone()).await.unwrap();
    wait_for_published(&pipeline.published, 1, Duration::from_secs(5)).await;

    pipeline.registry.remove_target(&id).await.unwrap();

    assert!(pipeline.registry.list_active().is_empty());
    assert!(pipeline.snapshot.snapshot().await.targets.is_empty());

    // the scheduler no longer knows the target
    let known = pipeline.scheduler.check_now(id).await.unwrap();
    assert!(!known);

    // and nothing further is published
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_definition_never_reaches_the_pipeline() {
    let mut pipeline = spawn_pipeline(PipelineOptions::default());

    let mut bad = http_target("bad-1", "http://localhost:1/health".to_string());
    bad.timeout = 0;

    assert!(pipeline.registry.add_target(bad).await.is_err());

    let snapshot = pipeline.snapshot.snapshot().await;
    assert!(snapshot.targets.is_empty());
    assert_eq!(snapshot.rejected.len(), 1);
    assert!(snapshot.rejected[0].reason.contains("timeout"));
}
