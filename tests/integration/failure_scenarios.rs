//! Failure and recovery scenarios across the full pipeline
//!
//! - consecutive timeouts open the per-target circuit
//! - a half-open probe success closes it again
//! - transport trouble is retried, then dropped with a record, and never
//!   touches check scheduling

use std::time::Duration;

use titan_agent::actors::messages::{Circuit, TargetId};
use titan_agent::config::RecoveryConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Timeout=1s target, threshold 3. Three timeouts open the circuit with
/// failureCount=3; the recovered endpoint then closes it through the
/// half-open probe.
#[tokio::test]
async fn three_timeouts_open_circuit_then_probe_closes_it() {
    let server = MockServer::start().await;

    // first three requests exceed the 1s check timeout, then instant 200s
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1400)))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions {
        recovery: RecoveryConfig {
            failure_threshold: 3,
            cooldown_secs: 0, // half-open on the next outcome after opening
            max_cooldown_secs: 60,
            max_backoff_secs: 300,
        },
        ..Default::default()
    });

    let mut target = http_target("web-1", format!("{}/health", server.uri()));
    target.timeout = 1;
    pipeline.registry.add_target(target).await.unwrap();

    let id = TargetId::new("web-1");

    for expected_failures in 1..=3u32 {
        pipeline.scheduler.check_now(id.clone()).await.unwrap();
        wait_for_snapshot(&pipeline.snapshot, Duration::from_secs(5), |s| {
            s.targets[0].failure_count == expected_failures
        })
        .await;
    }

    let snapshot = pipeline.snapshot.snapshot().await;
    assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
    assert_eq!(snapshot.targets[0].failure_count, 3);
    assert_eq!(snapshot.targets[0].last_status.unwrap(), titan_agent::DocumentStatus::Timeout);

    // endpoint is healthy again; the next outcome is the half-open probe
    pipeline.scheduler.check_now(id.clone()).await.unwrap();
    wait_for_snapshot(&pipeline.snapshot, Duration::from_secs(5), |s| {
        s.targets[0].circuit == Circuit::Closed && s.targets[0].failure_count == 0
    })
    .await;

    // the three closed-circuit timeouts and the probe success were published
    wait_for_published(&pipeline.published, 4, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn open_circuit_suppresses_publication_but_checks_continue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions {
        recovery: RecoveryConfig {
            failure_threshold: 2,
            cooldown_secs: 3600, // stays open for the whole test
            max_cooldown_secs: 3600,
            max_backoff_secs: 300,
        },
        ..Default::default()
    });

    pipeline
        .registry
        .add_target(http_target("web-1", format!("{}/health", server.uri())))
        .await
        .unwrap();
    let id = TargetId::new("web-1");

    for expected_failures in 1..=2u32 {
        pipeline.scheduler.check_now(id.clone()).await.unwrap();
        wait_for_snapshot(&pipeline.snapshot, Duration::from_secs(5), |s| {
            s.targets[0].failure_count == expected_failures
        })
        .await;
    }
    wait_for_published(&pipeline.published, 2, Duration::from_secs(5)).await;

    // circuit is open now; further checks still run and are recorded, but
    // nothing more is published
    pipeline.scheduler.check_now(id.clone()).await.unwrap();
    wait_for_snapshot(&pipeline.snapshot, Duration::from_secs(5), |s| {
        s.targets[0].failure_count == 3
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.published.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn transient_publish_failures_are_retried_to_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // four broken pipes, delivered on the fifth attempt
    let script = (0..4).map(|_| Err(transient_error())).collect();
    let mut pipeline = spawn_pipeline(PipelineOptions {
        script,
        ..Default::default()
    });

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
    assert_eq!(pipeline.snapshot.dropped_total(), 0);
}

#[tokio::test]
async fn exhausted_retry_budget_drops_with_a_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // every attempt fails; the budget is 5
    let script = (0..16).map(|_| Err(transient_error())).collect();
    let mut pipeline = spawn_pipeline(PipelineOptions {
        script,
        ..Default::default()
    });

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

    // the drop is recorded, both globally and against the target
    wait_for_snapshot(&pipeline.snapshot, Duration::from_secs(10), |s| {
        s.dropped_envelopes_total == 1 && s.targets[0].publish_failures == 1
    })
    .await;
    assert!(pipeline.published.lock().unwrap().is_empty());

    // broker trouble never looks like target unhealthiness
    let snapshot = pipeline.snapshot.snapshot().await;
    assert_eq!(snapshot.targets[0].circuit, Circuit::Closed);
    assert_eq!(snapshot.targets[0].failure_count, 0);
}
