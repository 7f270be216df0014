//! Concurrency behavior: pool capacity under parallel publishes, and the
//! scheduler's global check cap feeding the pipeline.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use titan_agent::actors::messages::TargetId;
use titan_agent::config::PoolConfig;
use titan_agent::pool::ConnectionPool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Pool max=2, three concurrent publishes. The third waits for a released
/// connection; a third live connection is never created.
#[tokio::test]
async fn pool_of_two_serves_three_concurrent_publishes() {
    let transport = Arc::new(
        CapturingTransport::new("mqtt", vec![]).with_publish_delay(Duration::from_millis(150)),
    );
    let published = transport.published();
    let connects = transport.connect_count();

    let pool = Arc::new(ConnectionPool::new(
        vec![transport],
        PoolConfig {
            max_connections: 2,
            min_idle: 0,
            idle_timeout_secs: 60,
            borrow_timeout_secs: 5,
        },
    ));

    let started = std::time::Instant::now();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.borrow("mqtt").await.unwrap();
            conn.connection()
                .publish("titan/checks", format!("{{\"n\":{i}}}").as_bytes())
                .await
                .unwrap();
            pool.release(conn, true).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(published.lock().unwrap().len(), 3);
    assert!(connects.load(Ordering::SeqCst) <= 2, "a third connection was dialed");

    // two rounds of 150ms publishes, not three in parallel
    assert!(started.elapsed() >= Duration::from_millis(280));
}

#[tokio::test]
async fn many_targets_share_the_pipeline_without_loss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut pipeline = spawn_pipeline(PipelineOptions {
        max_concurrent_checks: 2,
        ..Default::default()
    });

    let ids = ["web-1", "web-2", "web-3", "web-4", "web-5"];
    for id in ids {
        pipeline
            .registry
            .add_target(http_target(id, format!("{}/health", server.uri())))
            .await
            .unwrap();
    }

    for id in ids {
        pipeline.scheduler.check_now(TargetId::new(id)).await.unwrap();
    }

    // all five outcomes make it through, two checks at a time
    wait_for_published(&pipeline.published, 5, Duration::from_secs(10)).await;

    let published = pipeline.published.lock().unwrap();
    let mut seen: Vec<String> = published
        .iter()
        .map(|p| p.document["targetId"].as_str().unwrap().to_string())
        .collect();
    seen.sort();
    let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(seen, expected);
}
