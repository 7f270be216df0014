//! Helper functions for integration tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use titan_agent::actors::dispatcher::DispatcherHandle;
use titan_agent::actors::recovery::RecoveryHandle;
use titan_agent::actors::scheduler::SchedulerHandle;
use titan_agent::check::CheckRunner;
use titan_agent::config::{
    CheckConfig, Config, DispatchConfig, PoolConfig, RecoveryConfig, SchedulerConfig, TargetConfig,
};
use titan_agent::pool::ConnectionPool;
use titan_agent::registry::{Router, TargetRegistry};
use titan_agent::snapshot::SnapshotStore;
use titan_agent::transport::{Connection, Transport, TransportError, TransportResult};

/// One payload captured by the in-memory broker
#[derive(Debug, Clone)]
pub struct Published {
    pub destination: String,
    pub document: serde_json::Value,
}

/// Transport that records deliveries and optionally fails publishes
/// according to a script (front of the queue first; empty script succeeds).
pub struct CapturingTransport {
    name: String,
    script: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    published: Arc<Mutex<Vec<Published>>>,
    connects: Arc<std::sync::atomic::AtomicUsize>,
    publish_delay: Duration,
}

impl CapturingTransport {
    pub fn new(name: &str, script: Vec<Result<(), TransportError>>) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(script.into())),
            published: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            publish_delay: Duration::ZERO,
        }
    }

    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    pub fn published(&self) -> Arc<Mutex<Vec<Published>>> {
        self.published.clone()
    }

    pub fn connect_count(&self) -> Arc<std::sync::atomic::AtomicUsize> {
        self.connects.clone()
    }
}

#[async_trait]
impl Transport for CapturingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> TransportResult<Box<dyn Connection>> {
        self.connects
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(Box::new(CapturingConnection {
            script: self.script.clone(),
            published: self.published.clone(),
            publish_delay: self.publish_delay,
        }))
    }
}

struct CapturingConnection {
    script: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    published: Arc<Mutex<Vec<Published>>>,
    publish_delay: Duration,
}

#[async_trait]
impl Connection for CapturingConnection {
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> TransportResult<()> {
        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(e)) => Err(e),
            _ => {
                self.published.lock().unwrap().push(Published {
                    destination: destination.to_string(),
                    document: serde_json::from_slice(payload).expect("valid JSON document"),
                });
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

pub fn transient_error() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "broken pipe",
    ))
}

/// The fully wired pipeline minus the binary: pool, dispatcher, recovery,
/// scheduler, registry, all sharing one snapshot store.
pub struct TestPipeline {
    pub registry: TargetRegistry,
    pub scheduler: SchedulerHandle,
    pub snapshot: SnapshotStore,
    pub pool: Arc<ConnectionPool>,
    pub published: Arc<Mutex<Vec<Published>>>,
}

pub struct PipelineOptions {
    pub recovery: RecoveryConfig,
    pub dispatch: DispatchConfig,
    pub pool: PoolConfig,
    pub max_concurrent_checks: usize,
    pub script: Vec<Result<(), TransportError>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            recovery: RecoveryConfig::default(),
            dispatch: DispatchConfig {
                max_attempts: 5,
                retry_base_ms: 20,
                max_retry_backoff_ms: 100,
                publish_timeout_secs: 2,
            },
            pool: PoolConfig {
                max_connections: 2,
                min_idle: 0,
                idle_timeout_secs: 60,
                borrow_timeout_secs: 2,
            },
            max_concurrent_checks: 8,
            script: Vec::new(),
        }
    }
}

pub fn spawn_pipeline(options: PipelineOptions) -> TestPipeline {
    let snapshot = SnapshotStore::new();

    let transport = Arc::new(CapturingTransport::new("mqtt", options.script));
    let published = transport.published();
    let pool = Arc::new(ConnectionPool::new(vec![transport], options.pool));

    let (recovery_tx, recovery_rx) = RecoveryHandle::channel();
    let (_dispatcher, dispatcher_tx) = DispatcherHandle::spawn(
        options.dispatch,
        pool.clone(),
        recovery_tx.clone(),
        snapshot.clone(),
    );
    let recovery = RecoveryHandle::spawn_from(
        recovery_tx,
        recovery_rx,
        options.recovery,
        dispatcher_tx,
        snapshot.clone(),
    );
    let scheduler = SchedulerHandle::spawn(
        SchedulerConfig {
            max_concurrent_checks: options.max_concurrent_checks,
        },
        CheckRunner::new(),
        recovery.sender(),
    );

    let router = Router::from_config(&test_config());
    let registry = TargetRegistry::new(
        scheduler.clone(),
        recovery,
        snapshot.clone(),
        router,
    );

    TestPipeline {
        registry,
        scheduler,
        snapshot,
        pool,
        published,
    }
}

fn test_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "transports": [
            { "protocol": "mqtt", "name": "mqtt", "host": "localhost", "port": 1883 }
        ],
        "destination": "titan/checks"
    }))
    .unwrap()
}

/// Target definition for an HTTP check against a mock server; the large
/// interval keeps the scheduler quiet so tests drive checks via `check_now`.
pub fn http_target(id: &str, url: String) -> TargetConfig {
    TargetConfig {
        id: id.to_string(),
        check: CheckConfig::Http {
            url,
            method: Default::default(),
            expected_status: None,
            body_pattern: None,
        },
        interval: 3600,
        timeout: 2,
        transport: None,
        destination: None,
    }
}

/// Wait until the predicate holds against the snapshot or the deadline
/// passes.
pub async fn wait_for_snapshot<F>(snapshot: &SnapshotStore, deadline: Duration, predicate: F)
where
    F: Fn(&titan_agent::snapshot::AgentSnapshot) -> bool,
{
    let start = std::time::Instant::now();
    loop {
        let current = snapshot.snapshot().await;
        if predicate(&current) {
            return;
        }
        if start.elapsed() > deadline {
            panic!("snapshot never satisfied predicate: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until at least `count` payloads were delivered.
pub async fn wait_for_published(
    published: &Arc<Mutex<Vec<Published>>>,
    count: usize,
    deadline: Duration,
) {
    let start = std::time::Instant::now();
    loop {
        if published.lock().unwrap().len() >= count {
            return;
        }
        if start.elapsed() > deadline {
            let seen = published.lock().unwrap().len();
            panic!("only {seen}/{count} payloads published in time");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
