use std::sync::Arc;

use clap::Parser;
use titan_agent::{
    actors::{dispatcher::DispatcherHandle, recovery::RecoveryHandle, scheduler::SchedulerHandle},
    check::CheckRunner,
    config::{Config, TransportConfig, read_config_file},
    discovery::DiscoveryFeed,
    pool::ConnectionPool,
    registry::{Router, TargetRegistry},
    snapshot::SnapshotStore,
    transport::{Transport, mqtt::MqttTransport, stomp::StompTransport},
    util,
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, default_value_t = util::get_default_config_path())]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("titan_agent", LevelFilter::TRACE),
        ("titan-agent", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn build_transports(config: &Config) -> Vec<Arc<dyn Transport>> {
    config
        .transports
        .iter()
        .map(|transport| -> Arc<dyn Transport> {
            match transport.clone() {
                TransportConfig::Mqtt {
                    name,
                    host,
                    port,
                    client_id,
                    username,
                    password,
                    keep_alive_secs,
                } => Arc::new(MqttTransport::new(
                    name,
                    host,
                    port,
                    client_id,
                    username,
                    password,
                    keep_alive_secs,
                )),
                TransportConfig::Stomp {
                    name,
                    host,
                    port,
                    login,
                    passcode,
                    virtual_host,
                } => Arc::new(StompTransport::new(
                    name, host, port, login, passcode, virtual_host,
                )),
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    anyhow::ensure!(
        !config.transports.is_empty(),
        "at least one transport must be configured"
    );

    let snapshot = SnapshotStore::new();

    let transports = build_transports(&config);
    let pool = Arc::new(ConnectionPool::new(transports, config.pool.clone()));
    let _maintenance = ConnectionPool::spawn_maintenance(pool.clone(), util::get_pool_sweep_interval());

    // recovery's mailbox is created up front so the dispatcher can report
    // publish feedback into it
    let (recovery_tx, recovery_rx) = RecoveryHandle::channel();

    let (dispatcher, dispatcher_tx) = DispatcherHandle::spawn(
        config.dispatch.clone(),
        pool.clone(),
        recovery_tx.clone(),
        snapshot.clone(),
    );

    let recovery = RecoveryHandle::spawn_from(
        recovery_tx,
        recovery_rx,
        config.recovery.clone(),
        dispatcher_tx,
        snapshot.clone(),
    );

    let scheduler = SchedulerHandle::spawn(
        config.scheduler.clone(),
        CheckRunner::new(),
        recovery.sender(),
    );

    let router = Router::from_config(&config);
    let mut registry = TargetRegistry::new(
        scheduler.clone(),
        recovery.clone(),
        snapshot.clone(),
        router,
    );

    // keep the pool numbers in the management snapshot fresh
    {
        let pool = pool.clone();
        let snapshot = snapshot.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(util::get_snapshot_refresh_interval());
            loop {
                ticker.tick().await;
                snapshot.update_pools(pool.utilization().await).await;
            }
        });
    }

    let (feed, mut feed_rx) = DiscoveryFeed::channel(64);
    feed.seed_from_config(&config).await?;

    let feed_loop = tokio::spawn(async move {
        while let Some(event) = feed_rx.recv().await {
            registry.apply(event).await;
        }
        debug!("discovery feed closed");
    });

    info!("titan agent running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.shutdown().await;
    recovery.shutdown().await;
    dispatcher.shutdown().await;
    drop(feed);
    if let Err(e) = feed_loop.await {
        error!("{e}");
    }

    Ok(())
}
