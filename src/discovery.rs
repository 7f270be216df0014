//! Discovery feed
//!
//! The registry consumes a push stream of target lifecycle events. Where the
//! events come from (static config, DNS, an external registry) is not the
//! core's concern; this module defines the stream and the config-seeded
//! source the agent boots with.
//!
//! Events carry a feed-assigned sequence number so the consumer can tolerate
//! out-of-order delivery: a Removed always beats the stale Added it
//! overtook, because the stale Added carries a smaller sequence number.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::actors::messages::TargetId;
use crate::config::{Config, TargetConfig};

#[derive(Debug, Clone)]
pub enum DiscoveryKind {
    Added(TargetConfig),
    Removed(TargetId),
}

/// One target lifecycle event on the feed
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub seq: u64,
    pub kind: DiscoveryKind,
}

impl DiscoveryEvent {
    /// Identifier the event applies to.
    pub fn target_id(&self) -> TargetId {
        match &self.kind {
            DiscoveryKind::Added(config) => TargetId::new(config.id.clone()),
            DiscoveryKind::Removed(id) => id.clone(),
        }
    }
}

/// Producer side of the discovery stream. Assigns sequence numbers.
#[derive(Debug, Clone)]
pub struct DiscoveryFeed {
    tx: mpsc::Sender<DiscoveryEvent>,
    seq: std::sync::Arc<AtomicU64>,
}

impl DiscoveryFeed {
    /// Create a feed and the receiver the registry drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                seq: std::sync::Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn added(&self, config: TargetConfig) -> Result<()> {
        let event = DiscoveryEvent {
            seq: self.next_seq(),
            kind: DiscoveryKind::Added(config),
        };
        self.tx
            .send(event)
            .await
            .context("discovery feed closed")?;
        Ok(())
    }

    pub async fn removed(&self, id: TargetId) -> Result<()> {
        let event = DiscoveryEvent {
            seq: self.next_seq(),
            kind: DiscoveryKind::Removed(id),
        };
        self.tx
            .send(event)
            .await
            .context("discovery feed closed")?;
        Ok(())
    }

    /// Seed the feed with the statically configured targets.
    pub async fn seed_from_config(&self, config: &Config) -> Result<()> {
        let Some(targets) = &config.targets else {
            debug!("no statically configured targets");
            return Ok(());
        };

        for target in targets {
            self.added(target.clone()).await?;
        }
        debug!("seeded {} target(s) from config", targets.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckConfig;

    fn target(id: &str) -> TargetConfig {
        TargetConfig {
            id: id.to_string(),
            check: CheckConfig::Tcp {
                addr: "localhost:5432".to_string(),
            },
            interval: 15,
            timeout: 5,
            transport: None,
            destination: None,
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_strictly_increasing() {
        let (feed, mut rx) = DiscoveryFeed::channel(8);

        feed.added(target("a")).await.unwrap();
        feed.removed(TargetId::new("a")).await.unwrap();
        feed.added(target("b")).await.unwrap();

        let seqs: Vec<u64> = [
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
        ]
        .into();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn event_exposes_its_target_id() {
        let (feed, mut rx) = DiscoveryFeed::channel(8);

        feed.added(target("web-1")).await.unwrap();
        feed.removed(TargetId::new("web-2")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().target_id(), TargetId::new("web-1"));
        assert_eq!(rx.recv().await.unwrap().target_id(), TargetId::new("web-2"));
    }
}
