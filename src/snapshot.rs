//! Management snapshot store
//!
//! Thread-safe, read-only view of the agent for the management surface: the
//! active target set with recovery summaries, pool utilization, and the
//! dropped-envelope counters. Actors write their slice of the state; the
//! out-of-scope HTTP layer only ever calls [`SnapshotStore::snapshot`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::DocumentStatus;
use crate::actors::messages::{Circuit, TargetId};
use crate::pool::PoolUtilization;

/// Recovery and delivery summary for one active target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSnapshot {
    pub target_id: String,
    pub failure_count: u32,
    pub circuit: Circuit,
    pub backoff_ms: u64,
    pub cooldown_ms: u64,
    pub publish_failures: u64,
    pub dropped_envelopes: u64,
    pub last_status: Option<DocumentStatus>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl TargetSnapshot {
    fn new(target_id: String) -> Self {
        Self {
            target_id,
            failure_count: 0,
            circuit: Circuit::Closed,
            backoff_ms: 0,
            cooldown_ms: 0,
            publish_failures: 0,
            dropped_envelopes: 0,
            last_status: None,
            last_checked: None,
        }
    }
}

/// Target definitions rejected at the registry boundary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedTarget {
    pub target_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Pool usage as serialized into the snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub transport: String,
    pub in_use: usize,
    pub idle: usize,
    pub max: usize,
}

impl From<PoolUtilization> for PoolSnapshot {
    fn from(u: PoolUtilization) -> Self {
        Self {
            transport: u.transport,
            in_use: u.in_use,
            idle: u.idle,
            max: u.max,
        }
    }
}

/// One coherent view of the agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub targets: Vec<TargetSnapshot>,
    pub rejected: Vec<RejectedTarget>,
    pub pools: Vec<PoolSnapshot>,
    pub dropped_envelopes_total: u64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    targets: HashMap<TargetId, TargetSnapshot>,
    rejected: Vec<RejectedTarget>,
    pools: Vec<PoolSnapshot>,
}

/// Shared store the actors publish their state into
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<Inner>>,
    dropped_total: Arc<AtomicU64>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target as active (idempotent; keeps existing summary).
    pub async fn upsert_target(&self, id: &TargetId) {
        let mut inner = self.inner.write().await;
        inner
            .targets
            .entry(id.clone())
            .or_insert_with(|| TargetSnapshot::new(id.to_string()));
    }

    /// Forget a removed target entirely.
    pub async fn remove_target(&self, id: &TargetId) {
        self.inner.write().await.targets.remove(id);
    }

    /// Reset a target's recovery summary (definition type changed).
    pub async fn reset_target(&self, id: &TargetId) {
        let mut inner = self.inner.write().await;
        inner
            .targets
            .insert(id.clone(), TargetSnapshot::new(id.to_string()));
    }

    /// Record the recovery state after one processed outcome.
    pub async fn record_outcome(
        &self,
        id: &TargetId,
        status: DocumentStatus,
        failure_count: u32,
        circuit: Circuit,
        backoff_ms: u64,
        cooldown_ms: u64,
    ) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .targets
            .entry(id.clone())
            .or_insert_with(|| TargetSnapshot::new(id.to_string()));

        entry.failure_count = failure_count;
        entry.circuit = circuit;
        entry.backoff_ms = backoff_ms;
        entry.cooldown_ms = cooldown_ms;
        entry.last_status = Some(status);
        entry.last_checked = Some(Utc::now());
    }

    /// Record terminal publish feedback for a target.
    pub async fn record_publish(&self, id: &TargetId, delivered: bool) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .targets
            .entry(id.clone())
            .or_insert_with(|| TargetSnapshot::new(id.to_string()));

        if delivered {
            entry.publish_failures = 0;
        } else {
            entry.publish_failures += 1;
            entry.dropped_envelopes += 1;
        }
    }

    /// Count one envelope dropped after exhausting its retry budget.
    pub fn record_drop(&self) {
        self.dropped_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::SeqCst)
    }

    /// Record a definition rejected at the registry boundary.
    pub async fn record_rejected(&self, target_id: &str, reason: String) {
        self.inner.write().await.rejected.push(RejectedTarget {
            target_id: target_id.to_string(),
            reason,
            at: Utc::now(),
        });
    }

    /// Replace the pool utilization slice.
    pub async fn update_pools(&self, pools: Vec<PoolUtilization>) {
        self.inner.write().await.pools = pools.into_iter().map(Into::into).collect();
    }

    /// Take one coherent snapshot of everything.
    pub async fn snapshot(&self) -> AgentSnapshot {
        let inner = self.inner.read().await;

        let mut targets: Vec<_> = inner.targets.values().cloned().collect();
        targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        AgentSnapshot {
            targets,
            rejected: inner.rejected.clone(),
            pools: inner.pools.clone(),
            dropped_envelopes_total: self.dropped_total(),
            taken_at: Utc::now(),
        }
    }
}
