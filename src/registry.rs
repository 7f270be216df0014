//! Target registry
//!
//! Single owner of the monitored-target set. Lifecycle changes flow through
//! here and are delivered to the scheduler and recovery controller as
//! acknowledged commands, so an add/remove has been fully processed by both
//! before the registry returns - there is no window for a missed removal.
//!
//! Definitions are validated at this boundary; a malformed target is
//! recorded in the management snapshot and never scheduled.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::actors::messages::{PublishRoute, TargetId, TargetSpec};
use crate::actors::recovery::RecoveryHandle;
use crate::actors::scheduler::SchedulerHandle;
use crate::config::{Config, ConfigError, ConfigResult, TargetConfig};
use crate::discovery::{DiscoveryEvent, DiscoveryKind};
use crate::snapshot::SnapshotStore;

/// Lifecycle state of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Paused,
}

/// A registered target as seen by callers of [`TargetRegistry::list_active`]
#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    pub config: TargetConfig,
    pub epoch: u64,
    pub state: Lifecycle,
}

#[derive(Debug)]
struct RegisteredTarget {
    config: TargetConfig,
    epoch: u64,
    state: Lifecycle,
}

/// Resolves a target's publish route against the configured transports
#[derive(Debug, Clone)]
pub struct Router {
    transports: Vec<String>,
    default_transport: Option<String>,
    default_destination: String,
}

impl Router {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transports: config
                .transports
                .iter()
                .map(|t| t.name().to_string())
                .collect(),
            default_transport: config.fallback_transport().map(str::to_string),
            default_destination: config.destination.clone(),
        }
    }

    pub fn resolve(&self, target: &TargetConfig) -> ConfigResult<PublishRoute> {
        let transport = target
            .transport
            .clone()
            .or_else(|| self.default_transport.clone())
            .ok_or_else(|| ConfigError::UnknownTransport("<none configured>".into()))?;

        if !self.transports.iter().any(|name| *name == transport) {
            return Err(ConfigError::UnknownTransport(transport));
        }

        Ok(PublishRoute {
            transport,
            destination: target
                .destination
                .clone()
                .unwrap_or_else(|| self.default_destination.clone()),
        })
    }
}

/// Owner of the current target set
pub struct TargetRegistry {
    scheduler: SchedulerHandle,
    recovery: RecoveryHandle,
    snapshot: SnapshotStore,
    router: Router,

    targets: HashMap<TargetId, RegisteredTarget>,

    /// Highest discovery sequence number applied per identifier; stale feed
    /// events are dropped by comparison. Entries survive removal so a
    /// Removed keeps beating the stale Added it overtook.
    applied_seq: HashMap<TargetId, u64>,

    next_epoch: u64,
}

impl TargetRegistry {
    pub fn new(
        scheduler: SchedulerHandle,
        recovery: RecoveryHandle,
        snapshot: SnapshotStore,
        router: Router,
    ) -> Self {
        Self {
            scheduler,
            recovery,
            snapshot,
            router,
            targets: HashMap::new(),
            applied_seq: HashMap::new(),
            next_epoch: 0,
        }
    }

    /// Register a target or replace an existing definition in place.
    ///
    /// Replacement preserves recovery history unless the check *type*
    /// changed. Returns once scheduler and recovery have processed the
    /// event.
    pub async fn add_target(&mut self, config: TargetConfig) -> ConfigResult<()> {
        if let Err(e) = config.validate() {
            warn!("rejecting target '{}': {e}", config.id);
            self.snapshot
                .record_rejected(&config.id, e.to_string())
                .await;
            return Err(e);
        }

        let route = match self.router.resolve(&config) {
            Ok(route) => route,
            Err(e) => {
                warn!("rejecting target '{}': {e}", config.id);
                self.snapshot
                    .record_rejected(&config.id, e.to_string())
                    .await;
                return Err(e);
            }
        };

        let id = TargetId::new(config.id.clone());

        self.next_epoch += 1;
        let epoch = self.next_epoch;

        let reset = match self.targets.get(&id) {
            Some(existing) => existing.config.check.kind() != config.check.kind(),
            None => true,
        };

        // recovery first so route and cadence exist before the first outcome
        self.recovery
            .target_added(
                id.clone(),
                config.interval_duration(),
                route,
                reset,
            )
            .await
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        self.scheduler
            .target_added(TargetSpec::from_config(&config, epoch))
            .await
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let replaced = self
            .targets
            .insert(
                id.clone(),
                RegisteredTarget {
                    config,
                    epoch,
                    state: Lifecycle::Active,
                },
            )
            .is_some();

        if replaced {
            info!("replaced target '{id}' (epoch {epoch}, reset: {reset})");
        } else {
            info!("registered target '{id}' (epoch {epoch})");
        }

        Ok(())
    }

    /// Remove a target: cancel its timer, discard any in-flight check, purge
    /// recovery state. Returns once all of that has happened.
    pub async fn remove_target(&mut self, id: &TargetId) -> Result<()> {
        if self.targets.remove(id).is_none() {
            debug!("remove for unknown target '{id}'");
            return Ok(());
        }

        // scheduler first: after its ack no further outcomes are forwarded,
        // so the recovery purge cannot race a late outcome
        self.scheduler.target_removed(id.clone()).await?;
        self.recovery.target_removed(id.clone()).await?;

        info!("removed target '{id}'");
        Ok(())
    }

    /// Suspend checking without losing the definition or recovery history.
    pub async fn pause_target(&mut self, id: &TargetId) -> Result<bool> {
        let Some(target) = self.targets.get_mut(id) else {
            return Ok(false);
        };
        if target.state == Lifecycle::Paused {
            return Ok(true);
        }

        target.state = Lifecycle::Paused;
        // cancelling the scheduler entry is enough; recovery state stays
        self.scheduler.target_removed(id.clone()).await?;

        info!("paused target '{id}'");
        Ok(true)
    }

    /// Resume a paused target with a fresh epoch.
    pub async fn resume_target(&mut self, id: &TargetId) -> Result<bool> {
        let Some(target) = self.targets.get_mut(id) else {
            return Ok(false);
        };
        if target.state == Lifecycle::Active {
            return Ok(true);
        }

        self.next_epoch += 1;
        target.epoch = self.next_epoch;
        target.state = Lifecycle::Active;
        let spec = TargetSpec::from_config(&target.config, target.epoch);

        self.scheduler.target_added(spec).await?;

        info!("resumed target '{id}'");
        Ok(true)
    }

    /// Snapshot of all currently active targets.
    pub fn list_active(&self) -> Vec<Target> {
        let mut targets: Vec<_> = self
            .targets
            .iter()
            .filter(|(_, t)| t.state == Lifecycle::Active)
            .map(|(id, t)| Target {
                id: id.clone(),
                config: t.config.clone(),
                epoch: t.epoch,
                state: t.state,
            })
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    /// Apply one discovery event, tolerating out-of-order delivery: events
    /// older than the last applied one for the same identifier are dropped.
    pub async fn apply(&mut self, event: DiscoveryEvent) {
        let id = event.target_id();

        if let Some(&applied) = self.applied_seq.get(&id)
            && event.seq <= applied
        {
            debug!(
                "ignoring stale discovery event for '{id}' (seq {} <= {applied})",
                event.seq
            );
            return;
        }
        self.applied_seq.insert(id.clone(), event.seq);

        match event.kind {
            DiscoveryKind::Added(config) => {
                // rejection is already recorded in the snapshot; the feed
                // loop must keep running
                let _ = self.add_target(config).await;
            }
            DiscoveryKind::Removed(_) => {
                if let Err(e) = self.remove_target(&id).await {
                    warn!("failed to remove '{id}': {e}");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
