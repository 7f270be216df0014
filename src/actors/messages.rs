//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Acknowledged lifecycle events**: target add/remove carries a oneshot
//!    ack so the registry does not proceed before subscribers have processed
//!    the event
//! 3. **Immutability**: outcomes are created once and never mutated

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::{CheckConfig, TargetConfig};

/// Unique identifier of a monitored target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Everything the scheduler needs to run checks for one target.
///
/// The epoch is bumped by the registry on every add/replace; outcomes carry
/// the epoch their check was scheduled under so results from a stale
/// incarnation are discarded instead of delivered.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub id: TargetId,
    pub epoch: u64,
    pub check: CheckConfig,
    pub interval: Duration,
    pub timeout: Duration,
}

impl TargetSpec {
    pub fn from_config(config: &TargetConfig, epoch: u64) -> Self {
        Self {
            id: TargetId::new(config.id.clone()),
            epoch,
            check: config.check.clone(),
            interval: config.interval_duration(),
            timeout: config.timeout_duration(),
        }
    }
}

/// Result of one check execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Success,
    Failure(String),
    Timeout,
}

impl CheckStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckStatus::Success)
    }
}

/// Immutable result of one check attempt, produced exactly once by the
/// check executor and consumed by the recovery controller.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub target_id: TargetId,
    pub epoch: u64,
    pub timestamp: DateTime<Utc>,
    pub status: CheckStatus,
    pub latency: Duration,
    pub diagnostic: Option<String>,
}

/// Where an accepted outcome is published to
#[derive(Debug, Clone)]
pub struct PublishRoute {
    pub transport: String,
    pub destination: String,
}

/// Per-target breaker state gating outcome publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Circuit {
    Closed,
    Open,
    HalfOpen,
}

/// Terminal result of publishing one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Delivered,
    Retryable(String),
    Fatal(String),
}

/// Commands understood by the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Register (or replace) a target and arm its timer
    TargetAdded {
        spec: TargetSpec,
        respond_to: oneshot::Sender<()>,
    },

    /// Cancel the target's timer and mark any in-flight check discardable
    TargetRemoved {
        id: TargetId,
        respond_to: oneshot::Sender<()>,
    },

    /// Recovery-driven cadence change, applied from the next reschedule on
    UpdateInterval { id: TargetId, interval: Duration },

    /// Trigger an immediate check (testing and manual refresh)
    CheckNow {
        id: TargetId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Gracefully shut down the scheduler
    Shutdown,
}

/// Commands understood by the RecoveryActor
#[derive(Debug)]
pub enum RecoveryCommand {
    /// A check outcome accepted by the scheduler (not stale, not removed).
    ///
    /// The responder carries the backoff-adjusted interval the scheduler
    /// must use for the target's next fire, which couples check cadence to
    /// failure state without a second round trip.
    Outcome {
        outcome: CheckOutcome,
        respond_to: oneshot::Sender<Duration>,
    },

    /// Register a target's nominal cadence and publish route; `reset` drops
    /// prior history
    TargetAdded {
        id: TargetId,
        nominal_interval: Duration,
        route: PublishRoute,
        reset: bool,
        respond_to: oneshot::Sender<()>,
    },

    /// Purge all recovery state for a removed target
    TargetRemoved {
        id: TargetId,
        respond_to: oneshot::Sender<()>,
    },

    /// Terminal publish feedback for one envelope, tracked independently
    /// of check failures
    PublishFeedback {
        target_id: TargetId,
        result: PublishResult,
        attempts: u32,
    },

    /// Gracefully shut down the recovery controller
    Shutdown,
}

/// Commands understood by the DispatcherActor
#[derive(Debug)]
pub enum DispatcherCommand {
    /// Serialize and publish an accepted outcome
    Publish {
        outcome: CheckOutcome,
        route: PublishRoute,
    },

    /// Gracefully shut down the dispatcher
    Shutdown,
}
