//! RecoveryActor - per-target failure classification and circuit breaking
//!
//! A single actor owns every target's `RecoveryState`, which gives the
//! single-writer discipline the outcome ordering guarantee relies on: the
//! scheduler never overlaps checks for one target, and this actor consumes
//! outcomes from one mailbox in arrival order.
//!
//! ## Policy
//!
//! - Success resets the consecutive-failure count and asks the scheduler to
//!   return to the nominal cadence
//! - Failure/Timeout doubles the check backoff (bounded) and, at the
//!   configured threshold, opens the per-target circuit
//! - An open circuit suppresses *publication only*; checks keep running at
//!   the backoff cadence so recovery is observed promptly
//! - After a cooldown the circuit goes half-open and exactly one outcome is
//!   let through as the probe: success closes it, failure reopens it with a
//!   doubled (bounded) cooldown
//!
//! Publish feedback from the dispatcher is tracked independently: a broker
//! outage must never look like target unhealthiness.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::ResultDocument;
use crate::config::RecoveryConfig;
use crate::snapshot::SnapshotStore;

use super::messages::{
    CheckOutcome, Circuit, DispatcherCommand, PublishResult, PublishRoute, RecoveryCommand,
    TargetId,
};

/// Mutable recovery record for one target, owned exclusively by the actor
#[derive(Debug)]
struct RecoveryState {
    nominal_interval: Duration,
    route: PublishRoute,
    consecutive_failures: u32,
    circuit: Circuit,
    cooldown: Duration,
    last_transition: Instant,
}

impl RecoveryState {
    fn new(nominal_interval: Duration, route: PublishRoute, cooldown: Duration) -> Self {
        Self {
            nominal_interval,
            route,
            consecutive_failures: 0,
            circuit: Circuit::Closed,
            cooldown,
            last_transition: Instant::now(),
        }
    }
}

/// Backoff-adjusted check interval: `min(nominal * 2^(failures-1), max)`.
///
/// Zero failures means the nominal cadence. Pure, so the policy is testable
/// on its own.
pub fn backoff_interval(nominal: Duration, consecutive_failures: u32, max_backoff: Duration) -> Duration {
    if consecutive_failures == 0 {
        return nominal;
    }
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let factor = 1u32 << exponent;
    nominal.saturating_mul(factor).min(max_backoff)
}

/// Circuit transition for one classified outcome.
///
/// `consecutive_failures` is the count *after* this outcome was applied, and
/// the caller has already half-opened an open circuit whose cooldown
/// elapsed. Returns the next circuit state and whether the outcome is
/// published.
pub fn circuit_step(
    circuit: Circuit,
    consecutive_failures: u32,
    success: bool,
    threshold: u32,
) -> (Circuit, bool) {
    match (circuit, success) {
        (Circuit::Closed, true) => (Circuit::Closed, true),
        // the probe decides the circuit
        (Circuit::HalfOpen, true) => (Circuit::Closed, true),
        // suppressed until the half-open probe
        (Circuit::Open, true) => (Circuit::Open, false),
        (Circuit::Closed, false) => {
            if consecutive_failures >= threshold {
                (Circuit::Open, true)
            } else {
                (Circuit::Closed, true)
            }
        }
        // the probe is the one outcome let through
        (Circuit::HalfOpen, false) => (Circuit::Open, true),
        (Circuit::Open, false) => (Circuit::Open, false),
    }
}

/// Actor applying the retry/backoff/circuit policy to the outcome stream
pub struct RecoveryActor {
    command_rx: mpsc::Receiver<RecoveryCommand>,
    dispatcher_tx: mpsc::Sender<DispatcherCommand>,
    states: HashMap<TargetId, RecoveryState>,
    config: RecoveryConfig,
    snapshot: SnapshotStore,
}

impl RecoveryActor {
    fn new(
        config: RecoveryConfig,
        command_rx: mpsc::Receiver<RecoveryCommand>,
        dispatcher_tx: mpsc::Sender<DispatcherCommand>,
        snapshot: SnapshotStore,
    ) -> Self {
        Self {
            command_rx,
            dispatcher_tx,
            states: HashMap::new(),
            config,
            snapshot,
        }
    }

    /// Run the actor's main loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting recovery actor");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                RecoveryCommand::Outcome { outcome, respond_to } => {
                    let interval = self.handle_outcome(outcome).await;
                    let _ = respond_to.send(interval);
                }

                RecoveryCommand::TargetAdded {
                    id,
                    nominal_interval,
                    route,
                    reset,
                    respond_to,
                } => {
                    self.handle_target_added(id, nominal_interval, route, reset)
                        .await;
                    let _ = respond_to.send(());
                }

                RecoveryCommand::TargetRemoved { id, respond_to } => {
                    debug!("purging recovery state for '{id}'");
                    self.states.remove(&id);
                    self.snapshot.remove_target(&id).await;
                    let _ = respond_to.send(());
                }

                RecoveryCommand::PublishFeedback {
                    target_id,
                    result,
                    attempts,
                } => {
                    self.handle_feedback(target_id, result, attempts).await;
                }

                RecoveryCommand::Shutdown => {
                    debug!("received shutdown command");
                    break;
                }
            }
        }

        debug!("recovery actor stopped");
    }

    async fn handle_target_added(
        &mut self,
        id: TargetId,
        nominal_interval: Duration,
        route: PublishRoute,
        reset: bool,
    ) {
        match self.states.get_mut(&id) {
            Some(state) if !reset => {
                // definition replaced in place: cadence and route may change,
                // failure history survives
                state.nominal_interval = nominal_interval;
                state.route = route;
                self.snapshot.upsert_target(&id).await;
            }
            _ => {
                self.states.insert(
                    id.clone(),
                    RecoveryState::new(nominal_interval, route, self.config.cooldown()),
                );
                self.snapshot.reset_target(&id).await;
            }
        }
    }

    /// Classify one outcome, update the circuit, publish if allowed, and
    /// return the interval the scheduler must use next.
    async fn handle_outcome(&mut self, outcome: CheckOutcome) -> Duration {
        let id = outcome.target_id.clone();

        let Some(state) = self.states.get_mut(&id) else {
            // outcome raced a removal; the scheduler ignores the reply
            debug!("outcome for unknown target '{id}'");
            return outcome.latency.max(Duration::from_secs(60));
        };

        // lazy cooldown evaluation: an open circuit whose cooldown has
        // elapsed half-opens before this outcome is classified
        if state.circuit == Circuit::Open
            && state.last_transition.elapsed() >= state.cooldown
        {
            trace!("'{id}' cooldown elapsed, circuit half-open");
            state.circuit = Circuit::HalfOpen;
            state.last_transition = Instant::now();
        }

        let success = outcome.status.is_success();

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }

        let before = state.circuit;
        let (after, publish) = circuit_step(
            before,
            state.consecutive_failures,
            success,
            self.config.failure_threshold,
        );

        match (before, after) {
            (Circuit::Closed, Circuit::Open) => {
                warn!(
                    "'{id}' reached {} consecutive failures, circuit open",
                    state.consecutive_failures
                );
                state.last_transition = Instant::now();
            }
            (Circuit::HalfOpen, Circuit::Open) => {
                let doubled = state.cooldown.saturating_mul(2);
                state.cooldown = doubled.min(self.config.max_cooldown());
                state.last_transition = Instant::now();
                debug!(
                    "'{id}' half-open probe failed, circuit reopened (cooldown {:?})",
                    state.cooldown
                );
            }
            (Circuit::HalfOpen, Circuit::Closed) => {
                debug!("'{id}' half-open probe succeeded, circuit closed");
                state.cooldown = self.config.cooldown();
                state.last_transition = Instant::now();
            }
            _ => {}
        }
        state.circuit = after;

        let next_interval = if success {
            state.nominal_interval
        } else {
            backoff_interval(
                state.nominal_interval,
                state.consecutive_failures,
                self.config.max_backoff(),
            )
        };

        let document = ResultDocument::from_outcome(&outcome);
        self.snapshot
            .record_outcome(
                &id,
                document.status,
                state.consecutive_failures,
                state.circuit,
                next_interval.as_millis() as u64,
                state.cooldown.as_millis() as u64,
            )
            .await;

        if publish {
            let route = state.route.clone();
            if self
                .dispatcher_tx
                .send(DispatcherCommand::Publish { outcome, route })
                .await
                .is_err()
            {
                warn!("dispatcher unavailable, outcome for '{id}' not published");
            }
        } else {
            trace!("'{id}' circuit suppresses publication");
        }

        next_interval
    }

    async fn handle_feedback(&mut self, id: TargetId, result: PublishResult, attempts: u32) {
        match result {
            PublishResult::Delivered => {
                trace!("envelope for '{id}' delivered after {attempts} attempt(s)");
                self.snapshot.record_publish(&id, true).await;
            }
            PublishResult::Retryable(reason) => {
                // terminal feedback is Delivered or Fatal
                warn!("non-terminal publish feedback for '{id}': {reason}");
            }
            PublishResult::Fatal(reason) => {
                warn!(
                    "envelope for '{id}' dropped after {attempts} attempt(s): {reason}"
                );
                self.snapshot.record_publish(&id, false).await;
            }
        }
    }
}

/// Handle for controlling a RecoveryActor
#[derive(Clone)]
pub struct RecoveryHandle {
    sender: mpsc::Sender<RecoveryCommand>,
}

impl RecoveryHandle {
    /// Pre-create the command channel, for wiring the dispatcher's feedback
    /// sender before the actor exists.
    pub fn channel() -> (mpsc::Sender<RecoveryCommand>, mpsc::Receiver<RecoveryCommand>) {
        mpsc::channel(256)
    }

    /// Spawn a new recovery actor wired to the given dispatcher.
    pub fn spawn(
        config: RecoveryConfig,
        dispatcher_tx: mpsc::Sender<DispatcherCommand>,
        snapshot: SnapshotStore,
    ) -> Self {
        let (cmd_tx, cmd_rx) = Self::channel();
        Self::spawn_from(cmd_tx, cmd_rx, config, dispatcher_tx, snapshot)
    }

    /// Spawn onto a pre-created command channel.
    pub fn spawn_from(
        cmd_tx: mpsc::Sender<RecoveryCommand>,
        cmd_rx: mpsc::Receiver<RecoveryCommand>,
        config: RecoveryConfig,
        dispatcher_tx: mpsc::Sender<DispatcherCommand>,
        snapshot: SnapshotStore,
    ) -> Self {
        let actor = RecoveryActor::new(config, cmd_rx, dispatcher_tx, snapshot);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Outcome sink for the scheduler.
    pub fn sender(&self) -> mpsc::Sender<RecoveryCommand> {
        self.sender.clone()
    }

    /// Register a target. Returns once the recovery state exists.
    pub async fn target_added(
        &self,
        id: TargetId,
        nominal_interval: Duration,
        route: PublishRoute,
        reset: bool,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecoveryCommand::TargetAdded {
                id,
                nominal_interval,
                route,
                reset,
                respond_to: tx,
            })
            .await
            .context("failed to send TargetAdded command")?;
        rx.await.context("recovery dropped TargetAdded ack")?;
        Ok(())
    }

    /// Purge a removed target. Returns once the state is gone.
    pub async fn target_removed(&self, id: TargetId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecoveryCommand::TargetRemoved { id, respond_to: tx })
            .await
            .context("failed to send TargetRemoved command")?;
        rx.await.context("recovery dropped TargetRemoved ack")?;
        Ok(())
    }

    /// Gracefully shut down the recovery controller.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(RecoveryCommand::Shutdown).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::messages::CheckStatus;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn route() -> PublishRoute {
        PublishRoute {
            transport: "mqtt".to_string(),
            destination: "titan/checks".to_string(),
        }
    }

    fn outcome(id: &str, status: CheckStatus) -> CheckOutcome {
        CheckOutcome {
            target_id: TargetId::new(id),
            epoch: 1,
            timestamp: Utc::now(),
            status,
            latency: Duration::from_millis(5),
            diagnostic: None,
        }
    }

    fn test_config() -> RecoveryConfig {
        RecoveryConfig {
            failure_threshold: 3,
            cooldown_secs: 30,
            max_cooldown_secs: 120,
            max_backoff_secs: 80,
        }
    }

    struct Harness {
        handle: RecoveryHandle,
        dispatched: mpsc::Receiver<DispatcherCommand>,
        snapshot: SnapshotStore,
    }

    async fn harness(config: RecoveryConfig) -> Harness {
        let (dispatcher_tx, dispatched) = mpsc::channel(64);
        let snapshot = SnapshotStore::new();
        let handle = RecoveryHandle::spawn(config, dispatcher_tx, snapshot.clone());

        handle
            .target_added(
                TargetId::new("web-1"),
                Duration::from_secs(10),
                route(),
                true,
            )
            .await
            .unwrap();

        Harness {
            handle,
            dispatched,
            snapshot,
        }
    }

    async fn feed(harness: &Harness, status: CheckStatus) -> Duration {
        let (tx, rx) = oneshot::channel();
        harness
            .handle
            .sender()
            .send(RecoveryCommand::Outcome {
                outcome: outcome("web-1", status),
                respond_to: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn success_keeps_nominal_interval() {
        let mut h = harness(test_config()).await;

        let interval = feed(&h, CheckStatus::Success).await;
        assert_eq!(interval, Duration::from_secs(10));

        // published
        assert!(h.dispatched.recv().await.is_some());
    }

    #[tokio::test]
    async fn backoff_doubles_and_is_bounded() {
        let h = harness(test_config()).await;

        let first = feed(&h, CheckStatus::Failure("down".into())).await;
        let second = feed(&h, CheckStatus::Failure("down".into())).await;
        let third = feed(&h, CheckStatus::Timeout).await;
        let fourth = feed(&h, CheckStatus::Timeout).await;

        assert_eq!(first, Duration::from_secs(10));
        assert_eq!(second, Duration::from_secs(20));
        assert_eq!(third, Duration::from_secs(40));
        // 80s cap from the test config
        assert_eq!(fourth, Duration::from_secs(80));
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let h = harness(test_config()).await;

        feed(&h, CheckStatus::Failure("down".into())).await;
        feed(&h, CheckStatus::Failure("down".into())).await;
        let recovered = feed(&h, CheckStatus::Success).await;

        assert_eq!(recovered, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn circuit_opens_at_threshold_and_suppresses_publication() {
        let mut h = harness(test_config()).await;

        for _ in 0..3 {
            feed(&h, CheckStatus::Timeout).await;
        }

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
        assert_eq!(snapshot.targets[0].failure_count, 3);

        // the three closed-circuit outcomes were published
        for _ in 0..3 {
            assert!(h.dispatched.recv().await.is_some());
        }

        // the fourth arrives under an open circuit: suppressed
        feed(&h, CheckStatus::Timeout).await;
        let silent =
            tokio::time::timeout(Duration::from_millis(100), h.dispatched.recv()).await;
        assert!(silent.is_err(), "open circuit published an outcome");

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
        assert_eq!(snapshot.targets[0].failure_count, 4);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let config = RecoveryConfig {
            cooldown_secs: 0, // elapse immediately
            ..test_config()
        };
        let mut h = harness(config).await;

        for _ in 0..3 {
            feed(&h, CheckStatus::Timeout).await;
        }
        for _ in 0..3 {
            h.dispatched.recv().await;
        }

        // cooldown of zero: the next outcome is the half-open probe
        let interval = feed(&h, CheckStatus::Success).await;
        assert_eq!(interval, Duration::from_secs(10));

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Closed);
        assert_eq!(snapshot.targets[0].failure_count, 0);

        // probe outcome was let through
        assert!(h.dispatched.recv().await.is_some());
    }

    #[tokio::test]
    async fn half_open_probe_failure_doubles_cooldown() {
        let config = RecoveryConfig {
            cooldown_secs: 0,
            ..test_config()
        };
        let h = harness(config).await;

        for _ in 0..3 {
            feed(&h, CheckStatus::Timeout).await;
        }

        // probe fails: reopened with doubled cooldown
        feed(&h, CheckStatus::Failure("still down".into())).await;

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
        // 0 * 2 stays 0, bounded by max; use a nonzero cooldown to see the
        // doubling observable in the snapshot
        let config = RecoveryConfig {
            cooldown_secs: 1,
            ..test_config()
        };
        let h = harness(config).await;
        for _ in 0..3 {
            feed(&h, CheckStatus::Timeout).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;
        feed(&h, CheckStatus::Failure("still down".into())).await;

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
        assert_eq!(snapshot.targets[0].cooldown_ms, 2_000);
    }

    #[tokio::test]
    async fn success_while_open_resets_count_but_stays_open() {
        let config = RecoveryConfig {
            cooldown_secs: 3600, // never elapses during the test
            ..test_config()
        };
        let mut h = harness(config).await;

        for _ in 0..3 {
            feed(&h, CheckStatus::Timeout).await;
        }
        for _ in 0..3 {
            h.dispatched.recv().await;
        }

        let interval = feed(&h, CheckStatus::Success).await;
        assert_eq!(interval, Duration::from_secs(10));

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);
        assert_eq!(snapshot.targets[0].failure_count, 0);

        // still suppressed
        let silent =
            tokio::time::timeout(Duration::from_millis(100), h.dispatched.recv()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn replacement_without_reset_keeps_history() {
        let h = harness(test_config()).await;

        feed(&h, CheckStatus::Timeout).await;
        feed(&h, CheckStatus::Timeout).await;

        // re-add with a new cadence, same check type
        h.handle
            .target_added(
                TargetId::new("web-1"),
                Duration::from_secs(5),
                route(),
                false,
            )
            .await
            .unwrap();

        // third failure still opens the circuit: history survived
        feed(&h, CheckStatus::Timeout).await;
        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].circuit, Circuit::Open);

        // and the backoff bases on the new nominal interval
        let interval = feed(&h, CheckStatus::Timeout).await;
        assert_eq!(interval, Duration::from_secs(40));
    }

    #[tokio::test]
    async fn replacement_with_reset_drops_history() {
        let h = harness(test_config()).await;

        feed(&h, CheckStatus::Timeout).await;
        feed(&h, CheckStatus::Timeout).await;

        h.handle
            .target_added(
                TargetId::new("web-1"),
                Duration::from_secs(10),
                route(),
                true,
            )
            .await
            .unwrap();

        feed(&h, CheckStatus::Timeout).await;
        let snapshot = h.snapshot.snapshot().await;
        // one failure since the reset, circuit still closed
        assert_eq!(snapshot.targets[0].failure_count, 1);
        assert_eq!(snapshot.targets[0].circuit, Circuit::Closed);
    }

    #[tokio::test]
    async fn publish_feedback_is_tracked_independently() {
        let h = harness(test_config()).await;

        h.handle
            .sender()
            .send(RecoveryCommand::PublishFeedback {
                target_id: TargetId::new("web-1"),
                result: PublishResult::Fatal("broker gone".into()),
                attempts: 5,
            })
            .await
            .unwrap();

        // feedback never affects the check cadence
        let interval = feed(&h, CheckStatus::Success).await;
        assert_eq!(interval, Duration::from_secs(10));

        let snapshot = h.snapshot.snapshot().await;
        assert_eq!(snapshot.targets[0].publish_failures, 1);
        assert_eq!(snapshot.targets[0].circuit, Circuit::Closed);
    }

    #[tokio::test]
    async fn removal_purges_state() {
        let h = harness(test_config()).await;

        feed(&h, CheckStatus::Timeout).await;
        h.handle
            .target_removed(TargetId::new("web-1"))
            .await
            .unwrap();

        assert!(h.snapshot.snapshot().await.targets.is_empty());
    }
}
