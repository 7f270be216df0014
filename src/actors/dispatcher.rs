//! DispatcherActor - serializes outcomes and ships them to brokers
//!
//! Publishing is decoupled from checking: the dispatcher receives accepted
//! outcomes, serializes each into a [`ResultDocument`], and drives publish
//! attempts as spawned tasks (borrow a pooled connection, publish with a
//! per-attempt timeout, release). The actor loop itself never blocks on
//! broker I/O.
//!
//! ## Retry discipline
//!
//! Transient failures re-enqueue the envelope on a retry heap with an
//! exponentially growing delay instead of sleeping a task per retry. An
//! envelope lives until its delivery is confirmed or its attempt budget
//! (default 5) is exhausted, at which point it is dropped with a recorded
//! diagnostic event - never silently.
//!
//! Borrow failures and publish failures are classified separately; both are
//! reported to the recovery controller as publish feedback, which keeps
//! broker trouble from ever looking like target unhealthiness.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use crate::ResultDocument;
use crate::config::DispatchConfig;
use crate::pool::{ConnectionPool, PoolError};
use crate::snapshot::SnapshotStore;
use crate::transport::TransportError;

use super::messages::{
    CheckOutcome, DispatcherCommand, PublishResult, PublishRoute, RecoveryCommand, TargetId,
};

/// A serialized outcome in flight to a broker
#[derive(Debug)]
pub struct PublishEnvelope {
    pub target_id: TargetId,
    pub transport: String,
    pub destination: String,
    pub payload: Vec<u8>,
    /// Attempts completed so far
    pub attempts: u32,
}

#[derive(Debug)]
enum AttemptError {
    /// No connection could be borrowed (distinct from publish failure)
    Borrow(PoolError),

    /// The publish itself failed
    Publish(TransportError),

    /// The attempt exceeded the per-attempt deadline
    Timeout,
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Borrow(PoolError::UnknownTransport(_)) => false,
            AttemptError::Borrow(_) => true,
            AttemptError::Publish(e) => e.is_transient(),
            AttemptError::Timeout => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            AttemptError::Borrow(e) => format!("pool: {e}"),
            AttemptError::Publish(e) => format!("publish: {e}"),
            AttemptError::Timeout => "publish attempt timed out".to_string(),
        }
    }
}

struct AttemptDone {
    envelope: PublishEnvelope,
    result: Result<(), AttemptError>,
}

struct RetryEntry {
    at: Instant,
    seq: u64,
    envelope: PublishEnvelope,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for RetryEntry {}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Actor publishing serialized outcomes over pooled broker connections
pub struct DispatcherActor {
    command_rx: mpsc::Receiver<DispatcherCommand>,
    pool: Arc<ConnectionPool>,
    feedback_tx: mpsc::Sender<RecoveryCommand>,
    config: DispatchConfig,
    snapshot: SnapshotStore,

    retries: BinaryHeap<Reverse<RetryEntry>>,
    retry_seq: u64,

    attempt_tx: mpsc::Sender<AttemptDone>,
    attempt_rx: mpsc::Receiver<AttemptDone>,
}

impl DispatcherActor {
    fn new(
        config: DispatchConfig,
        command_rx: mpsc::Receiver<DispatcherCommand>,
        pool: Arc<ConnectionPool>,
        feedback_tx: mpsc::Sender<RecoveryCommand>,
        snapshot: SnapshotStore,
    ) -> Self {
        let (attempt_tx, attempt_rx) = mpsc::channel(256);

        Self {
            command_rx,
            pool,
            feedback_tx,
            config,
            snapshot,
            retries: BinaryHeap::new(),
            retry_seq: 0,
            attempt_tx,
            attempt_rx,
        }
    }

    /// Run the actor's main loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting dispatcher actor");

        loop {
            let deadline = self.retries.peek().map(|Reverse(entry)| entry.at);

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(DispatcherCommand::Publish { outcome, route }) => {
                            self.accept(outcome, route);
                        }
                        Some(DispatcherCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(done) = self.attempt_rx.recv() => {
                    self.handle_attempt(done).await;
                }

                _ = sleep_until_or_never(deadline), if deadline.is_some() => {
                    self.launch_due_retries();
                }
            }
        }

        debug!("dispatcher actor stopped");
    }

    /// Serialize an accepted outcome and start its first attempt.
    fn accept(&mut self, outcome: CheckOutcome, route: PublishRoute) {
        let document = ResultDocument::from_outcome(&outcome);
        let payload = match serde_json::to_vec(&document) {
            Ok(payload) => payload,
            Err(e) => {
                // a serialization failure here is a programming error, but it
                // must still leave a trace instead of vanishing
                error!("failed to serialize outcome for '{}': {e}", outcome.target_id);
                self.snapshot.record_drop();
                return;
            }
        };

        let envelope = PublishEnvelope {
            target_id: outcome.target_id,
            transport: route.transport,
            destination: route.destination,
            payload,
            attempts: 0,
        };

        self.launch(envelope);
    }

    /// Spawn one publish attempt for an envelope.
    fn launch(&self, envelope: PublishEnvelope) {
        let pool = self.pool.clone();
        let attempt_tx = self.attempt_tx.clone();
        let timeout = self.config.publish_timeout();

        tokio::spawn(async move {
            let result = attempt_publish(&pool, &envelope, timeout).await;
            let _ = attempt_tx.send(AttemptDone { envelope, result }).await;
        });
    }

    fn launch_due_retries(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.retries.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = self.retries.pop().expect("peeked entry");
            trace!(
                "retrying envelope for '{}' (attempt {})",
                entry.envelope.target_id,
                entry.envelope.attempts + 1
            );
            self.launch(entry.envelope);
        }
    }

    async fn handle_attempt(&mut self, done: AttemptDone) {
        let mut envelope = done.envelope;
        envelope.attempts += 1;

        match done.result {
            Ok(()) => {
                trace!(
                    "delivered envelope for '{}' after {} attempt(s)",
                    envelope.target_id, envelope.attempts
                );
                self.report(&envelope, PublishResult::Delivered).await;
            }

            Err(e) if e.is_transient() && envelope.attempts < self.config.max_attempts => {
                let delay = retry_delay(
                    self.config.retry_base(),
                    envelope.attempts,
                    self.config.max_retry_backoff(),
                );
                debug!(
                    "attempt {} for '{}' failed ({}), retrying in {delay:?}",
                    envelope.attempts,
                    envelope.target_id,
                    e.describe()
                );

                self.retry_seq += 1;
                self.retries.push(Reverse(RetryEntry {
                    at: Instant::now() + delay,
                    seq: self.retry_seq,
                    envelope,
                }));
            }

            Err(e) => {
                // budget exhausted or unrecoverable: drop with a record
                error!(
                    "dropping envelope for '{}' after {} attempt(s): {}",
                    envelope.target_id,
                    envelope.attempts,
                    e.describe()
                );
                self.snapshot.record_drop();
                self.report(&envelope, PublishResult::Fatal(e.describe())).await;
            }
        }
    }

    async fn report(&self, envelope: &PublishEnvelope, result: PublishResult) {
        let feedback = RecoveryCommand::PublishFeedback {
            target_id: envelope.target_id.clone(),
            result,
            attempts: envelope.attempts,
        };
        if self.feedback_tx.send(feedback).await.is_err() {
            trace!("recovery controller gone, feedback discarded");
        }
    }
}

/// Delay before retry number `attempts_done + 1`: exponential from the base,
/// bounded. Pure, so the schedule is testable on its own.
pub fn retry_delay(
    base: std::time::Duration,
    attempts_done: u32,
    max: std::time::Duration,
) -> std::time::Duration {
    let exponent = attempts_done.saturating_sub(1).min(16);
    let factor = 1u32 << exponent;
    base.saturating_mul(factor).min(max)
}

/// One publish attempt: borrow, publish within the deadline, release.
async fn attempt_publish(
    pool: &ConnectionPool,
    envelope: &PublishEnvelope,
    timeout: std::time::Duration,
) -> Result<(), AttemptError> {
    let mut conn = pool
        .borrow(&envelope.transport)
        .await
        .map_err(AttemptError::Borrow)?;

    let attempt = tokio::time::timeout(
        timeout,
        conn.connection()
            .publish(&envelope.destination, &envelope.payload),
    )
    .await;

    match attempt {
        Ok(Ok(())) => {
            pool.release(conn, true).await;
            Ok(())
        }
        Ok(Err(e)) => {
            // the connection is suspect after any publish error
            pool.release(conn, false).await;
            Err(AttemptError::Publish(e))
        }
        Err(_) => {
            pool.release(conn, false).await;
            Err(AttemptError::Timeout)
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle for controlling a DispatcherActor
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    /// Spawn a new dispatcher actor over the given pool. `feedback_tx` is the
    /// recovery controller's mailbox.
    pub fn spawn(
        config: DispatchConfig,
        pool: Arc<ConnectionPool>,
        feedback_tx: mpsc::Sender<RecoveryCommand>,
        snapshot: SnapshotStore,
    ) -> (Self, mpsc::Sender<DispatcherCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let actor = DispatcherActor::new(config, cmd_rx, pool, feedback_tx, snapshot);
        tokio::spawn(actor.run());

        (Self { sender: cmd_tx.clone() }, cmd_tx)
    }

    /// Gracefully shut down the dispatcher.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(DispatcherCommand::Shutdown).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
