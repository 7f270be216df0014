//! SchedulerActor - owns every per-target check timer
//!
//! One actor holds the timing state for all registered targets, so the timer
//! wheel is a single binary heap instead of a task per target.
//!
//! ## Key Features
//!
//! 1. **Jittered cadence** - next fire = now + interval + up to 10% jitter,
//!    so co-hosted targets do not stampede shared infrastructure
//! 2. **Bounded fan-out** - a global semaphore caps simultaneously running
//!    checks; targets due beyond the cap wait their turn instead of being
//!    dropped
//! 3. **Backoff coupling** - each processed outcome returns the interval the
//!    recovery controller wants next, so unhealthy targets are probed less
//!    aggressively
//! 4. **Safe removal** - removing a target cancels its timer and marks any
//!    in-flight check discardable; stale outcomes never reach recovery
//!
//! ## Message Flow
//!
//! ```text
//! Timer fire → spawn check task (permit) → outcome → epoch check → RecoveryActor
//!     ↑                                                   │ next interval
//!     └───────────────── reschedule ←────────────────────┘
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::check::CheckRunner;
use crate::config::SchedulerConfig;

use super::messages::{
    CheckOutcome, RecoveryCommand, SchedulerCommand, TargetId, TargetSpec,
};

use std::sync::Arc;

/// Per-target scheduling phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug)]
struct TargetState {
    spec: TargetSpec,
    /// Cadence currently in force (backoff-adjusted, not necessarily nominal)
    current_interval: Duration,
    phase: Phase,
    /// Bumped whenever a new timer entry is pushed; stale heap entries are
    /// recognized by a generation mismatch
    timer_gen: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct FireEntry {
    at: Instant,
    id: TargetId,
    generation: u64,
}

impl Ord for FireEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for FireEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Actor that schedules and fires all target checks
pub struct SchedulerActor {
    command_rx: mpsc::Receiver<SchedulerCommand>,

    /// Outcome sink of the recovery controller
    recovery_tx: mpsc::Sender<RecoveryCommand>,

    /// Executes the actual checks
    runner: CheckRunner,

    /// Global cap on simultaneously running checks
    limiter: Arc<Semaphore>,

    targets: HashMap<TargetId, TargetState>,
    queue: BinaryHeap<Reverse<FireEntry>>,

    /// Due targets waiting for a free permit
    waiting: VecDeque<(TargetId, u64)>,

    /// Completed check results flow back over this channel
    results_tx: mpsc::Sender<CheckOutcome>,
    results_rx: mpsc::Receiver<CheckOutcome>,
}

impl SchedulerActor {
    fn new(
        config: SchedulerConfig,
        runner: CheckRunner,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        recovery_tx: mpsc::Sender<RecoveryCommand>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(256);

        Self {
            command_rx,
            recovery_tx,
            runner,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_checks)),
            targets: HashMap::new(),
            queue: BinaryHeap::new(),
            waiting: VecDeque::new(),
            results_tx,
            results_rx,
        }
    }

    /// Run the actor's main loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(outcome) = self.results_rx.recv() => {
                    self.handle_result(outcome).await;
                    // a finished check freed a permit
                    self.drain_waiting();
                }

                _ = sleep_until_or_never(deadline), if deadline.is_some() => {
                    self.fire_due();
                }
            }
        }

        debug!("scheduler actor stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TargetAdded { spec, respond_to } => {
                debug!("scheduling target '{}' (epoch {})", spec.id, spec.epoch);
                let id = spec.id.clone();
                let interval = spec.interval;

                let generation = self
                    .targets
                    .get(&id)
                    .map(|state| state.timer_gen + 1)
                    .unwrap_or(0);

                self.targets.insert(
                    id.clone(),
                    TargetState {
                        spec,
                        current_interval: interval,
                        phase: Phase::Idle,
                        timer_gen: generation,
                    },
                );
                self.schedule(&id);

                let _ = respond_to.send(());
            }

            SchedulerCommand::TargetRemoved { id, respond_to } => {
                debug!("removing target '{id}'");
                // heap entries go stale by lookup failure; in-flight results
                // go stale the same way
                self.targets.remove(&id);
                self.waiting.retain(|(waiting_id, _)| *waiting_id != id);

                let _ = respond_to.send(());
            }

            SchedulerCommand::UpdateInterval { id, interval } => {
                if let Some(state) = self.targets.get_mut(&id) {
                    trace!("updating interval for '{id}' to {interval:?}");
                    state.current_interval = interval;
                }
            }

            SchedulerCommand::CheckNow { id, respond_to } => {
                let phase = self.targets.get(&id).map(|state| state.phase);
                let known = match phase {
                    Some(Phase::Running) => true,
                    Some(_) => {
                        debug!("immediate check requested for '{id}'");
                        self.dispatch(&id);
                        true
                    }
                    None => false,
                };
                let _ = respond_to.send(known);
            }

            SchedulerCommand::Shutdown => unreachable!("handled by the select loop"),
        }
    }

    /// Process a finished check: discard stale results, otherwise forward to
    /// recovery and reschedule with the interval it hands back.
    async fn handle_result(&mut self, outcome: CheckOutcome) {
        let id = outcome.target_id.clone();

        let Some(state) = self.targets.get_mut(&id) else {
            debug!("discarding outcome for removed target '{id}'");
            return;
        };

        if state.spec.epoch != outcome.epoch {
            debug!(
                "discarding stale outcome for '{id}' (epoch {} != {})",
                outcome.epoch, state.spec.epoch
            );
            return;
        }

        state.phase = Phase::Idle;

        let (respond_to, next_interval) = oneshot::channel();
        let fallback = state.current_interval;

        let accepted = self
            .recovery_tx
            .send(RecoveryCommand::Outcome { outcome, respond_to })
            .await
            .is_ok();

        let interval = if accepted {
            next_interval.await.unwrap_or(fallback)
        } else {
            warn!("recovery controller unavailable, keeping current cadence");
            fallback
        };

        if let Some(state) = self.targets.get_mut(&id) {
            state.current_interval = interval;
        }
        self.schedule(&id);
    }

    /// Arm the timer for a target's next fire.
    fn schedule(&mut self, id: &TargetId) {
        let Some(state) = self.targets.get_mut(id) else {
            return;
        };

        let interval = jittered(state.current_interval);
        state.timer_gen += 1;
        state.phase = Phase::Scheduled;

        self.queue.push(Reverse(FireEntry {
            at: Instant::now() + interval,
            id: id.clone(),
            generation: state.timer_gen,
        }));

        trace!("armed '{id}' in {interval:?}");
    }

    fn entry_is_current(&self, entry: &FireEntry) -> bool {
        self.targets
            .get(&entry.id)
            .is_some_and(|state| state.timer_gen == entry.generation && state.phase == Phase::Scheduled)
    }

    /// Earliest live deadline, dropping stale heap entries on the way.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.queue.peek() {
            if self.entry_is_current(entry) {
                return Some(entry.at);
            }
            self.queue.pop();
        }
        None
    }

    /// Fire every entry that is due.
    fn fire_due(&mut self) {
        let now = Instant::now();

        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = self.queue.pop().expect("peeked entry");
            if self.entry_is_current(&entry) {
                self.dispatch(&entry.id);
            }
        }
    }

    /// Start a check for a target, or queue it if the global cap is reached.
    fn dispatch(&mut self, id: &TargetId) {
        let Some(state) = self.targets.get_mut(id) else {
            return;
        };

        match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => {
                state.phase = Phase::Running;

                let runner = self.runner.clone();
                let spec = state.spec.clone();
                let results_tx = self.results_tx.clone();

                tokio::spawn(async move {
                    let outcome = runner.execute(&spec).await;
                    drop(permit);
                    let _ = results_tx.send(outcome).await;
                });
            }
            Err(_) => {
                trace!("concurrency cap reached, '{id}' waits for a permit");
                self.waiting.push_back((id.clone(), state.timer_gen));
            }
        }
    }

    /// Dispatch targets that were due while the cap was saturated.
    fn drain_waiting(&mut self) {
        while self.limiter.available_permits() > 0 {
            let Some((id, generation)) = self.waiting.pop_front() else {
                return;
            };

            let still_valid = self
                .targets
                .get(&id)
                .is_some_and(|state| state.timer_gen == generation && state.phase == Phase::Scheduled);

            if still_valid {
                self.dispatch(&id);
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        // the branch is guarded by `deadline.is_some()`
        None => std::future::pending().await,
    }
}

/// Interval plus up to 10% of itself, to avoid thundering herds.
fn jittered(interval: Duration) -> Duration {
    let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..0.10));
    interval + jitter
}

/// Handle for controlling a SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn a new scheduler actor wired to the given recovery controller.
    pub fn spawn(
        config: SchedulerConfig,
        runner: CheckRunner,
        recovery_tx: mpsc::Sender<RecoveryCommand>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = SchedulerActor::new(config, runner, cmd_rx, recovery_tx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Register (or replace) a target. Returns once the scheduler has
    /// processed the event.
    pub async fn target_added(&self, spec: TargetSpec) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TargetAdded {
                spec,
                respond_to: tx,
            })
            .await
            .context("failed to send TargetAdded command")?;
        rx.await.context("scheduler dropped TargetAdded ack")?;
        Ok(())
    }

    /// Remove a target. Returns once the timer is cancelled and any
    /// in-flight check is marked discardable.
    pub async fn target_removed(&self, id: TargetId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TargetRemoved { id, respond_to: tx })
            .await
            .context("failed to send TargetRemoved command")?;
        rx.await.context("scheduler dropped TargetRemoved ack")?;
        Ok(())
    }

    /// Override the cadence of a target until its next outcome.
    pub async fn update_interval(&self, id: TargetId, interval: Duration) -> Result<()> {
        self.sender
            .send(SchedulerCommand::UpdateInterval { id, interval })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    /// Trigger an immediate check. Returns whether the target is known.
    pub async fn check_now(&self, id: TargetId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::CheckNow { id, respond_to: tx })
            .await
            .context("failed to send CheckNow command")?;
        rx.await.context("scheduler dropped CheckNow response")
    }

    /// Gracefully shut down the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
