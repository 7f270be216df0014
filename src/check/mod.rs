//! Check execution
//!
//! One `CheckRunner` executes a single check attempt against a target,
//! bounded by the target's hard timeout. A check never fails the caller:
//! timeouts become `CheckStatus::Timeout`, every other problem becomes
//! `CheckStatus::Failure` with a reason. The check types form a closed set,
//! dispatched by match on the target definition.

mod http;
mod tcp;

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{instrument, trace};

use crate::actors::messages::{CheckOutcome, CheckStatus, TargetSpec};
use crate::config::CheckConfig;

/// Executes checks. Cheap to clone; the inner HTTP client is shared.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    client: reqwest::Client,
}

impl Default for CheckRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckRunner {
    pub fn new() -> Self {
        Self {
            // the hard timeout is enforced per attempt below, so the client
            // itself carries none
            client: reqwest::Client::builder()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Run one check attempt and produce its outcome.
    #[instrument(skip(self, spec), fields(target = %spec.id))]
    pub async fn execute(&self, spec: &TargetSpec) -> CheckOutcome {
        trace!("executing check");

        let start = Instant::now();

        let attempt = async {
            match &spec.check {
                CheckConfig::Http {
                    url,
                    method,
                    expected_status,
                    body_pattern,
                } => {
                    http::probe(
                        &self.client,
                        url,
                        *method,
                        expected_status.as_deref(),
                        body_pattern.as_deref(),
                    )
                    .await
                }
                CheckConfig::Tcp { addr } => tcp::probe(addr).await,
            }
        };

        let (status, diagnostic) = match tokio::time::timeout(spec.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => (CheckStatus::Timeout, None),
        };

        let latency = clamp_latency(start.elapsed(), spec.timeout, &status);

        CheckOutcome {
            target_id: spec.id.clone(),
            epoch: spec.epoch,
            timestamp: Utc::now(),
            status,
            latency,
            diagnostic,
        }
    }
}

fn clamp_latency(elapsed: Duration, timeout: Duration, status: &CheckStatus) -> Duration {
    // a timed-out check reports the timeout itself, not scheduling overhead
    if matches!(status, CheckStatus::Timeout) {
        timeout
    } else {
        elapsed
    }
}
