pub mod actors;
pub mod check;
pub mod config;
pub mod discovery;
pub mod pool;
pub mod registry;
pub mod snapshot;
pub mod transport;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actors::messages::{CheckOutcome, CheckStatus};

/// The document published for every accepted check outcome.
///
/// Field presence is part of the transport contract: `diagnostic` is omitted
/// entirely when there is nothing to report, `latencyMs` is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDocument {
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DocumentStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Success,
    Failure,
    Timeout,
}

impl ResultDocument {
    pub fn from_outcome(outcome: &CheckOutcome) -> Self {
        let (status, diagnostic) = match &outcome.status {
            CheckStatus::Success => (DocumentStatus::Success, outcome.diagnostic.clone()),
            CheckStatus::Failure(reason) => (DocumentStatus::Failure, Some(reason.clone())),
            CheckStatus::Timeout => (DocumentStatus::Timeout, None),
        };

        Self {
            target_id: outcome.target_id.to_string(),
            timestamp: outcome.timestamp,
            status,
            latency_ms: outcome.latency.as_millis() as u64,
            diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::messages::TargetId;
    use std::time::Duration;

    #[test]
    fn document_omits_absent_diagnostic() {
        let outcome = CheckOutcome {
            target_id: TargetId::new("web-1"),
            epoch: 1,
            timestamp: Utc::now(),
            status: CheckStatus::Success,
            latency: Duration::from_millis(42),
            diagnostic: None,
        };

        let json = serde_json::to_value(ResultDocument::from_outcome(&outcome)).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["latencyMs"], 42);
        assert!(json.get("diagnostic").is_none());
    }

    #[test]
    fn document_carries_failure_reason() {
        let outcome = CheckOutcome {
            target_id: TargetId::new("web-1"),
            epoch: 1,
            timestamp: Utc::now(),
            status: CheckStatus::Failure("connection refused".into()),
            latency: Duration::from_millis(3),
            diagnostic: None,
        };

        let json = serde_json::to_value(ResultDocument::from_outcome(&outcome)).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["diagnostic"], "connection refused");
    }
}
