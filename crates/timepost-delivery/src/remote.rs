//! Contract with the remote time-event service.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use timepost_core::{Event, EventId, Outcome};

use crate::error::Result;

/// Status vocabulary understood by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    /// Event processed.
    Success,
    /// Event failed, deliver it again later.
    RetriableFailure,
    /// Event failed for good.
    Failure,
}

impl From<&Outcome> for RemoteStatus {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success { .. } => Self::Success,
            Outcome::TransientFailure { .. } => Self::RetriableFailure,
            Outcome::PermanentFailure { .. } => Self::Failure,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::RetriableFailure => write!(f, "RETRIABLE_FAILURE"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

/// One locally resolved outcome, as sent to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Event the report is about.
    pub id: EventId,
    /// Remote status.
    pub status: RemoteStatus,
    /// Outcome message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Identifier of what the handler created, for successes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Error text, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    /// Builds the report for `outcome`.
    pub fn from_outcome(id: EventId, outcome: &Outcome) -> Self {
        Self {
            id,
            status: RemoteStatus::from(outcome),
            message: outcome.message().map(str::to_string),
            external_id: outcome.external_id().map(str::to_string),
            error: outcome.error().map(str::to_string),
        }
    }
}

/// Operations the core needs from the remote service.
#[async_trait]
pub trait RemoteClient: Send + Sync + fmt::Debug {
    /// Fetches up to `limit` events awaiting delivery.
    async fn fetch(&self, limit: usize) -> Result<Vec<Event>>;

    /// Reports the local outcome of one event.
    async fn report_status(&self, report: &StatusReport) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn outcome_strategy() -> impl Strategy<Value = Outcome> {
        let text = proptest::option::of("[a-z ]{1,12}");
        prop_oneof![
            (text.clone(), text.clone())
                .prop_map(|(external_id, message)| Outcome::Success { external_id, message }),
            (text.clone(), text.clone())
                .prop_map(|(message, error)| Outcome::TransientFailure { message, error }),
            (text.clone(), text).prop_map(|(message, error)| Outcome::PermanentFailure { message, error }),
        ]
    }

    proptest! {
        #[test]
        fn report_carries_outcome(outcome in outcome_strategy()) {
            let report = StatusReport::from_outcome(EventId::from("e1"), &outcome);
            let expected = match outcome.local_status() {
                timepost_core::LocalStatus::Success => RemoteStatus::Success,
                timepost_core::LocalStatus::TransientFailure => RemoteStatus::RetriableFailure,
                _ => RemoteStatus::Failure,
            };
            prop_assert_eq!(report.status, expected);
            prop_assert_eq!(report.message.as_deref(), outcome.message());
            prop_assert_eq!(report.error.as_deref(), outcome.error());
            prop_assert_eq!(report.external_id.as_deref(), outcome.external_id());
        }
    }

    #[test]
    fn report_wire_format() {
        let report = StatusReport::from_outcome(
            EventId::from("tg-7"),
            &Outcome::success_with_id("worklog-3").with_message("logged"),
        );
        let body = serde_json::to_value(&report).expect("serialize");
        assert_eq!(
            body,
            json!({
                "id": "tg-7",
                "status": "SUCCESS",
                "message": "logged",
                "externalId": "worklog-3"
            })
        );
    }
}
