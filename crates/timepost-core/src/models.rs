//! Event, outcome and delivery record types.
//!
//! An [`Event`] is opaque apart from its id. The handler turns it into an
//! [`Outcome`], and the dedup store keeps one [`DeliveryRecord`] per id so
//! that redelivered events are answered from the record instead of reaching
//! the handler a second time.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

type SqliteDb = sqlx::Sqlite;
type SqliteTypeInfo = sqlx::sqlite::SqliteTypeInfo;
type SqliteValueRef<'r> = sqlx::sqlite::SqliteValueRef<'r>;
type BoxDynError = sqlx::error::BoxDynError;

/// Identifier assigned to an event by the remote service.
///
/// Ids are opaque strings. They are the deduplication key, so two events
/// with the same id are the same event no matter what their payloads say.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl sqlx::Type<SqliteDb> for EventId {
    fn type_info() -> SqliteTypeInfo {
        <String as sqlx::Type<SqliteDb>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as sqlx::Type<SqliteDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, SqliteDb> for EventId {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<SqliteDb>>::decode(value)?;
        Ok(Self(id))
    }
}

/// A posted time event.
///
/// Only `id` is interpreted here. Every other field is carried verbatim in
/// `payload` for the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id used for deduplication.
    pub id: EventId,

    /// Remaining fields of the event document.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Creates an event with an empty payload.
    pub fn new(id: impl Into<EventId>) -> Self {
        Self { id: id.into(), payload: serde_json::Map::new() }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Parses and validates an event from a JSON document.
    pub fn from_json(body: &[u8]) -> crate::Result<Self> {
        let event: Self = serde_json::from_slice(body)?;
        event.validate()?;
        Ok(event)
    }

    /// Rejects events that cannot be deduplicated.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::invalid_input("event id must not be empty"));
        }
        Ok(())
    }
}

/// The handler's verdict on one event.
///
/// `error` exists only on the failure variants, so a successful outcome can
/// never carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The event was processed.
    Success {
        /// Identifier of whatever the handler created for this event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
        /// Human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Processing failed in a way that may succeed if delivered again later.
    TransientFailure {
        /// Human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Underlying error text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Processing failed and must not be retried.
    PermanentFailure {
        /// Human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Underlying error text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Outcome {
    /// Plain success with no detail.
    pub fn success() -> Self {
        Self::Success { external_id: None, message: None }
    }

    /// Success that created something on the handler's side.
    pub fn success_with_id(external_id: impl Into<String>) -> Self {
        Self::Success { external_id: Some(external_id.into()), message: None }
    }

    /// Retriable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFailure { message: Some(message.into()), error: None }
    }

    /// Non-retriable failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure { message: Some(message.into()), error: None }
    }

    /// Replaces the message.
    #[must_use]
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Self::Success { message, .. }
            | Self::TransientFailure { message, .. }
            | Self::PermanentFailure { message, .. } => *message = Some(text.into()),
        }
        self
    }

    /// Attaches error text to a failure. Successes are returned unchanged.
    #[must_use]
    pub fn with_error(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Self::Success { .. } => {},
            Self::TransientFailure { error, .. } | Self::PermanentFailure { error, .. } => {
                *error = Some(text.into());
            },
        }
        self
    }

    /// Returns the message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success { message, .. }
            | Self::TransientFailure { message, .. }
            | Self::PermanentFailure { message, .. } => message.as_deref(),
        }
    }

    /// Returns the error text, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::TransientFailure { error, .. } | Self::PermanentFailure { error, .. } => {
                error.as_deref()
            },
        }
    }

    /// Returns the external id of a success.
    pub fn external_id(&self) -> Option<&str> {
        match self {
            Self::Success { external_id, .. } => external_id.as_deref(),
            _ => None,
        }
    }

    /// True for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The terminal status this outcome is persisted as.
    pub fn local_status(&self) -> LocalStatus {
        match self {
            Self::Success { .. } => LocalStatus::Success,
            Self::TransientFailure { .. } => LocalStatus::TransientFailure,
            Self::PermanentFailure { .. } => LocalStatus::PermanentFailure,
        }
    }

    /// Rebuilds an outcome from a bare status and message.
    ///
    /// Returns `None` for [`LocalStatus::InProgress`], which has no outcome.
    pub fn from_status(status: LocalStatus, message: Option<String>) -> Option<Self> {
        match status {
            LocalStatus::InProgress => None,
            LocalStatus::Success => Some(Self::Success { external_id: None, message }),
            LocalStatus::TransientFailure => Some(Self::TransientFailure { message, error: None }),
            LocalStatus::PermanentFailure => Some(Self::PermanentFailure { message, error: None }),
        }
    }
}

/// Local processing status of an event.
///
/// The only legal transitions are from `InProgress` to one of the terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    /// Dispatched to the handler but not yet resolved.
    InProgress,
    /// Handler reported success.
    Success,
    /// Handler reported a retriable failure.
    TransientFailure,
    /// Handler reported, or was converted to, a permanent failure.
    PermanentFailure,
}

impl LocalStatus {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }

    /// True once the handler has resolved the event.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "transient_failure" => Ok(Self::TransientFailure),
            "permanent_failure" => Ok(Self::PermanentFailure),
            _ => Err(CoreError::Serialization(format!("invalid delivery status: {s}"))),
        }
    }
}

impl sqlx::Type<SqliteDb> for LocalStatus {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<SqliteDb>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <&str as sqlx::Type<SqliteDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, SqliteDb> for LocalStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<SqliteDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// Persisted delivery state of one event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Event id, unique per record.
    pub id: EventId,

    /// Local processing status.
    pub status: LocalStatus,

    /// Whether the remote service acknowledged the status report.
    pub sent: bool,

    /// Message of the recorded outcome.
    pub message: Option<String>,

    /// Full outcome, when one was recorded.
    pub outcome: Option<Outcome>,

    /// When the event was last dispatched.
    pub received_at: DateTime<Utc>,

    /// When the record was first written.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// True once the event has been resolved locally.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The outcome to replay or report for a resolved record.
    pub fn resolved_outcome(&self) -> Option<Outcome> {
        match &self.outcome {
            Some(outcome) if outcome.local_status() == self.status => Some(outcome.clone()),
            _ => Outcome::from_status(self.status, self.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_keeps_unknown_fields_in_payload() {
        let event = Event::from_json(br#"{"id":"tg-1","minutes":30,"note":"standup"}"#)
            .expect("valid event");

        assert_eq!(event.id.as_str(), "tg-1");
        assert_eq!(event.payload.get("minutes"), Some(&json!(30)));
        assert_eq!(event.payload.get("note"), Some(&json!("standup")));
        assert!(!event.payload.contains_key("id"));
    }

    #[test]
    fn event_without_id_is_rejected() {
        assert!(Event::from_json(br#"{"minutes":30}"#).is_err());
        assert!(Event::from_json(br#"{"id":"   "}"#).is_err());
        assert!(Event::from_json(b"not json").is_err());
    }

    #[test]
    fn success_never_carries_an_error() {
        let outcome = Outcome::success().with_error("boom");
        assert_eq!(outcome.error(), None);

        let failure = Outcome::permanent("bad input").with_error("boom");
        assert_eq!(failure.error(), Some("boom"));
        assert_eq!(failure.message(), Some("bad input"));
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(Outcome::success().local_status(), LocalStatus::Success);
        assert_eq!(Outcome::transient("x").local_status(), LocalStatus::TransientFailure);
        assert_eq!(Outcome::permanent("x").local_status(), LocalStatus::PermanentFailure);
        assert!(Outcome::from_status(LocalStatus::InProgress, None).is_none());
    }

    #[test]
    fn status_round_trips_through_its_stored_form() {
        for status in [
            LocalStatus::InProgress,
            LocalStatus::Success,
            LocalStatus::TransientFailure,
            LocalStatus::PermanentFailure,
        ] {
            assert_eq!(status.as_str().parse::<LocalStatus>().expect("parse"), status);
        }
        assert!("done".parse::<LocalStatus>().is_err());
    }

    #[test]
    fn resolved_outcome_prefers_stored_outcome() {
        let now = Utc::now();
        let record = DeliveryRecord {
            id: EventId::from("e1"),
            status: LocalStatus::Success,
            sent: false,
            message: None,
            outcome: Some(Outcome::success_with_id("42")),
            received_at: now,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.resolved_outcome(), Some(Outcome::success_with_id("42")));

        let in_progress = DeliveryRecord { status: LocalStatus::InProgress, outcome: None, ..record };
        assert_eq!(in_progress.resolved_outcome(), None);
    }
}
