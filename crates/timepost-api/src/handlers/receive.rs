//! `POST /receiveTimePostedEvent`.
//!
//! One event per request. The response status tells the caller what to do
//! next: 200 done, 400 do not retry, 500 retry later. Every response carries
//! a readable message and the connector identity.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use timepost_core::{invoke_handler, DeliveryRecord, Event, EventId, InFlightGuard, Outcome};
use tracing::{debug, error, info, instrument, warn};

use crate::{AppState, ConnectorInfo};

/// Header carrying the caller key.
pub const CALLER_KEY_HEADER: &str = "x-caller-key";

const CALLER_KEY_MISMATCH: &str = "caller key does not match the configured key";
const INTERNAL_ERROR: &str = "internal error while processing event, retry later";
const ALREADY_PROCESSING: &str = "event is already being processed, retry later";

/// Body of every webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    /// Human-readable result.
    pub message: String,
    /// Connector identity.
    pub connector_info: ConnectorInfo,
}

/// Receives one pushed event.
#[instrument(name = "receive_time_posted_event", skip_all)]
pub async fn receive_time_posted_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = match Event::from_json(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejecting malformed event");
            state.stats.write().await.rejected += 1;
            return message_response(StatusCode::BAD_REQUEST, format!("malformed event: {e}"), &state);
        },
    };

    if let Some(expected) = state.caller_key.as_deref() {
        let presented = headers.get(CALLER_KEY_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!(event_id = %event.id, "rejecting event with wrong caller key");
            state.stats.write().await.rejected += 1;
            return message_response(StatusCode::BAD_REQUEST, CALLER_KEY_MISMATCH, &state);
        }
    }

    state.stats.write().await.received += 1;
    process(&state, event).await
}

async fn process(state: &AppState, event: Event) -> Response {
    let id = event.id.clone();

    match state.store.lookup(id.clone()).await {
        Ok(Some(record)) if record.is_terminal() => return replay(state, record).await,
        Ok(_) => {},
        Err(e) => {
            error!(event_id = %id, error = %e, "dedup lookup failed");
            return message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state);
        },
    }

    let Some(claim) = state.in_flight.try_acquire(&id) else {
        info!(event_id = %id, "concurrent delivery of an event being processed");
        return message_response(StatusCode::INTERNAL_SERVER_ERROR, ALREADY_PROCESSING, state);
    };

    match state.store.mark_in_progress(id.clone()).await {
        Ok(true) => {},
        Ok(false) => return replay_current(state, id).await,
        Err(e) => {
            error!(event_id = %id, error = %e, "failed to mark event in progress");
            return message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state);
        },
    }

    // Runs on its own task so a timed-out or abandoned request still settles
    // the event and its counters.
    match tokio::spawn(settle(state.clone(), event, claim)).await {
        Ok(Some(outcome)) => outcome_response(&outcome, &state.connector),
        Ok(None) => message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state),
        Err(e) => {
            error!(event_id = %id, error = %e, "event task did not complete");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state)
        },
    }
}

/// Invokes the handler and persists its outcome. Returns `None` when the
/// handler failed; the claim is released when this returns.
async fn settle(state: AppState, event: Event, _claim: InFlightGuard) -> Option<Outcome> {
    let id = event.id.clone();

    state.stats.write().await.in_flight += 1;
    let result = invoke_handler(state.handler.as_ref(), &event).await;
    {
        let mut stats = state.stats.write().await;
        stats.in_flight -= 1;
        match &result {
            Ok(outcome) => stats.record_outcome(outcome),
            Err(_) => stats.handler_errors += 1,
        }
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(failure) => {
            // Left in progress so a redelivery reaches the handler again.
            error!(event_id = %id, error = %failure, "handler failed");
            return None;
        },
    };

    match state.store.record_outcome(id.clone(), outcome.clone()).await {
        Ok(true) => state.reporter.report_now(id, outcome.clone()),
        Ok(false) => warn!(event_id = %id, "event was resolved elsewhere, outcome not recorded"),
        Err(e) => error!(event_id = %id, error = %e, "failed to persist outcome"),
    }
    Some(outcome)
}

async fn replay(state: &AppState, record: DeliveryRecord) -> Response {
    debug!(event_id = %record.id, status = %record.status, "replaying resolved event");
    state.stats.write().await.replayed += 1;

    let Some(outcome) = record.resolved_outcome() else {
        return message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state);
    };
    if !record.sent {
        state.reporter.report_now(record.id.clone(), outcome.clone());
    }
    outcome_response(&outcome, &state.connector)
}

async fn replay_current(state: &AppState, id: EventId) -> Response {
    match state.store.lookup(id.clone()).await {
        Ok(Some(record)) if record.is_terminal() => replay(state, record).await,
        Ok(_) => message_response(StatusCode::INTERNAL_SERVER_ERROR, ALREADY_PROCESSING, state),
        Err(e) => {
            error!(event_id = %id, error = %e, "dedup lookup failed");
            message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, state)
        },
    }
}

/// Maps an outcome to its webhook response: success 200, permanent failure
/// 400, transient failure 500.
pub fn outcome_response(outcome: &Outcome, connector: &ConnectorInfo) -> Response {
    let (status, default_message) = match outcome {
        Outcome::Success { .. } => (StatusCode::OK, "event processed"),
        Outcome::PermanentFailure { .. } => (StatusCode::BAD_REQUEST, "event rejected"),
        Outcome::TransientFailure { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "event processing failed, retry later")
        },
    };
    let message = outcome.message().unwrap_or(default_message).to_string();
    (status, Json(WebhookResponse { message, connector_info: connector.clone() })).into_response()
}

fn message_response(status: StatusCode, message: impl Into<String>, state: &AppState) -> Response {
    let body = WebhookResponse { message: message.into(), connector_info: (*state.connector).clone() };
    (status, Json(body)).into_response()
}
