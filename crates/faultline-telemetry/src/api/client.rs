//! Batched error reports from browser clients.
//!
//! Each item becomes one frontend occurrence and goes through the same
//! pipeline as intercepted failures. Items carrying an `idempotency_key`
//! are safe to resend.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::USER_AGENT, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use faultline_gateway::{forwarded_ip, header_value, parse_user_agent, ApiError};
use faultline_state::{CallerIdentity, ClientInfo, ErrorOccurrence, ErrorSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppState;
use crate::RecordOutcome;

/// Largest batch accepted in one request.
pub const MAX_BATCH_SIZE: usize = 100;

/// Status recorded for items that carry none.
pub const DEFAULT_CLIENT_STATUS: u16 = 500;

/// Error type recorded for items that carry none.
const DEFAULT_CLIENT_ERROR_TYPE: &str = "Error";

/// Codes listed to clients as tracked when their settings flag is on.
const FLAGGED_CODES: [u16; 9] = [400, 401, 403, 404, 429, 500, 502, 503, 504];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/client", post(report_batch))
        .route("/client/config", get(client_config))
}

#[derive(Debug, Deserialize)]
pub struct ClientBatch {
    pub errors: Vec<ClientErrorReport>,
}

/// One error observed in the browser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientErrorReport {
    pub message: String,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    /// Status of the failed request, if the error came from one.
    pub status_code: Option<u16>,
    /// Page or request URL.
    #[serde(alias = "url")]
    pub endpoint: String,
    pub route: Option<String>,
    pub http_method: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub session_id: Option<String>,
    pub environment: Option<String>,
    pub response_time_ms: Option<f64>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchResponse {
    pub received: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    /// How long the client should wait before sending the next batch.
    pub batch_interval_seconds: u32,
}

#[derive(Debug, Serialize)]
pub struct ClientConfigResponse {
    pub batch_interval_seconds: u32,
    pub max_batch_size: usize,
    pub tracked_status_codes: Vec<u16>,
}

#[tracing::instrument(skip(state, headers, payload))]
async fn report_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ClientBatch>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let Json(batch) = payload?;
    if batch.errors.len() > MAX_BATCH_SIZE {
        return Err(ApiError::bad_request(format!(
            "Batch of {} errors exceeds the limit of {MAX_BATCH_SIZE}",
            batch.errors.len()
        )));
    }

    let client = client_info(&headers);
    let now = Utc::now();
    let mut response = BatchResponse {
        received: batch.errors.len(),
        ..Default::default()
    };

    for report in batch.errors {
        let occurrence = into_occurrence(report, client.clone(), now);
        match state.recorder.record_occurrence(occurrence).await {
            Ok(RecordOutcome::Recorded { .. }) => response.recorded += 1,
            Ok(RecordOutcome::Duplicate { .. }) => response.duplicates += 1,
            Ok(RecordOutcome::Skipped { .. }) => response.skipped += 1,
            Err(e) => {
                tracing::warn!(error = %e, "failed to record client error");
                response.failed += 1;
            }
        }
    }

    let snapshot = state.recorder.settings().get().await;
    response.batch_interval_seconds = snapshot.settings.frontend_batch_interval_seconds;

    tracing::debug!(
        received = response.received,
        recorded = response.recorded,
        duplicates = response.duplicates,
        skipped = response.skipped,
        "client batch processed"
    );
    Ok(Json(response))
}

#[tracing::instrument(skip(state))]
async fn client_config(State(state): State<AppState>) -> Json<ClientConfigResponse> {
    let snapshot = state.recorder.settings().get().await;
    let settings = &snapshot.settings;

    let mut tracked: Vec<u16> = FLAGGED_CODES
        .into_iter()
        .chain(settings.custom_codes())
        .filter(|code| settings.is_status_tracked(*code))
        .collect();
    tracked.sort_unstable();
    tracked.dedup();

    Json(ClientConfigResponse {
        batch_interval_seconds: settings.frontend_batch_interval_seconds,
        max_batch_size: MAX_BATCH_SIZE,
        tracked_status_codes: tracked,
    })
}

/// Map one report to an occurrence. Timestamps in the future are clamped to
/// `now`.
fn into_occurrence(
    report: ClientErrorReport,
    client: ClientInfo,
    now: DateTime<Utc>,
) -> ErrorOccurrence {
    let route = report.route.unwrap_or_else(|| report.endpoint.clone());
    let created_at = report.occurred_at.map_or(now, |at| at.min(now));

    let mut occurrence = ErrorOccurrence::new(
        report.message,
        report
            .error_type
            .unwrap_or_else(|| DEFAULT_CLIENT_ERROR_TYPE.to_owned()),
        report.status_code.unwrap_or(DEFAULT_CLIENT_STATUS),
        report.endpoint,
    )
    .with_route(route)
    .with_source(ErrorSource::Frontend)
    .with_created_at(created_at);

    occurrence.stack_trace = report.stack_trace;
    occurrence.http_method = report.http_method;
    occurrence.caller = CallerIdentity {
        user_id: report.user_id,
        username: report.username,
        email: report.email,
    };
    occurrence.client = client;
    occurrence.correlation_id = report.session_id;
    occurrence.environment = report.environment;
    occurrence.performance.response_time_ms = report.response_time_ms;
    occurrence.idempotency_key = report.idempotency_key;
    occurrence.metadata = report.metadata;
    occurrence
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let user_agent = header_value(headers, USER_AGENT.as_str());
    let parsed = user_agent.as_deref().map(parse_user_agent);

    ClientInfo {
        ip_address: forwarded_ip(headers),
        browser: parsed.as_ref().and_then(|ua| ua.browser.clone()),
        os: parsed.as_ref().and_then(|ua| ua.os.clone()),
        device: parsed.as_ref().map(|ua| ua.device.as_str().to_owned()),
        user_agent,
    }
}
