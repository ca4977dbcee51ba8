//! Administrative endpoints: browsing, resolution workflow, purge and
//! tracking settings.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use faultline_gateway::ApiError;
use faultline_state::{
    ErrorGroup, ErrorOccurrence, ErrorSource, GroupFilter, GroupSort, OccurrenceFilter, Page,
    StoreStats, TrackingSettings, DEFAULT_PAGE_LIMIT,
};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::recorder::{Listing, PurgeReport};
use crate::TelemetryError;

/// Resolver recorded when a request names none.
const DEFAULT_RESOLVER: &str = "admin";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/groups", get(list_groups))
        .route("/groups/{id}", get(get_group))
        .route("/groups/{id}/occurrences", get(group_occurrences))
        .route("/groups/{id}/resolve", post(resolve_group))
        .route("/groups/{id}/unresolve", post(unresolve_group))
        .route("/occurrences", get(list_occurrences))
        .route("/occurrences/{id}", get(get_occurrence))
        .route("/occurrences/{id}/resolve", post(resolve_occurrence))
        .route("/purge", post(purge))
        .route("/stats", get(stats))
        .route("/settings", get(get_settings).put(put_settings))
}

/// Query parameters for listing groups.
#[derive(Debug, Default, Deserialize)]
pub struct ListGroupsQuery {
    /// `api`, `idp` or `frontend`.
    pub source: Option<String>,
    pub resolved: Option<bool>,
    pub status_code: Option<u16>,
    pub environment: Option<String>,
    /// Lower bound on `last_seen` (RFC 3339).
    pub start_time: Option<String>,
    /// Upper bound on `last_seen` (RFC 3339).
    pub end_time: Option<String>,
    /// `last_seen` (default), `first_seen` or `count`.
    pub sort_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListOccurrencesQuery {
    pub group_id: Option<Uuid>,
    pub source: Option<String>,
    pub resolved: Option<bool>,
    pub status_code: Option<u16>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub resolver_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeQuery {
    /// Overrides the configured retention period.
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub include_groups: bool,
}

#[tracing::instrument(skip(state))]
async fn list_groups(
    State(state): State<AppState>,
    Query(params): Query<ListGroupsQuery>,
) -> Result<Json<Listing<ErrorGroup>>, ApiError> {
    let filter = build_group_filter(&params)?;
    let sort = parse_sort_by(params.sort_by.as_deref());
    let page = page(params.limit, params.offset);

    Ok(Json(state.recorder.list_groups(&filter, sort, page).await?))
}

#[tracing::instrument(skip(state))]
async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorGroup>, ApiError> {
    Ok(Json(state.recorder.get_group(id).await?))
}

#[tracing::instrument(skip(state))]
async fn group_occurrences(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<PageQuery>,
) -> Result<Json<Listing<ErrorOccurrence>>, ApiError> {
    // 404 for unknown groups rather than an empty page.
    state.recorder.get_group(id).await?;
    let listing = state
        .recorder
        .list_occurrences(
            &OccurrenceFilter::for_group(id),
            page(params.limit, params.offset),
        )
        .await?;
    Ok(Json(listing))
}

#[tracing::instrument(skip(state, payload))]
async fn resolve_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ErrorGroup>, ApiError> {
    let request = resolve_request(payload)?;
    let resolver = resolver_id(&request)?;
    let group = state
        .recorder
        .resolve_group(id, resolver, request.notes.clone())
        .await?;
    Ok(Json(group))
}

#[tracing::instrument(skip(state))]
async fn unresolve_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorGroup>, ApiError> {
    Ok(Json(state.recorder.unresolve_group(id).await?))
}

#[tracing::instrument(skip(state))]
async fn list_occurrences(
    State(state): State<AppState>,
    Query(params): Query<ListOccurrencesQuery>,
) -> Result<Json<Listing<ErrorOccurrence>>, ApiError> {
    let filter = build_occurrence_filter(&params)?;
    let page = page(params.limit, params.offset);
    Ok(Json(state.recorder.list_occurrences(&filter, page).await?))
}

#[tracing::instrument(skip(state))]
async fn get_occurrence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorOccurrence>, ApiError> {
    Ok(Json(state.recorder.get_occurrence(id).await?))
}

#[tracing::instrument(skip(state, payload))]
async fn resolve_occurrence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ErrorOccurrence>, ApiError> {
    let request = resolve_request(payload)?;
    let resolver = resolver_id(&request)?;
    let occurrence = state
        .recorder
        .resolve_occurrence(id, resolver, request.notes.clone())
        .await?;
    Ok(Json(occurrence))
}

#[tracing::instrument(skip(state))]
async fn purge(
    State(state): State<AppState>,
    Query(params): Query<PurgeQuery>,
) -> Result<Json<PurgeReport>, ApiError> {
    let report = state
        .recorder
        .purge_expired(params.retention_days, params.include_groups)
        .await?;
    Ok(Json(report))
}

#[tracing::instrument(skip(state))]
async fn stats(State(state): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.recorder.stats().await?))
}

#[tracing::instrument(skip(state))]
async fn get_settings(State(state): State<AppState>) -> Json<TrackingSettings> {
    let snapshot = state.recorder.settings().get().await;
    Json(snapshot.settings.clone())
}

#[tracing::instrument(skip(state, payload))]
async fn put_settings(
    State(state): State<AppState>,
    payload: Result<Json<TrackingSettings>, JsonRejection>,
) -> Result<Json<TrackingSettings>, ApiError> {
    let Json(settings) = payload?;
    let snapshot = state.recorder.settings().update(settings).await?;
    Ok(Json(snapshot.settings.clone()))
}

/// A missing body resolves with the default resolver and no notes.
fn resolve_request(
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<ResolveRequest, ApiError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(ResolveRequest::default()),
        Err(rejection) => Err(rejection.into()),
    }
}

fn resolver_id(request: &ResolveRequest) -> Result<&str, TelemetryError> {
    match request.resolver_id.as_deref().map(str::trim) {
        None => Ok(DEFAULT_RESOLVER),
        Some("") => Err(TelemetryError::InvalidRequest(
            "resolver_id must not be empty".to_owned(),
        )),
        Some(id) => Ok(id),
    }
}

fn build_group_filter(params: &ListGroupsQuery) -> Result<GroupFilter, TelemetryError> {
    let mut filter = GroupFilter::default();

    if let Some(ref s) = params.source {
        filter.source = Some(parse_source(s)?);
    }
    filter.resolved = params.resolved;
    filter.status_code = params.status_code;
    filter.environment.clone_from(&params.environment);
    if let Some(ref s) = params.start_time {
        filter.start_time = Some(parse_datetime(s)?);
    }
    if let Some(ref e) = params.end_time {
        filter.end_time = Some(parse_datetime(e)?);
    }

    Ok(filter)
}

fn build_occurrence_filter(
    params: &ListOccurrencesQuery,
) -> Result<OccurrenceFilter, TelemetryError> {
    let mut filter = OccurrenceFilter {
        group_id: params.group_id,
        resolved: params.resolved,
        status_code: params.status_code,
        ..Default::default()
    };

    if let Some(ref s) = params.source {
        filter.source = Some(parse_source(s)?);
    }
    if let Some(ref s) = params.start_time {
        filter.start_time = Some(parse_datetime(s)?);
    }
    if let Some(ref e) = params.end_time {
        filter.end_time = Some(parse_datetime(e)?);
    }

    Ok(filter)
}

fn page(limit: Option<usize>, offset: Option<usize>) -> Page {
    Page::new(limit.unwrap_or(DEFAULT_PAGE_LIMIT), offset.unwrap_or(0))
}

fn parse_source(s: &str) -> Result<ErrorSource, TelemetryError> {
    s.parse().map_err(TelemetryError::InvalidRequest)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, TelemetryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TelemetryError::InvalidRequest(format!("invalid datetime: {e}")))
}

fn parse_sort_by(s: Option<&str>) -> GroupSort {
    match s {
        Some("first_seen") => GroupSort::FirstSeen,
        Some("count") => GroupSort::Count,
        Some("last_seen" | _) | None => GroupSort::LastSeen,
    }
}
