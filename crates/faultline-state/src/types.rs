use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: usize = 50;

pub const MAX_PAGE_LIMIT: usize = 1000;

/// Subsystem that observed an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    #[default]
    Api,
    Idp,
    Frontend,
}

impl ErrorSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Idp => "idp",
            Self::Frontend => "frontend",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "idp" => Ok(Self::Idp),
            "frontend" => Ok(Self::Frontend),
            other => Err(format!("unknown error source: {other}")),
        }
    }
}

/// Administrator resolution of a group or occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolver_id: String,
    pub resolved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Resolution {
    pub fn new(resolver_id: impl Into<String>, notes: Option<String>) -> Self {
        Self {
            resolver_id: resolver_id.into(),
            resolved_at: Utc::now(),
            notes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CallerIdentity {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none() && self.username.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<u32>,
}

/// One concrete instance of an error being caught.
///
/// Everything except `resolution` is fixed once the occurrence is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOccurrence {
    pub id: Uuid,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    pub message: String,
    pub error_type: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    pub status_code: u16,
    /// Raw request path without query string.
    pub endpoint: String,
    /// Route template used for grouping, e.g. `/api/widgets/{id}`.
    pub route: String,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub caller: CallerIdentity,
    #[serde(default)]
    pub client: ClientInfo,
    /// Links the occurrence to an external analytics session.
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub performance: PerformanceMetrics,
    #[serde(default)]
    pub source: ErrorSource,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ErrorOccurrence {
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            id: Uuid::new_v4(),
            group_id: None,
            message: message.into(),
            error_type: error_type.into(),
            stack_trace: None,
            status_code,
            route: endpoint.clone(),
            endpoint,
            http_method: None,
            request_body: None,
            response_body: None,
            headers: None,
            caller: CallerIdentity::default(),
            client: ClientInfo::default(),
            correlation_id: None,
            trace_id: None,
            environment: None,
            performance: PerformanceMetrics::default(),
            source: ErrorSource::Api,
            resolution: None,
            metadata: BTreeMap::new(),
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    #[must_use]
    pub const fn with_source(mut self, source: ErrorSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub const fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Aggregate of all occurrences sharing a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub id: Uuid,
    /// 64 hex characters, unique across groups.
    pub signature: String,
    pub message: String,
    pub error_type: String,
    pub route: String,
    pub status_code: u16,
    pub source: ErrorSource,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub sample_stack_trace: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl ErrorGroup {
    /// A new group seeded from its first occurrence.
    pub fn seed(signature: impl Into<String>, occurrence: &ErrorOccurrence) -> Self {
        Self {
            id: Uuid::new_v4(),
            signature: signature.into(),
            message: occurrence.message.clone(),
            error_type: occurrence.error_type.clone(),
            route: occurrence.route.clone(),
            status_code: occurrence.status_code,
            source: occurrence.source,
            occurrence_count: 1,
            first_seen: occurrence.created_at,
            last_seen: occurrence.created_at,
            resolution: None,
            sample_stack_trace: occurrence.stack_trace.clone(),
            environment: occurrence.environment.clone(),
        }
    }

    /// Count one more occurrence seen at `seen_at`.
    ///
    /// `last_seen` keeps the latest timestamp regardless of arrival order.
    pub fn touch(&mut self, seen_at: DateTime<Utc>) {
        self.occurrence_count += 1;
        if seen_at < self.first_seen {
            self.first_seen = seen_at;
        }
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    pub const fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Result of claiming an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClaim {
    /// The key was free and now belongs to the given occurrence.
    Claimed,
    /// The key was already used by this occurrence.
    Existing(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSort {
    /// Most recently seen first.
    #[default]
    LastSeen,
    /// Newest groups first.
    FirstSeen,
    /// Highest occurrence count first.
    Count,
}

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub source: Option<ErrorSource>,
    pub resolved: Option<bool>,
    pub status_code: Option<u16>,
    pub environment: Option<String>,
    /// Inclusive lower bound on `last_seen`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `last_seen`.
    pub end_time: Option<DateTime<Utc>>,
}

impl GroupFilter {
    #[must_use]
    pub const fn with_source(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub const fn with_resolved(mut self, resolved: bool) -> Self {
        self.resolved = Some(resolved);
        self
    }

    #[must_use]
    pub const fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    #[must_use]
    pub const fn with_time_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn matches(&self, group: &ErrorGroup) -> bool {
        self.source.map_or(true, |s| group.source == s)
            && self.resolved.map_or(true, |r| group.is_resolved() == r)
            && self.status_code.map_or(true, |c| group.status_code == c)
            && self
                .environment
                .as_deref()
                .map_or(true, |e| group.environment.as_deref() == Some(e))
            && self.start_time.map_or(true, |t| group.last_seen >= t)
            && self.end_time.map_or(true, |t| group.last_seen <= t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OccurrenceFilter {
    pub group_id: Option<Uuid>,
    pub source: Option<ErrorSource>,
    pub resolved: Option<bool>,
    pub status_code: Option<u16>,
    /// Inclusive lower bound on `created_at`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub end_time: Option<DateTime<Utc>>,
}

impl OccurrenceFilter {
    #[must_use]
    pub fn for_group(group_id: Uuid) -> Self {
        Self {
            group_id: Some(group_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, occurrence: &ErrorOccurrence) -> bool {
        self.group_id.map_or(true, |g| occurrence.group_id == Some(g))
            && self.source.map_or(true, |s| occurrence.source == s)
            && self.resolved.map_or(true, |r| occurrence.is_resolved() == r)
            && self.status_code.map_or(true, |c| occurrence.status_code == c)
            && self.start_time.map_or(true, |t| occurrence.created_at >= t)
            && self.end_time.map_or(true, |t| occurrence.created_at <= t)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_groups: u64,
    pub unresolved_groups: u64,
    pub total_occurrences: u64,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn touch_keeps_first_seen_not_after_last_seen() {
        let base = Utc::now();
        let occurrence = ErrorOccurrence::new("boom", "Internal", 500, "/x").with_created_at(base);
        let mut group = ErrorGroup::seed("a".repeat(64), &occurrence);

        group.touch(base - Duration::seconds(10));
        group.touch(base + Duration::seconds(5));
        group.touch(base + Duration::seconds(1));

        assert_eq!(group.occurrence_count, 4);
        assert_eq!(group.first_seen, base - Duration::seconds(10));
        assert_eq!(group.last_seen, base + Duration::seconds(5));
        assert!(group.first_seen <= group.last_seen);
    }

    #[test]
    fn source_parses_case_insensitively() {
        assert_eq!("Frontend".parse::<ErrorSource>(), Ok(ErrorSource::Frontend));
        assert_eq!("IDP".parse::<ErrorSource>(), Ok(ErrorSource::Idp));
        assert!("worker".parse::<ErrorSource>().is_err());
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(50_000, 3).limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn group_filter_matches_resolution_state() {
        let occurrence = ErrorOccurrence::new("boom", "Internal", 500, "/x");
        let mut group = ErrorGroup::seed("b".repeat(64), &occurrence);

        assert!(GroupFilter::default().with_resolved(false).matches(&group));
        group.resolution = Some(Resolution::new("admin", None));
        assert!(!GroupFilter::default().with_resolved(false).matches(&group));
        assert!(GroupFilter::default()
            .with_resolved(true)
            .with_status_code(500)
            .matches(&group));
    }
}
