//! PostgreSQL adapter for the error store.
//!
//! Groups are stored column by column so counts and seen windows can be
//! updated atomically in SQL. Occurrences keep their indexed fields as columns
//! and the rest of the record as JSONB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::settings::TrackingSettings;
use crate::traits::ErrorStore;
use crate::types::{
    ErrorGroup, ErrorOccurrence, GroupFilter, GroupSort, KeyClaim, OccurrenceFilter, Page,
    Resolution, StoreStats,
};

const GROUP_COLUMNS: &str = "id, signature, message, error_type, route, status_code, source, \
     occurrence_count, first_seen, last_seen, resolution, sample_stack_trace, environment";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS error_groups (
        id UUID PRIMARY KEY,
        signature TEXT NOT NULL UNIQUE,
        message TEXT NOT NULL,
        error_type TEXT NOT NULL,
        route TEXT NOT NULL,
        status_code INT NOT NULL,
        source TEXT NOT NULL,
        occurrence_count BIGINT NOT NULL DEFAULT 1,
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        resolution JSONB,
        sample_stack_trace TEXT,
        environment TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_error_groups_last_seen ON error_groups (last_seen DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS error_occurrences (
        id UUID PRIMARY KEY,
        group_id UUID REFERENCES error_groups (id) ON DELETE CASCADE,
        source TEXT NOT NULL,
        status_code INT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        resolution JSONB,
        body JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_error_occurrences_group ON error_occurrences (group_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_error_occurrences_created ON error_occurrences (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS error_idempotency_keys (
        key TEXT PRIMARY KEY,
        occurrence_id UUID NOT NULL,
        claimed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS error_tracking_settings (
        id INT PRIMARY KEY CHECK (id = 1),
        data JSONB NOT NULL
    )
    "#,
];

/// PostgreSQL-backed [`ErrorStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and create the schema if it doesn't exist.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        debug!(max_connections, "connected to PostgreSQL");

        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Foreign key violations surface as missing parents, unique violations as
/// conflicts.
fn classify(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => return StoreError::Conflict(what.to_string()),
            Some("23503") => return StoreError::NotFound(what.to_string()),
            _ => {}
        }
    }
    backend(e)
}

fn decode<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialisation(format!("{column}: {e}")))
}

fn group_from_row(row: &PgRow) -> Result<ErrorGroup, StoreError> {
    let source: String = decode(row, "source")?;
    let status_code: i32 = decode(row, "status_code")?;
    let occurrence_count: i64 = decode(row, "occurrence_count")?;
    let resolution: Option<Json<Resolution>> = decode(row, "resolution")?;

    Ok(ErrorGroup {
        id: decode(row, "id")?,
        signature: decode(row, "signature")?,
        message: decode(row, "message")?,
        error_type: decode(row, "error_type")?,
        route: decode(row, "route")?,
        status_code: u16::try_from(status_code)
            .map_err(|_| StoreError::Serialisation(format!("status_code {status_code}")))?,
        source: source.parse().map_err(StoreError::Serialisation)?,
        occurrence_count: u64::try_from(occurrence_count).unwrap_or_default(),
        first_seen: decode(row, "first_seen")?,
        last_seen: decode(row, "last_seen")?,
        resolution: resolution.map(|r| r.0),
        sample_stack_trace: decode(row, "sample_stack_trace")?,
        environment: decode(row, "environment")?,
    })
}

fn occurrence_from_row(row: &PgRow) -> Result<ErrorOccurrence, StoreError> {
    let Json(mut occurrence): Json<ErrorOccurrence> = decode(row, "body")?;
    let resolution: Option<Json<Resolution>> = decode(row, "resolution")?;
    occurrence.resolution = resolution.map(|r| r.0);
    Ok(occurrence)
}

fn push_group_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &GroupFilter) {
    if let Some(source) = filter.source {
        qb.push(" AND source = ").push_bind(source.as_str());
    }
    match filter.resolved {
        Some(true) => {
            qb.push(" AND resolution IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND resolution IS NULL");
        }
        None => {}
    }
    if let Some(code) = filter.status_code {
        qb.push(" AND status_code = ").push_bind(i32::from(code));
    }
    if let Some(environment) = &filter.environment {
        qb.push(" AND environment = ").push_bind(environment.clone());
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND last_seen >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND last_seen <= ").push_bind(end);
    }
}

fn push_occurrence_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &OccurrenceFilter) {
    if let Some(group_id) = filter.group_id {
        qb.push(" AND group_id = ").push_bind(group_id);
    }
    if let Some(source) = filter.source {
        qb.push(" AND source = ").push_bind(source.as_str());
    }
    match filter.resolved {
        Some(true) => {
            qb.push(" AND resolution IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND resolution IS NULL");
        }
        None => {}
    }
    if let Some(code) = filter.status_code {
        qb.push(" AND status_code = ").push_bind(i32::from(code));
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND created_at <= ").push_bind(end);
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ErrorStore for PostgresStore {
    #[instrument(skip(self, claimed_at), fields(key = %key, occurrence_id = %occurrence_id))]
    async fn claim_idempotency_key(
        &self,
        key: &str,
        occurrence_id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Result<KeyClaim, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO error_idempotency_keys (key, occurrence_id, claimed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(occurrence_id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 1 {
            return Ok(KeyClaim::Claimed);
        }

        let row = sqlx::query("SELECT occurrence_id FROM error_idempotency_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => Ok(KeyClaim::Existing(decode(&row, "occurrence_id")?)),
            // Released between our insert and select; the caller may retry.
            None => Err(StoreError::Conflict(format!("idempotency key {key} in flux"))),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn release_idempotency_key(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM error_idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    #[instrument(skip(self), fields(signature = %signature))]
    async fn find_group_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ErrorGroup>, StoreError> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM error_groups WHERE signature = $1");
        let row = sqlx::query(&query)
            .bind(signature)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(group_from_row).transpose()
    }

    #[instrument(skip(self, group), fields(group_id = %group.id, signature = %group.signature))]
    async fn insert_group(&self, group: &ErrorGroup) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO error_groups (
                id, signature, message, error_type, route, status_code, source,
                occurrence_count, first_seen, last_seen, resolution,
                sample_stack_trace, environment
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (signature) DO NOTHING
            "#,
        )
        .bind(group.id)
        .bind(&group.signature)
        .bind(&group.message)
        .bind(&group.error_type)
        .bind(&group.route)
        .bind(i32::from(group.status_code))
        .bind(group.source.as_str())
        .bind(i64::try_from(group.occurrence_count).unwrap_or(i64::MAX))
        .bind(group.first_seen)
        .bind(group.last_seen)
        .bind(group.resolution.clone().map(Json))
        .bind(&group.sample_stack_trace)
        .bind(&group.environment)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("group {}", group.id)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "group with signature {} already exists",
                group.signature
            )));
        }

        Ok(())
    }

    #[instrument(skip(self), fields(group_id = %id))]
    async fn touch_group(
        &self,
        id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<ErrorGroup, StoreError> {
        let query = format!(
            r#"
            UPDATE error_groups
            SET
                occurrence_count = occurrence_count + 1,
                first_seen = LEAST(first_seen, $2),
                last_seen = GREATEST(last_seen, $2)
            WHERE id = $1
            RETURNING {GROUP_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(id)
            .bind(seen_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("group {id}")))?;

        group_from_row(&row)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<ErrorGroup>, StoreError> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM error_groups WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(group_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_groups(
        &self,
        filter: &GroupFilter,
        sort: GroupSort,
        page: Page,
    ) -> Result<Vec<ErrorGroup>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {GROUP_COLUMNS} FROM error_groups WHERE TRUE"));
        push_group_filter(&mut qb, filter);

        qb.push(match sort {
            GroupSort::LastSeen => " ORDER BY last_seen DESC, id",
            GroupSort::FirstSeen => " ORDER BY first_seen DESC, id",
            GroupSort::Count => " ORDER BY occurrence_count DESC, last_seen DESC, id",
        });
        qb.push(" LIMIT ")
            .push_bind(to_i64(page.limit))
            .push(" OFFSET ")
            .push_bind(to_i64(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(group_from_row).collect()
    }

    #[instrument(skip(self, filter))]
    async fn count_groups(&self, filter: &GroupFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM error_groups WHERE TRUE");
        push_group_filter(&mut qb, filter);

        let row = qb.build().fetch_one(&self.pool).await.map_err(backend)?;
        let n: i64 = decode(&row, "n")?;
        Ok(n.max(0) as u64)
    }

    #[instrument(skip(self, resolution), fields(group_id = %id, resolved = resolution.is_some()))]
    async fn set_group_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
        cascade: bool,
    ) -> Result<ErrorGroup, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let query = format!(
            "UPDATE error_groups SET resolution = $2 WHERE id = $1 RETURNING {GROUP_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(resolution.clone().map(Json))
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("group {id}")))?;
        let group = group_from_row(&row)?;

        if cascade {
            sqlx::query("UPDATE error_occurrences SET resolution = $2 WHERE group_id = $1")
                .bind(id)
                .bind(resolution.map(Json))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(group)
    }

    #[instrument(skip(self, occurrence), fields(occurrence_id = %occurrence.id))]
    async fn insert_occurrence(&self, occurrence: &ErrorOccurrence) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO error_occurrences (id, group_id, source, status_code, created_at, resolution, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(occurrence.id)
        .bind(occurrence.group_id)
        .bind(occurrence.source.as_str())
        .bind(i32::from(occurrence.status_code))
        .bind(occurrence.created_at)
        .bind(occurrence.resolution.clone().map(Json))
        .bind(Json(occurrence))
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &format!("occurrence {}", occurrence.id)))?;

        Ok(())
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<ErrorOccurrence>, StoreError> {
        let row = sqlx::query("SELECT resolution, body FROM error_occurrences WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(occurrence_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_occurrences(
        &self,
        filter: &OccurrenceFilter,
        page: Page,
    ) -> Result<Vec<ErrorOccurrence>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT resolution, body FROM error_occurrences WHERE TRUE");
        push_occurrence_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(to_i64(page.limit))
            .push(" OFFSET ")
            .push_bind(to_i64(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(occurrence_from_row).collect()
    }

    #[instrument(skip(self, filter))]
    async fn count_occurrences(&self, filter: &OccurrenceFilter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM error_occurrences WHERE TRUE");
        push_occurrence_filter(&mut qb, filter);

        let row = qb.build().fetch_one(&self.pool).await.map_err(backend)?;
        let n: i64 = decode(&row, "n")?;
        Ok(n.max(0) as u64)
    }

    #[instrument(skip(self, resolution), fields(occurrence_id = %id, resolved = resolution.is_some()))]
    async fn set_occurrence_resolution(
        &self,
        id: Uuid,
        resolution: Option<Resolution>,
    ) -> Result<ErrorOccurrence, StoreError> {
        let row = sqlx::query(
            "UPDATE error_occurrences SET resolution = $2 WHERE id = $1 RETURNING resolution, body",
        )
        .bind(id)
        .bind(resolution.map(Json))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("occurrence {id}")))?;

        occurrence_from_row(&row)
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn purge_occurrences_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let deleted = sqlx::query("DELETE FROM error_occurrences WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

        let keys = sqlx::query("DELETE FROM error_idempotency_keys WHERE claimed_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

        tx.commit().await.map_err(backend)?;
        debug!(occurrences = deleted, keys, "purged occurrences");
        Ok(deleted)
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn purge_groups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM error_groups WHERE last_seen < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        // Occurrences of deleted groups go with them (ON DELETE CASCADE).
        debug!(groups = result.rows_affected(), "purged groups");
        Ok(result.rows_affected())
    }

    async fn load_settings(&self) -> Result<Option<TrackingSettings>, StoreError> {
        let row = sqlx::query("SELECT data FROM error_tracking_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let Json(settings): Json<TrackingSettings> = decode(&row, "data")?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, settings))]
    async fn save_settings(&self, settings: &TrackingSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO error_tracking_settings (id, data)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(Json(settings))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM error_groups) AS total_groups,
                (SELECT COUNT(*) FROM error_groups WHERE resolution IS NULL) AS unresolved_groups,
                (SELECT COUNT(*) FROM error_occurrences) AS total_occurrences
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let total_groups: i64 = decode(&row, "total_groups")?;
        let unresolved_groups: i64 = decode(&row, "unresolved_groups")?;
        let total_occurrences: i64 = decode(&row, "total_occurrences")?;

        Ok(StoreStats {
            total_groups: total_groups.max(0) as u64,
            unresolved_groups: unresolved_groups.max(0) as u64,
            total_occurrences: total_occurrences.max(0) as u64,
        })
    }
}
