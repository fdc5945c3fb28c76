//! Priced line store implementation
//!
//! Lines are written by the downstream unify stage into `archive_lines` and
//! `lines` (the live copy). Rebalance corrections never rewrite a line; they
//! are appended to `line_corrections` and summed on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tariffa_core::{
    models::{LedgerEntry, PricedLine, UsageType},
    traits::LineStore,
    AppError, AppResult,
};
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Which copy of a line a correction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSource {
    Archive,
    Live,
}

impl LineSource {
    fn as_str(&self) -> &'static str {
        match self {
            LineSource::Archive => "archive",
            LineSource::Live => "live",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            LineSource::Archive => "archive_lines",
            LineSource::Live => "lines",
        }
    }
}

/// PostgreSQL implementation of LineStore
pub struct PgLineStore {
    pool: PgPool,
}

impl PgLineStore {
    /// Create a new line store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist an archived line
    #[instrument(skip(self, line), fields(stamp = %line.stamp))]
    pub async fn insert_archived(&self, line: &PricedLine) -> AppResult<()> {
        self.insert(LineSource::Archive, line).await
    }

    /// Persist a live line
    #[instrument(skip(self, line), fields(stamp = %line.stamp))]
    pub async fn insert_live(&self, line: &PricedLine) -> AppResult<()> {
        self.insert(LineSource::Live, line).await
    }

    async fn insert(&self, source: LineSource, line: &PricedLine) -> AppResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (
                id, stamp, sid, aid, session_id, usage_type, rate_ref, plan,
                urt, usagev, aprice, balance_ref, in_group, out_group, arategroups
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (stamp) DO NOTHING
            "#,
            source.table()
        );

        sqlx::query(&query)
            .bind(line.id)
            .bind(&line.stamp)
            .bind(line.sid)
            .bind(line.aid)
            .bind(&line.session_id)
            .bind(line.usage_type.as_str())
            .bind(&line.rate_ref)
            .bind(&line.plan)
            .bind(line.urt)
            .bind(line.usagev)
            .bind(line.aprice)
            .bind(line.balance_ref)
            .bind(line.in_group)
            .bind(line.out_group)
            .bind(Json(&line.arategroups))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error inserting {} line: {}", source.as_str(), e);
                AppError::Database(format!("Failed to insert line: {}", e))
            })?;

        Ok(())
    }

    async fn session_usage(
        &self,
        source: LineSource,
        sid: i64,
        session_id: Option<&str>,
    ) -> AppResult<Decimal> {
        let query = format!(
            r#"
            SELECT
                COALESCE(SUM(l.usagev), 0)
                + COALESCE((
                    SELECT SUM(c.delta)
                    FROM line_corrections c
                    JOIN {table} l2 ON l2.id = c.line_id
                    WHERE c.source = $3
                      AND c.field = 'rebalance_usagev'
                      AND l2.sid = $1
                      AND l2.session_id IS NOT DISTINCT FROM $2
                ), 0)
            FROM {table} l
            WHERE l.sid = $1 AND l.session_id IS NOT DISTINCT FROM $2
            "#,
            table = source.table()
        );

        sqlx::query_scalar::<sqlx::Postgres, Decimal>(&query)
            .bind(sid)
            .bind(session_id)
            .bind(source.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error summing {} session usage: {}", source.as_str(), e);
                AppError::Database(format!("Failed to sum session usage: {}", e))
            })
    }

    async fn add_corrections(
        &self,
        source: LineSource,
        line_ids: &[Uuid],
        deltas: &BTreeMap<String, Decimal>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin correction transaction: {}", e);
            AppError::Database(format!("Failed to begin transaction: {}", e))
        })?;

        for line_id in line_ids {
            for (field, delta) in deltas {
                sqlx::query(
                    r#"
                    INSERT INTO line_corrections (line_id, source, field, delta)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(line_id)
                .bind(source.as_str())
                .bind(field)
                .bind(delta)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    error!("Database error recording correction on {}: {}", line_id, e);
                    AppError::Database(format!("Failed to record correction: {}", e))
                })?;
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit corrections: {}", e);
            AppError::Database(format!("Failed to commit corrections: {}", e))
        })
    }
}

#[async_trait]
impl LineStore for PgLineStore {
    #[instrument(skip(self))]
    async fn last_archived_in_session(
        &self,
        sid: i64,
        session_id: Option<&str>,
    ) -> AppResult<Option<PricedLine>> {
        debug!("Finding last archived line of session");

        let result = sqlx::query_as::<sqlx::Postgres, LineRow>(
            r#"
            SELECT
                a.id, a.stamp, a.sid, a.aid, a.session_id, a.usage_type,
                a.rate_ref, a.plan, a.urt, a.usagev, a.aprice,
                a.balance_ref, a.in_group, a.out_group, a.arategroups,
                COALESCE((
                    SELECT jsonb_object_agg(t.field, t.total::text)
                    FROM (
                        SELECT c.field, SUM(c.delta) AS total
                        FROM line_corrections c
                        WHERE c.line_id = a.id AND c.source = 'archive'
                        GROUP BY c.field
                    ) t
                ), '{}'::jsonb) AS corrections
            FROM archive_lines a
            WHERE a.sid = $1 AND a.session_id IS NOT DISTINCT FROM $2
            ORDER BY a.urt DESC
            LIMIT 1
            "#,
        )
        .bind(sid)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding session line: {}", e);
            AppError::Database(format!("Failed to find session line: {}", e))
        })?;

        result.map(PricedLine::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn archived_session_usage(&self, sid: i64, session_id: Option<&str>) -> AppResult<Decimal> {
        self.session_usage(LineSource::Archive, sid, session_id).await
    }

    #[instrument(skip(self))]
    async fn live_session_usage(&self, sid: i64, session_id: Option<&str>) -> AppResult<Decimal> {
        self.session_usage(LineSource::Live, sid, session_id).await
    }

    #[instrument(skip(self, deltas))]
    async fn correct_archived(
        &self,
        line_id: Uuid,
        deltas: &BTreeMap<String, Decimal>,
    ) -> AppResult<()> {
        self.add_corrections(LineSource::Archive, &[line_id], deltas)
            .await
    }

    #[instrument(skip(self, deltas))]
    async fn correct_live(
        &self,
        sid: i64,
        session_id: Option<&str>,
        deltas: &BTreeMap<String, Decimal>,
    ) -> AppResult<u64> {
        let ids = sqlx::query_scalar::<sqlx::Postgres, Uuid>(
            r#"
            SELECT id FROM lines
            WHERE sid = $1 AND session_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(sid)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding live session lines: {}", e);
            AppError::Database(format!("Failed to find live lines: {}", e))
        })?;

        self.add_corrections(LineSource::Live, &ids, deltas).await?;
        Ok(ids.len() as u64)
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    stamp: String,
    sid: i64,
    aid: i64,
    session_id: Option<String>,
    usage_type: String,
    rate_ref: String,
    plan: String,
    urt: DateTime<Utc>,
    usagev: Decimal,
    aprice: Decimal,
    balance_ref: Option<Uuid>,
    in_group: Option<Decimal>,
    out_group: Option<Decimal>,
    arategroups: Json<Vec<LedgerEntry>>,
    corrections: Json<BTreeMap<String, Decimal>>,
}

impl TryFrom<LineRow> for PricedLine {
    type Error = AppError;

    fn try_from(row: LineRow) -> Result<Self, Self::Error> {
        let usage_type = UsageType::from_str(&row.usage_type).ok_or_else(|| {
            AppError::Serialization(format!("Unknown usage type {}", row.usage_type))
        })?;

        Ok(Self {
            id: row.id,
            stamp: row.stamp,
            sid: row.sid,
            aid: row.aid,
            session_id: row.session_id,
            usage_type,
            rate_ref: row.rate_ref,
            plan: row.plan,
            urt: row.urt,
            usagev: row.usagev,
            aprice: row.aprice,
            balance_ref: row.balance_ref,
            in_group: row.in_group,
            out_group: row.out_group,
            arategroups: row.arategroups.0,
            corrections: row.corrections.0,
        })
    }
}
