//! Billing cycle store implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tariffa_core::{
    models::{CycleOperation, CycleRecord, PeriodKey},
    traits::CycleStore,
    AppError, AppResult,
};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// PostgreSQL implementation of CycleStore
pub struct PgCycleStore {
    pool: PgPool,
}

impl PgCycleStore {
    /// Create a new cycle store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_key(key: PeriodKey) -> i32 {
        key.as_u32() as i32
    }
}

#[async_trait]
impl CycleStore for PgCycleStore {
    #[instrument(skip(self))]
    async fn load(&self, key: PeriodKey) -> AppResult<Option<CycleRecord>> {
        let result = sqlx::query_as::<sqlx::Postgres, CycleRow>(
            r#"
            SELECT
                period, running, confirmed, batches_total, batches_done,
                confirmed_invoices, started_at, finished_at, confirmed_at
            FROM billing_cycles
            WHERE period = $1
            "#,
        )
        .bind(Self::db_key(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error loading cycle {}: {}", key, e);
            AppError::Database(format!("Failed to load billing cycle: {}", e))
        })?;

        result.map(CycleRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn try_start(
        &self,
        key: PeriodKey,
        batches_total: u32,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let started = sqlx::query_scalar::<sqlx::Postgres, i32>(
            r#"
            INSERT INTO billing_cycles (period, running, batches_total, batches_done, started_at)
            VALUES ($1, TRUE, $2, 0, $3)
            ON CONFLICT (period) DO UPDATE
            SET running = TRUE,
                confirmed = FALSE,
                batches_total = EXCLUDED.batches_total,
                batches_done = 0,
                confirmed_invoices = '{}',
                started_at = EXCLUDED.started_at,
                finished_at = NULL,
                confirmed_at = NULL
            WHERE billing_cycles.running = FALSE
            RETURNING period
            "#,
        )
        .bind(Self::db_key(key))
        .bind(batches_total as i32)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error starting cycle {}: {}", key, e);
            AppError::Database(format!("Failed to start billing cycle: {}", e))
        })?;

        if started.is_some() {
            info!("Billing cycle {} marked running with {} batches", key, batches_total);
        }
        Ok(started.is_some())
    }

    #[instrument(skip(self))]
    async fn complete_batch(&self, key: PeriodKey, at: DateTime<Utc>) -> AppResult<CycleRecord> {
        let row = sqlx::query_as::<sqlx::Postgres, CycleRow>(
            r#"
            UPDATE billing_cycles
            SET batches_done = LEAST(batches_done + 1, batches_total),
                running = (LEAST(batches_done + 1, batches_total) < batches_total),
                finished_at = CASE
                    WHEN LEAST(batches_done + 1, batches_total) >= batches_total
                    THEN COALESCE(finished_at, $2)
                    ELSE finished_at
                END
            WHERE period = $1
            RETURNING
                period, running, confirmed, batches_total, batches_done,
                confirmed_invoices, started_at, finished_at, confirmed_at
            "#,
        )
        .bind(Self::db_key(key))
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error completing batch of {}: {}", key, e);
            AppError::Database(format!("Failed to complete batch: {}", e))
        })?
        .ok_or_else(|| AppError::cycle_state(key, "no run in progress"))?;

        debug!("Cycle {} batch done ({}/{})", key, row.batches_done, row.batches_total);
        CycleRecord::try_from(row)
    }

    #[instrument(skip(self, invoices))]
    async fn mark_confirmed(
        &self,
        key: PeriodKey,
        invoices: Option<&[i64]>,
        at: DateTime<Utc>,
    ) -> AppResult<CycleRecord> {
        let row = match invoices {
            Some(ids) => {
                sqlx::query_as::<sqlx::Postgres, CycleRow>(
                    r#"
                    UPDATE billing_cycles
                    SET confirmed_invoices = ARRAY(
                        SELECT DISTINCT unnest(confirmed_invoices || $2::bigint[])
                        ORDER BY 1
                    )
                    WHERE period = $1
                    RETURNING
                        period, running, confirmed, batches_total, batches_done,
                        confirmed_invoices, started_at, finished_at, confirmed_at
                    "#,
                )
                .bind(Self::db_key(key))
                .bind(ids)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<sqlx::Postgres, CycleRow>(
                    r#"
                    UPDATE billing_cycles
                    SET confirmed = TRUE, confirmed_at = $2
                    WHERE period = $1
                    RETURNING
                        period, running, confirmed, batches_total, batches_done,
                        confirmed_invoices, started_at, finished_at, confirmed_at
                    "#,
                )
                .bind(Self::db_key(key))
                .bind(at)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            error!("Database error confirming cycle {}: {}", key, e);
            AppError::Database(format!("Failed to confirm billing cycle: {}", e))
        })?
        .ok_or_else(|| AppError::cycle_state(key, "cycle was never run"))?;

        CycleRecord::try_from(row)
    }

    #[instrument(skip(self))]
    async fn discard(&self, key: PeriodKey) -> AppResult<()> {
        sqlx::query("DELETE FROM billing_cycles WHERE period = $1")
            .bind(Self::db_key(key))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error discarding cycle {}: {}", key, e);
                AppError::Database(format!("Failed to discard billing cycle: {}", e))
            })?;

        info!("Billing cycle {} discarded", key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn account_count(&self, key: PeriodKey) -> AppResult<u64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT aid) FROM balances WHERE period = $1")
                .bind(Self::db_key(key))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    error!("Database error counting accounts of {}: {}", key, e);
                    AppError::Database(format!("Failed to count accounts: {}", e))
                })?;

        Ok(count.0.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn begin_operation(
        &self,
        operation: CycleOperation,
        key: Option<PeriodKey>,
        at: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO cycle_operations (id, operation, period, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(operation.as_str())
        .bind(key.map(Self::db_key))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error recording {} operation: {}", operation.as_str(), e);
            AppError::Database(format!("Failed to record operation: {}", e))
        })?;

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn finish_operation(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE cycle_operations SET ended_at = $2 WHERE id = $1 AND ended_at IS NULL")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finishing operation {}: {}", id, e);
                AppError::Database(format!("Failed to finish operation: {}", e))
            })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn operations_in_flight(&self, operations: &[CycleOperation]) -> AppResult<usize> {
        let names: Vec<&str> = operations.iter().map(CycleOperation::as_str).collect();

        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM cycle_operations
            WHERE ended_at IS NULL AND operation = ANY($1)
            "#,
        )
        .bind(&names)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error counting running operations: {}", e);
            AppError::Database(format!("Failed to count operations: {}", e))
        })?;

        Ok(count.0.max(0) as usize)
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct CycleRow {
    period: i32,
    running: bool,
    confirmed: bool,
    batches_total: i32,
    batches_done: i32,
    confirmed_invoices: Vec<i64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
}

impl TryFrom<CycleRow> for CycleRecord {
    type Error = AppError;

    fn try_from(row: CycleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: PeriodKey::try_from(row.period as u32)?,
            running: row.running,
            confirmed: row.confirmed,
            batches_total: row.batches_total.max(0) as u32,
            batches_done: row.batches_done.max(0) as u32,
            confirmed_invoices: row.confirmed_invoices.into_iter().collect(),
            started_at: row.started_at,
            finished_at: row.finished_at,
            confirmed_at: row.confirmed_at,
        })
    }
}
