//! Balance store implementation
//!
//! Balances are stored one row per (sid, aid, period) with the totals kept in
//! JSONB columns. Optimistic concurrency compares the stored totals with the
//! snapshot the caller priced against, inside a single `UPDATE`. Commits that
//! span several balances run those updates in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Postgres};
use std::collections::BTreeMap;
use tariffa_core::{
    models::{
        Allowance, Balance, BalanceKey, BalanceSnapshot, BalanceUpdate, ChargingType, PeriodKey,
        PricingResult, Totals, UsageType,
    },
    traits::{BalanceStore, BalanceWrite, UpdateOutcome},
    AppError, AppResult,
};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// PostgreSQL implementation of BalanceStore
pub struct PgBalanceStore {
    pool: PgPool,
}

impl PgBalanceStore {
    /// Create a new balance store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Conditioned `UPDATE` of one row; `false` when the stored totals moved
    async fn write_conditioned<'e, E>(
        executor: E,
        id: Uuid,
        expected: &BalanceSnapshot,
        update: &BalanceUpdate,
    ) -> AppResult<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let next = expected.applied(update);
        let (stamp, entry) = match &update.tx {
            Some((stamp, result)) => (Some(stamp.as_str()), Some(Json(result))),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE balances
            SET
                usage_totals = $2,
                group_totals = $3,
                cost = $4,
                tx = CASE
                    WHEN $5::text IS NULL THEN tx
                    ELSE tx || jsonb_build_object($5::text, $6::jsonb)
                END,
                updated_at = NOW()
            WHERE id = $1
              AND usage_totals = $7
              AND group_totals = $8
              AND cost = $9
            "#,
        )
        .bind(id)
        .bind(Json(&next.totals))
        .bind(Json(&next.groups))
        .bind(next.cost)
        .bind(stamp)
        .bind(entry)
        .bind(Json(&expected.totals))
        .bind(Json(&expected.groups))
        .bind(expected.cost)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Database error updating balance {}: {}", id, e);
            AppError::Database(format!("Failed to update balance: {}", e))
        })?;

        Ok(result.rows_affected() == 1)
    }

    fn charging_str(charging: ChargingType) -> &'static str {
        match charging {
            ChargingType::Postpaid => "postpaid",
            ChargingType::Prepaid => "prepaid",
        }
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    #[instrument(skip(self))]
    async fn load(&self, key: &BalanceKey) -> AppResult<Option<Balance>> {
        debug!("Loading balance {}", key);

        let result = sqlx::query_as::<sqlx::Postgres, BalanceRow>(
            r#"
            SELECT
                id, sid, aid, period, charging,
                usage_totals, group_totals, cost, allowance, tx, updated_at
            FROM balances
            WHERE sid = $1 AND aid = $2 AND period = $3
            "#,
        )
        .bind(key.sid)
        .bind(key.aid)
        .bind(key.period.as_u32() as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error loading balance {}: {}", key, e);
            AppError::Database(format!("Failed to load balance: {}", e))
        })?;

        result.map(Balance::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Balance>> {
        debug!("Finding balance by id: {}", id);

        let result = sqlx::query_as::<sqlx::Postgres, BalanceRow>(
            r#"
            SELECT
                id, sid, aid, period, charging,
                usage_totals, group_totals, cost, allowance, tx, updated_at
            FROM balances
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding balance {}: {}", id, e);
            AppError::Database(format!("Failed to find balance: {}", e))
        })?;

        result.map(Balance::try_from).transpose()
    }

    #[instrument(skip(self, balance), fields(sid = balance.sid, aid = balance.aid))]
    async fn create(&self, balance: &Balance) -> AppResult<Balance> {
        debug!("Creating balance for period {}", balance.period);

        let row = sqlx::query_as::<sqlx::Postgres, BalanceRow>(
            r#"
            INSERT INTO balances (
                id, sid, aid, period, charging,
                usage_totals, group_totals, cost, allowance, tx
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING
                id, sid, aid, period, charging,
                usage_totals, group_totals, cost, allowance, tx, updated_at
            "#,
        )
        .bind(balance.id)
        .bind(balance.sid)
        .bind(balance.aid)
        .bind(balance.period.as_u32() as i32)
        .bind(Self::charging_str(balance.charging))
        .bind(Json(&balance.totals))
        .bind(Json(&balance.groups))
        .bind(balance.cost)
        .bind(balance.allowance.as_ref().map(Json))
        .bind(Json(&balance.tx))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error creating balance: {}", e);
            AppError::Database(format!("Failed to create balance: {}", e))
        })?;

        info!("Created balance {}", row.id);
        Balance::try_from(row)
    }

    #[instrument(skip(self, expected, update))]
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &BalanceSnapshot,
        update: &BalanceUpdate,
    ) -> AppResult<UpdateOutcome> {
        if Self::write_conditioned(&self.pool, id, expected, update).await? {
            debug!("Balance {} updated", id);
            Ok(UpdateOutcome::Applied)
        } else {
            debug!("Balance {} changed since it was read", id);
            Ok(UpdateOutcome::Conflict)
        }
    }

    #[instrument(skip(self, writes), fields(balances = writes.len()))]
    async fn conditional_update_all(&self, writes: &[BalanceWrite]) -> AppResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Database(format!("Failed to start transaction: {}", e))
        })?;

        for write in writes {
            if !Self::write_conditioned(&mut *tx, write.id, &write.expected, &write.update).await? {
                debug!("Balance {} changed since it was read, rolling back", write.id);
                tx.rollback().await.map_err(|e| {
                    error!("Failed to roll back transaction: {}", e);
                    AppError::Database(format!("Failed to roll back transaction: {}", e))
                })?;
                return Ok(UpdateOutcome::Conflict);
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Database(format!("Failed to commit transaction: {}", e))
        })?;

        debug!("{} balances updated", writes.len());
        Ok(UpdateOutcome::Applied)
    }

    #[instrument(skip(self))]
    async fn clear_tx(&self, id: Uuid, stamp: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE balances
            SET tx = tx - $2::text
            WHERE id = $1 AND tx ? $2::text
            "#,
        )
        .bind(id)
        .bind(stamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error clearing tx {} on {}: {}", stamp, id, e);
            AppError::Database(format!("Failed to clear transaction: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    id: Uuid,
    sid: i64,
    aid: i64,
    period: i32,
    charging: String,
    usage_totals: Json<BTreeMap<UsageType, Totals>>,
    group_totals: Json<BTreeMap<String, Totals>>,
    cost: Decimal,
    allowance: Option<Json<Allowance>>,
    tx: Json<BTreeMap<String, PricingResult>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BalanceRow> for Balance {
    type Error = AppError;

    fn try_from(row: BalanceRow) -> Result<Self, Self::Error> {
        let charging = match row.charging.as_str() {
            "prepaid" => ChargingType::Prepaid,
            _ => ChargingType::Postpaid,
        };

        Ok(Self {
            id: row.id,
            sid: row.sid,
            aid: row.aid,
            period: PeriodKey::try_from(row.period as u32)?,
            charging,
            totals: row.usage_totals.0,
            groups: row.group_totals.0,
            cost: row.cost,
            allowance: row.allowance.map(|a| a.0),
            tx: row.tx.0,
            updated_at: row.updated_at,
        })
    }
}
