//! Catalog repository implementation
//!
//! Rates, plans and services are stored as JSONB definitions. Plans and
//! services are versioned by validity window; lookups return the version
//! effective at the event time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tariffa_core::{
    models::{Plan, Rate, Service},
    traits::Catalog,
    AppError, AppResult,
};
use tracing::{debug, error, info, instrument};

/// PostgreSQL implementation of Catalog
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a new catalog repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace a rate definition
    #[instrument(skip(self, rate), fields(key = %rate.key))]
    pub async fn upsert_rate(&self, rate: &Rate) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rates (key, definition, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(&rate.key)
        .bind(Json(rate))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error saving rate {}: {}", rate.key, e);
            AppError::Database(format!("Failed to save rate: {}", e))
        })?;

        info!("Saved rate {}", rate.key);
        Ok(())
    }

    /// Add a plan version
    #[instrument(skip(self, plan), fields(name = %plan.name))]
    pub async fn insert_plan(&self, plan: &Plan) -> AppResult<()> {
        plan.validate()?;

        sqlx::query(
            r#"
            INSERT INTO plans (name, valid_from, valid_to, definition)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&plan.name)
        .bind(plan.from)
        .bind(plan.to)
        .bind(Json(plan))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error saving plan {}: {}", plan.name, e);
            AppError::Database(format!("Failed to save plan: {}", e))
        })?;

        info!("Saved plan {} effective from {}", plan.name, plan.from);
        Ok(())
    }

    /// Add a service version
    #[instrument(skip(self, service), fields(name = %service.name))]
    pub async fn insert_service(&self, service: &Service) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO services (name, valid_from, valid_to, definition)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&service.name)
        .bind(service.from)
        .bind(service.to)
        .bind(Json(service))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error saving service {}: {}", service.name, e);
            AppError::Database(format!("Failed to save service: {}", e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    #[instrument(skip(self))]
    async fn find_rate(&self, key: &str) -> AppResult<Option<Rate>> {
        debug!("Finding rate by key: {}", key);

        let result = sqlx::query_scalar::<sqlx::Postgres, Json<Rate>>(
            "SELECT definition FROM rates WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding rate {}: {}", key, e);
            AppError::Database(format!("Failed to find rate: {}", e))
        })?;

        Ok(result.map(|r| r.0))
    }

    #[instrument(skip(self))]
    async fn find_plan(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Plan>> {
        debug!("Finding plan {} at {}", name, at);

        let result = sqlx::query_scalar::<sqlx::Postgres, Json<Plan>>(
            r#"
            SELECT definition FROM plans
            WHERE name = $1
              AND valid_from <= $2
              AND (valid_to IS NULL OR valid_to > $2)
            ORDER BY valid_from DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding plan {}: {}", name, e);
            AppError::Database(format!("Failed to find plan: {}", e))
        })?;

        Ok(result.map(|p| p.0))
    }

    #[instrument(skip(self))]
    async fn find_service(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Service>> {
        debug!("Finding service {} at {}", name, at);

        let result = sqlx::query_scalar::<sqlx::Postgres, Json<Service>>(
            r#"
            SELECT definition FROM services
            WHERE name = $1
              AND valid_from <= $2
              AND (valid_to IS NULL OR valid_to > $2)
            ORDER BY valid_from DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding service {}: {}", name, e);
            AppError::Database(format!("Failed to find service: {}", e))
        })?;

        Ok(result.map(|s| s.0))
    }
}
