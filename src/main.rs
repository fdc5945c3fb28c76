//! Tariffa rating worker
//!
//! Reads usage events as JSON lines on stdin, prices each one against its
//! balance and writes the outcome as one JSON line on stdout. Logs go to
//! stderr.

use anyhow::Context;
use std::env;
use std::sync::Arc;
use tariffa_cache::RedisCache;
use tariffa_core::{
    models::{PricingResult, UsageEvent},
    traits::Catalog,
    AppConfig, AppResult,
};
use tariffa_db::{create_pool, run_migrations, PgBalanceStore, PgCatalog, PgLineStore};
use tariffa_services::{CatalogService, MonthlyCalendar, PricingEngine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing(json: bool) {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tariffa={},tariffa_services={},tariffa_db={},tariffa_cache={},sqlx=warn",
            log_level, log_level, log_level, log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();
    }
}

/// Catalog reader, cached when Redis is reachable
async fn build_catalog(config: &AppConfig, pg: Arc<PgCatalog>) -> Arc<dyn Catalog> {
    match RedisCache::from_config(&config.redis).await {
        Ok(cache) => {
            info!("Catalog cache enabled");
            Arc::new(
                CatalogService::new(pg, Some(Arc::new(cache)))
                    .with_ttl(config.redis.default_ttl_secs),
            )
        }
        Err(e) => {
            warn!("Redis unavailable, reading the catalog uncached: {}", e);
            Arc::new(CatalogService::<PgCatalog, RedisCache>::new(pg, None))
        }
    }
}

fn outcome_line(event: &UsageEvent, outcome: AppResult<PricingResult>) -> serde_json::Value {
    match outcome {
        Ok(result) => serde_json::json!({
            "stamp": event.stamp,
            "result": result,
        }),
        Err(e) => serde_json::json!({
            "stamp": event.stamp,
            "error": e.error_code(),
            "retryable": e.is_retryable(),
            "message": e.to_string(),
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(config.log.json);

    info!("Starting Tariffa worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let catalog = build_catalog(&config, Arc::new(PgCatalog::new(pool.clone()))).await;
    let engine = PricingEngine::new(
        catalog,
        Arc::new(PgBalanceStore::new(pool.clone())),
        Arc::new(PgLineStore::new(pool.clone())),
        Arc::new(MonthlyCalendar::from_config(&config.cycle)),
        config.pricing.clone(),
        config.prepaid.clone(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut priced = 0u64;
    let mut failed = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<UsageEvent>(&line) {
            Ok(event) => {
                let result = engine.price(&event).await;
                if result.is_ok() {
                    priced += 1;
                } else {
                    failed += 1;
                }
                outcome_line(&event, result)
            }
            Err(e) => {
                error!("Malformed event: {}", e);
                failed += 1;
                serde_json::json!({
                    "error": "invalid_input",
                    "retryable": false,
                    "message": e.to_string(),
                })
            }
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    info!("Input closed: {} priced, {} failed", priced, failed);
    pool.close().await;
    Ok(())
}
