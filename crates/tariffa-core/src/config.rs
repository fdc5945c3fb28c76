//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use crate::models::{RecordType, UsageType};
use chrono::{DateTime, Utc};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub prepaid: PrepaidConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// TTL for cached catalog entries in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    300
}

/// Pricing engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    /// Attempts allowed before a conflicting balance update gives up
    #[serde(default = "default_max_retries")]
    pub concurrent_max_retries: u32,

    /// Usage types priced flat, without touching a balance
    #[serde(default = "default_types_without_balance")]
    pub types_without_balance: Vec<UsageType>,

    /// Request type code of postpaid charge requests (never rebalanced, no live offset)
    #[serde(default = "default_postpay_charge_request_type")]
    pub postpay_charge_request_type: i32,
}

fn default_max_retries() -> u32 {
    8
}

fn default_types_without_balance() -> Vec<UsageType> {
    vec![UsageType::Credit, UsageType::Service]
}

fn default_postpay_charge_request_type() -> i32 {
    5
}

/// Prepaid charging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PrepaidConfig {
    /// Minimum volume reserved for a prepaid request
    #[serde(default = "default_min_usage")]
    pub min_usage: Decimal,

    /// Per usage type override of `min_usage`, keyed by usage type name
    #[serde(default)]
    pub min_usage_per_type: BTreeMap<String, Decimal>,

    /// Record types that are provisional (more requests follow in the session)
    #[serde(default = "default_provisional_record_types")]
    pub provisional_record_types: Vec<RecordType>,

    /// Treat a balance that cannot cover the minimum reservation as missing
    #[serde(default = "default_true")]
    pub reject_below_minimum: bool,

    /// Only rebalance when the session's final record arrives
    #[serde(default)]
    pub rebalance_on_final: bool,
}

fn default_min_usage() -> Decimal {
    Decimal::from(3)
}

fn default_provisional_record_types() -> Vec<RecordType> {
    vec![RecordType::Start, RecordType::Update]
}

fn default_true() -> bool {
    true
}

impl PrepaidConfig {
    /// Minimum reservation for a usage type
    pub fn min_usage_for(&self, usage_type: UsageType) -> Decimal {
        self.min_usage_per_type
            .get(usage_type.as_str())
            .copied()
            .unwrap_or(self.min_usage)
    }

    pub fn is_provisional(&self, record_type: Option<RecordType>) -> bool {
        record_type.map_or(false, |rt| self.provisional_record_types.contains(&rt))
    }
}

/// Billing cycle configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CycleConfig {
    /// Day of month a billing period starts on (1-28)
    #[serde(default = "default_charging_day")]
    pub charging_day: u32,

    /// Accounts aggregated per batch
    #[serde(default = "default_batch_size")]
    pub aggregator_batch_size: u32,

    /// Earliest instant cycle listings reach back to
    #[serde(default)]
    pub registration_date: Option<DateTime<Utc>>,
}

fn default_charging_day() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    100
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Emit JSON formatted log lines
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("redis.default_ttl_secs", 300)?
            .set_default("pricing.concurrent_max_retries", 8)?
            .set_default("prepaid.min_usage", 3)?
            .set_default("prepaid.rebalance_on_final", false)?
            .set_default("cycle.charging_day", 1)?
            .set_default("cycle.aggregator_batch_size", 100)?
            .set_default("log.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with TARIFFA_ prefix
            .add_source(
                Environment::with_prefix("TARIFFA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("TARIFFA").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            concurrent_max_retries: default_max_retries(),
            types_without_balance: default_types_without_balance(),
            postpay_charge_request_type: default_postpay_charge_request_type(),
        }
    }
}

impl Default for PrepaidConfig {
    fn default() -> Self {
        Self {
            min_usage: default_min_usage(),
            min_usage_per_type: BTreeMap::new(),
            provisional_record_types: default_provisional_record_types(),
            reject_below_minimum: true,
            rebalance_on_final: false,
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            charging_day: default_charging_day(),
            aggregator_batch_size: default_batch_size(),
            registration_date: None,
        }
    }
}
