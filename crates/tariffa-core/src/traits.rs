//! Common traits for repositories and services
//!
//! Defines the storage seams of the rating engine and the billing-cycle
//! manager. Every trait is object safe (except `CacheService`) so the
//! services can hold `Arc<dyn Trait>` collaborators.

use crate::error::AppError;
use crate::models::{
    Balance, BalanceKey, BalanceSnapshot, BalanceUpdate, CycleJob, CycleOperation, CycleRecord,
    PeriodKey, Plan, PricedLine, Rate, Service, UsageEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Rate, plan and service definitions
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Find rate by key
    async fn find_rate(&self, key: &str) -> Result<Option<Rate>, AppError>;

    /// Find the plan version effective at `at`
    async fn find_plan(&self, name: &str, at: DateTime<Utc>) -> Result<Option<Plan>, AppError>;

    /// Find the service version effective at `at`
    async fn find_service(&self, name: &str, at: DateTime<Utc>)
        -> Result<Option<Service>, AppError>;
}

/// Outcome of a conditioned balance update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The stored snapshot no longer matched the expected one
    Conflict,
}

/// One conditioned write of a multi-balance commit
#[derive(Debug, Clone)]
pub struct BalanceWrite {
    pub id: Uuid,
    pub expected: BalanceSnapshot,
    pub update: BalanceUpdate,
}

/// Persisted balance documents
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Load the balance of a subscriber (or shared) key
    async fn load(&self, key: &BalanceKey) -> Result<Option<Balance>, AppError>;

    /// Load a balance by id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Balance>, AppError>;

    /// Insert a new balance document
    async fn create(&self, balance: &Balance) -> Result<Balance, AppError>;

    /// Apply `update` only if the stored snapshot equals `expected`.
    ///
    /// The transaction log entry carried by the update is written in the same
    /// atomic operation.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &BalanceSnapshot,
        update: &BalanceUpdate,
    ) -> Result<UpdateOutcome, AppError>;

    /// Apply every write or none of them.
    ///
    /// Reports `Conflict` when any stored snapshot differs from its expected
    /// one; nothing is written in that case.
    async fn conditional_update_all(
        &self,
        writes: &[BalanceWrite],
    ) -> Result<UpdateOutcome, AppError>;

    /// Drop a transaction log entry once its line is durably persisted
    async fn clear_tx(&self, id: Uuid, stamp: &str) -> Result<bool, AppError>;
}

/// Archived and live priced lines
#[async_trait]
pub trait LineStore: Send + Sync {
    /// Most recent archived line of a session
    async fn last_archived_in_session(
        &self,
        sid: i64,
        session_id: Option<&str>,
    ) -> Result<Option<PricedLine>, AppError>;

    /// Sum of effective usage of the archived lines of a session
    async fn archived_session_usage(
        &self,
        sid: i64,
        session_id: Option<&str>,
    ) -> Result<Decimal, AppError>;

    /// Sum of effective usage of the live lines of a session
    async fn live_session_usage(
        &self,
        sid: i64,
        session_id: Option<&str>,
    ) -> Result<Decimal, AppError>;

    /// Add correction deltas to one archived line
    async fn correct_archived(
        &self,
        line_id: Uuid,
        deltas: &BTreeMap<String, Decimal>,
    ) -> Result<(), AppError>;

    /// Add correction deltas to the live lines of a session; returns lines touched
    async fn correct_live(
        &self,
        sid: i64,
        session_id: Option<&str>,
        deltas: &BTreeMap<String, Decimal>,
    ) -> Result<u64, AppError>;
}

/// Billing cycle markers and operation bookkeeping
#[async_trait]
pub trait CycleStore: Send + Sync {
    async fn load(&self, key: PeriodKey) -> Result<Option<CycleRecord>, AppError>;

    /// Mark the period running; `false` if it already is
    async fn try_start(
        &self,
        key: PeriodKey,
        batches_total: u32,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Record one finished aggregation batch
    async fn complete_batch(&self, key: PeriodKey, at: DateTime<Utc>)
        -> Result<CycleRecord, AppError>;

    /// Record a confirmation; `None` confirms the whole period
    async fn mark_confirmed(
        &self,
        key: PeriodKey,
        invoices: Option<&[i64]>,
        at: DateTime<Utc>,
    ) -> Result<CycleRecord, AppError>;

    /// Discard all markers of a period
    async fn discard(&self, key: PeriodKey) -> Result<(), AppError>;

    /// Number of accounts with activity in the period
    async fn account_count(&self, key: PeriodKey) -> Result<u64, AppError>;

    async fn begin_operation(
        &self,
        operation: CycleOperation,
        key: Option<PeriodKey>,
        at: DateTime<Utc>,
    ) -> Result<Uuid, AppError>;

    async fn finish_operation(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    /// Count unfinished operations of the given kinds
    async fn operations_in_flight(&self, operations: &[CycleOperation])
        -> Result<usize, AppError>;
}

/// Fire-and-forget launcher of cycle jobs
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: CycleJob) -> Result<(), AppError>;
}

/// Maps instants to billing periods
pub trait CycleCalendar: Send + Sync {
    fn key_for(&self, at: DateTime<Utc>) -> PeriodKey;

    fn start_time(&self, key: PeriodKey) -> DateTime<Utc>;

    /// Exclusive end of the period
    fn end_time(&self, key: PeriodKey) -> DateTime<Utc> {
        self.start_time(key.succ())
    }
}

/// Decides whether a prepaid event is on a free line
pub trait FreeLinePolicy: Send + Sync {
    fn is_free(&self, event: &UsageEvent) -> bool;
}

/// Cache service trait
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Get value from cache
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError>;

    /// Set value in cache with TTL
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError>;

    /// Delete value from cache
    async fn delete(&self, key: &str) -> Result<bool, AppError>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool, AppError>;
}
