//! Billing cycle lifecycle
//!
//! A billing period moves through `to_run -> running -> finished ->
//! confirmed`. The status is never stored: it is derived from the period
//! key relative to the current one and from the markers of the persisted
//! `CycleRecord`. The heavy lifting (aggregation, invoice generation,
//! charging) happens in jobs handed to a `JobLauncher`; the jobs report back
//! through `complete_batch`, `complete_confirmation` and `finish_operation`.

use crate::constants::{DEFAULT_LISTING_MONTHS, FULL_PERCENT, MAX_LISTED_CYCLES};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tariffa_core::{
    config::CycleConfig,
    models::{CycleInfo, CycleJob, CycleOperation, CycleRecord, CycleStatus, PeriodKey},
    traits::{CycleCalendar, CycleStore, JobLauncher},
    AppError, AppResult,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Periods starting on a fixed day of every month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyCalendar {
    charging_day: u32,
}

impl MonthlyCalendar {
    /// `charging_day` is clamped to 1-28 so every month has it
    pub fn new(charging_day: u32) -> Self {
        Self {
            charging_day: charging_day.clamp(1, 28),
        }
    }

    pub fn from_config(config: &CycleConfig) -> Self {
        Self::new(config.charging_day)
    }

    pub fn charging_day(&self) -> u32 {
        self.charging_day
    }
}

impl Default for MonthlyCalendar {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CycleCalendar for MonthlyCalendar {
    fn key_for(&self, at: DateTime<Utc>) -> PeriodKey {
        let key = PeriodKey::of_month(at);
        if at.day() >= self.charging_day {
            key
        } else {
            key.pred()
        }
    }

    fn start_time(&self, key: PeriodKey) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(key.year(), key.month(), self.charging_day, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }
}

/// Job launcher feeding an in-process channel
///
/// The receiving end belongs to whatever runs the jobs.
#[derive(Debug, Clone)]
pub struct ChannelJobLauncher {
    sender: mpsc::UnboundedSender<CycleJob>,
}

impl ChannelJobLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CycleJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobLauncher for ChannelJobLauncher {
    async fn launch(&self, job: CycleJob) -> AppResult<()> {
        debug!("Launching {:?}", job);
        self.sender
            .send(job)
            .map_err(|e| AppError::Internal(format!("Job queue closed: {}", e)))
    }
}

fn positive_ids(ids: &[i64], what: &str) -> AppResult<Vec<i64>> {
    let valid: Vec<i64> = ids.iter().copied().filter(|id| *id > 0).collect();
    if valid.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "At least one valid {} id is required",
            what
        )));
    }
    Ok(valid)
}

/// Billing cycle manager
pub struct BillingCycleManager {
    store: Arc<dyn CycleStore>,
    calendar: Arc<dyn CycleCalendar>,
    launcher: Arc<dyn JobLauncher>,
    config: CycleConfig,
}

impl BillingCycleManager {
    pub fn new(
        store: Arc<dyn CycleStore>,
        calendar: Arc<dyn CycleCalendar>,
        launcher: Arc<dyn JobLauncher>,
        config: CycleConfig,
    ) -> Self {
        Self {
            store,
            calendar,
            launcher,
            config,
        }
    }

    /// Derive the status of `key` from its record
    pub fn derive_status(
        &self,
        key: PeriodKey,
        record: Option<&CycleRecord>,
        now: DateTime<Utc>,
    ) -> CycleStatus {
        let current = self.calendar.key_for(now);
        if key == current {
            return CycleStatus::Current;
        }
        if key > current {
            return CycleStatus::Future;
        }

        let Some(record) = record else {
            return CycleStatus::ToRun;
        };
        let ended = record.is_complete() && now >= self.calendar.end_time(key);
        match (record.running, ended, record.confirmed) {
            (true, _, _) => CycleStatus::Running,
            (false, false, _) => CycleStatus::ToRun,
            (false, true, false) => CycleStatus::Finished,
            (false, true, true) => CycleStatus::Confirmed,
        }
    }

    pub async fn status_at(&self, key: PeriodKey, now: DateTime<Utc>) -> AppResult<CycleStatus> {
        let record = self.store.load(key).await?;
        Ok(self.derive_status(key, record.as_ref(), now))
    }

    pub async fn status(&self, key: PeriodKey) -> AppResult<CycleStatus> {
        self.status_at(key, Utc::now()).await
    }

    /// Active and future periods can never be run or confirmed
    fn reject_open(&self, key: PeriodKey, now: DateTime<Utc>) -> AppResult<()> {
        if key >= self.calendar.key_for(now) {
            return Err(AppError::cycle_state(
                key,
                "can't run billing cycle on active or future cycles",
            ));
        }
        Ok(())
    }

    fn batches_for(&self, accounts: u64) -> u32 {
        let size = u64::from(self.config.aggregator_batch_size.max(1));
        let batches = accounts.div_ceil(size).max(1);
        u32::try_from(batches).unwrap_or(u32::MAX)
    }

    async fn confirmation_percentage(&self, record: Option<&CycleRecord>, key: PeriodKey) -> AppResult<Decimal> {
        let Some(record) = record else {
            return Ok(Decimal::ZERO);
        };
        if record.confirmed {
            return Ok(FULL_PERCENT);
        }
        let accounts = self.store.account_count(key).await?;
        if accounts == 0 {
            return Ok(Decimal::ZERO);
        }
        let pct = Decimal::from(record.confirmed_invoices.len() as u64) * FULL_PERCENT
            / Decimal::from(accounts);
        Ok(pct.min(FULL_PERCENT).round_dp(2))
    }

    /// Period summary: window, status, completion and confirmation progress
    #[instrument(skip(self))]
    pub async fn cycle_info_at(&self, key: PeriodKey, now: DateTime<Utc>) -> AppResult<CycleInfo> {
        let record = self.store.load(key).await?;
        let status = self.derive_status(key, record.as_ref(), now);
        let completion_percentage = record
            .as_ref()
            .map_or(Decimal::ZERO, CycleRecord::completion_percentage);
        let confirmation_percentage = match status {
            CycleStatus::Finished | CycleStatus::Confirmed => {
                Some(self.confirmation_percentage(record.as_ref(), key).await?)
            }
            _ => None,
        };

        Ok(CycleInfo {
            key,
            start: self.calendar.start_time(key),
            end: self.calendar.end_time(key),
            status,
            completion_percentage,
            confirmation_percentage,
        })
    }

    pub async fn cycle_info(&self, key: PeriodKey) -> AppResult<CycleInfo> {
        self.cycle_info_at(key, Utc::now()).await
    }

    /// Periods overlapping `[from, to]`, newest first
    ///
    /// Never reaches back before the configured registration date and never
    /// returns more than `MAX_LISTED_CYCLES` periods.
    pub async fn cycles_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CycleInfo>> {
        if from > to {
            return Err(AppError::InvalidInput(format!(
                "Range start {} is after its end {}",
                from, to
            )));
        }

        let mut last = self.calendar.key_for(from);
        if let Some(registered) = self.config.registration_date {
            last = last.max(self.calendar.key_for(registered));
        }

        let mut key = self.calendar.key_for(to);
        let mut cycles = Vec::new();
        while key >= last && cycles.len() < MAX_LISTED_CYCLES {
            cycles.push(self.cycle_info_at(key, now).await?);
            key = key.pred();
        }
        Ok(cycles)
    }

    /// Periods of the last year
    pub async fn recent_cycles(&self, now: DateTime<Utc>) -> AppResult<Vec<CycleInfo>> {
        let from = now
            .checked_sub_months(Months::new(DEFAULT_LISTING_MONTHS))
            .unwrap_or(now);
        self.cycles_in_range(from, now, now).await
    }

    /// Start aggregating a closed period
    ///
    /// A finished or confirmed period is only run again with `rerun`, which
    /// discards its previous results first.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, key: PeriodKey, rerun: bool, now: DateTime<Utc>) -> AppResult<()> {
        self.reject_open(key, now)?;

        let record = self.store.load(key).await?;
        if record.as_ref().map_or(false, |r| r.running) {
            return Err(AppError::cycle_state(key, "already running"));
        }
        match self.derive_status(key, record.as_ref(), now) {
            CycleStatus::Finished | CycleStatus::Confirmed => {
                if !rerun {
                    return Err(AppError::cycle_state(
                        key,
                        "already finished, pass rerun to run it again",
                    ));
                }
                info!("Discarding previous run of {}", key);
                self.store.discard(key).await?;
            }
            _ => {}
        }

        let accounts = self.store.account_count(key).await?;
        let batches = self.batches_for(accounts);
        if !self.store.try_start(key, batches, now).await? {
            return Err(AppError::cycle_state(key, "already running"));
        }

        self.launcher
            .launch(CycleJob::Aggregate {
                key,
                accounts: None,
            })
            .await?;
        info!(
            "Billing cycle {} started: {} accounts in {} batches",
            key, accounts, batches
        );
        Ok(())
    }

    /// Discard the results of a finished or confirmed period
    #[instrument(skip(self))]
    pub async fn reset(&self, key: PeriodKey, now: DateTime<Utc>) -> AppResult<()> {
        match self.status_at(key, now).await? {
            CycleStatus::Finished | CycleStatus::Confirmed => {
                self.store.discard(key).await?;
                info!("Billing cycle {} reset", key);
                Ok(())
            }
            status => Err(AppError::cycle_state(
                key,
                format!("only finished or confirmed cycles can be reset, status is {}", status),
            )),
        }
    }

    /// Aggregate a subset of accounts
    #[instrument(skip(self))]
    pub async fn run_accounts(
        &self,
        key: PeriodKey,
        accounts: &[i64],
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let accounts = positive_ids(accounts, "account")?;
        let status = self.status_at(key, now).await?;
        if !matches!(status, CycleStatus::ToRun | CycleStatus::Finished) {
            return Err(AppError::cycle_state(
                key,
                format!("can't aggregate accounts while {}", status),
            ));
        }

        info!("Aggregating {} accounts of {}", accounts.len(), key);
        self.launcher
            .launch(CycleJob::Aggregate {
                key,
                accounts: Some(accounts),
            })
            .await
    }

    /// Record a finished aggregation batch
    pub async fn complete_batch(&self, key: PeriodKey, now: DateTime<Utc>) -> AppResult<CycleRecord> {
        let record = self.store.complete_batch(key, now).await?;
        if record.is_complete() {
            info!("Billing cycle {} aggregated", key);
        }
        Ok(record)
    }

    /// Launch invoice generation for a finished period
    ///
    /// With `invoices`, only those invoices are confirmed and the period
    /// stays unconfirmed; this is allowed again after a full confirmation.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        key: PeriodKey,
        invoices: Option<&[i64]>,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let invoices = invoices
            .map(|ids| positive_ids(ids, "invoice"))
            .transpose()?;

        let record = self.store.load(key).await?;
        let status = self.derive_status(key, record.as_ref(), now);
        let ended = matches!(status, CycleStatus::Finished | CycleStatus::Confirmed);
        let confirmed = status == CycleStatus::Confirmed;
        if !ended || (confirmed && invoices.is_none()) {
            return Err(AppError::cycle_state(
                key,
                format!("can't confirm while {}", status),
            ));
        }

        let operation = self
            .store
            .begin_operation(CycleOperation::Confirm, Some(key), now)
            .await?;
        let job = CycleJob::Confirm {
            key,
            invoices,
            operation,
        };
        if let Err(e) = self.launcher.launch(job).await {
            self.store.finish_operation(operation, now).await?;
            return Err(e);
        }
        info!("Confirmation {} of {} launched", operation, key);
        Ok(operation)
    }

    /// Record the outcome of a confirmation job
    pub async fn complete_confirmation(
        &self,
        key: PeriodKey,
        invoices: Option<&[i64]>,
        operation: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<CycleRecord> {
        let record = self.store.mark_confirmed(key, invoices, now).await?;
        self.store.finish_operation(operation, now).await?;
        Ok(record)
    }

    /// Charging is blocked while a confirmation or another charge runs
    pub async fn is_charge_allowed(&self) -> AppResult<bool> {
        let in_flight = self
            .store
            .operations_in_flight(&[CycleOperation::Confirm, CycleOperation::Charge])
            .await?;
        Ok(in_flight == 0)
    }

    /// Launch charging of all accounts, or of `accounts`
    #[instrument(skip(self))]
    pub async fn charge(&self, accounts: Option<&[i64]>, now: DateTime<Utc>) -> AppResult<Uuid> {
        let accounts = accounts
            .map(|ids| positive_ids(ids, "account"))
            .transpose()?;
        if !self.is_charge_allowed().await? {
            return Err(AppError::cycle_state(
                "charge",
                "a confirmation or charge is still in progress",
            ));
        }

        let operation = self
            .store
            .begin_operation(CycleOperation::Charge, None, now)
            .await?;
        if let Err(e) = self
            .launcher
            .launch(CycleJob::Charge {
                accounts,
                operation,
            })
            .await
        {
            self.store.finish_operation(operation, now).await?;
            return Err(e);
        }
        Ok(operation)
    }

    pub async fn finish_operation(&self, operation: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        self.store.finish_operation(operation, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_calendar_first_of_month() {
        let cal = MonthlyCalendar::default();
        let key = cal.key_for(at(2024, 3, 15));
        assert_eq!(key.to_string(), "202403");
        assert_eq!(cal.start_time(key), Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(cal.end_time(key), Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_calendar_charging_day() {
        let cal = MonthlyCalendar::new(25);
        assert_eq!(cal.key_for(at(2024, 3, 24)).to_string(), "202402");
        assert_eq!(cal.key_for(at(2024, 3, 25)).to_string(), "202403");

        let jan = cal.key_for(at(2024, 1, 3));
        assert_eq!(jan.to_string(), "202312");
        assert_eq!(cal.end_time(jan), Utc.with_ymd_and_hms(2024, 1, 25, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_calendar_clamps_day() {
        assert_eq!(MonthlyCalendar::new(31).charging_day(), 28);
        assert_eq!(MonthlyCalendar::new(0).charging_day(), 1);
    }

    #[tokio::test]
    async fn test_channel_launcher() {
        let (launcher, mut jobs) = ChannelJobLauncher::new();
        let key = PeriodKey::new(2024, 1).unwrap();
        launcher
            .launch(CycleJob::Aggregate {
                key,
                accounts: None,
            })
            .await
            .unwrap();

        assert_eq!(
            jobs.recv().await,
            Some(CycleJob::Aggregate {
                key,
                accounts: None
            })
        );

        drop(jobs);
        assert!(launcher
            .launch(CycleJob::Aggregate {
                key,
                accounts: None
            })
            .await
            .is_err());
    }
}
