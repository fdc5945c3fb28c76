//! Billing cycle model
//!
//! Periods are identified by a `YYYYMM` key. The persisted `CycleRecord` only
//! holds markers and counters; the lifecycle status is always derived.

use crate::error::AppError;
use crate::AppResult;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Billing period identifier (`YYYYMM`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey(u32);

impl PeriodKey {
    /// Years a period key can represent
    pub const YEARS: std::ops::RangeInclusive<i32> = 1970..=9999;

    pub fn new(year: i32, month: u32) -> AppResult<Self> {
        if !(1..=12).contains(&month) || !Self::YEARS.contains(&year) {
            return Err(AppError::InvalidPeriodKey(format!("{:04}{:02}", year, month)));
        }
        Ok(Self(year as u32 * 100 + month))
    }

    /// Key of the calendar month containing `at`, clamped to the
    /// representable years
    pub fn of_month(at: DateTime<Utc>) -> Self {
        let year = at.year().clamp(*Self::YEARS.start(), *Self::YEARS.end());
        Self(year as u32 * 100 + at.month())
    }

    pub fn year(&self) -> i32 {
        (self.0 / 100) as i32
    }

    pub fn month(&self) -> u32 {
        self.0 % 100
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Following period; the last representable period is its own successor
    pub fn succ(&self) -> Self {
        if self.month() == 12 && self.year() >= *Self::YEARS.end() {
            *self
        } else if self.month() == 12 {
            Self((self.year() as u32 + 1) * 100 + 1)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Preceding period; the first representable period is its own predecessor
    pub fn pred(&self) -> Self {
        if self.month() == 1 && self.year() <= *Self::YEARS.start() {
            *self
        } else if self.month() == 1 {
            Self((self.year() as u32 - 1) * 100 + 12)
        } else {
            Self(self.0 - 1)
        }
    }
}

impl FromStr for PeriodKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 6 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::InvalidPeriodKey(s.to_string()));
        }
        let year: i32 = s[..4]
            .parse()
            .map_err(|_| AppError::InvalidPeriodKey(s.to_string()))?;
        let month: u32 = s[4..]
            .parse()
            .map_err(|_| AppError::InvalidPeriodKey(s.to_string()))?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<u32> for PeriodKey {
    type Error = AppError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new((value / 100) as i32, value % 100)
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year(), self.month())
    }
}

/// Derived lifecycle status of a period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Future,
    Current,
    ToRun,
    Running,
    Finished,
    Confirmed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Future => "future",
            CycleStatus::Current => "current",
            CycleStatus::ToRun => "to_run",
            CycleStatus::Running => "running",
            CycleStatus::Finished => "finished",
            CycleStatus::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted markers of a period run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub key: PeriodKey,
    pub running: bool,
    pub confirmed: bool,
    pub batches_total: u32,
    pub batches_done: u32,
    #[serde(default)]
    pub confirmed_invoices: BTreeSet<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl CycleRecord {
    pub fn started(key: PeriodKey, batches_total: u32, at: DateTime<Utc>) -> Self {
        Self {
            key,
            running: true,
            confirmed: false,
            batches_total,
            batches_done: 0,
            confirmed_invoices: BTreeSet::new(),
            started_at: Some(at),
            finished_at: None,
            confirmed_at: None,
        }
    }

    /// Completed batches in percent, 0 when nothing was scheduled
    pub fn completion_percentage(&self) -> Decimal {
        if self.batches_total == 0 {
            return Decimal::ZERO;
        }
        let pct = Decimal::from(self.batches_done) * Decimal::ONE_HUNDRED
            / Decimal::from(self.batches_total);
        pct.min(Decimal::ONE_HUNDRED).round_dp(2)
    }

    pub fn is_complete(&self) -> bool {
        self.batches_total > 0 && self.batches_done >= self.batches_total
    }

    /// Record one finished aggregation batch
    pub fn complete_batch(&mut self, at: DateTime<Utc>) {
        if self.batches_done < self.batches_total {
            self.batches_done += 1;
        }
        if self.is_complete() {
            self.running = false;
            self.finished_at.get_or_insert(at);
        }
    }

    /// Record a confirmation; `None` confirms the whole period
    pub fn confirm(&mut self, invoices: Option<&[i64]>, at: DateTime<Utc>) {
        match invoices {
            Some(ids) => self.confirmed_invoices.extend(ids.iter().copied()),
            None => {
                self.confirmed = true;
                self.confirmed_at = Some(at);
            }
        }
    }
}

/// Long-running operations that gate each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOperation {
    Aggregate,
    Confirm,
    Charge,
}

impl CycleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOperation::Aggregate => "aggregate",
            CycleOperation::Confirm => "confirm",
            CycleOperation::Charge => "charge",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "aggregate" => Some(CycleOperation::Aggregate),
            "confirm" => Some(CycleOperation::Confirm),
            "charge" => Some(CycleOperation::Charge),
            _ => None,
        }
    }
}

/// Job handed to the external orchestration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum CycleJob {
    Aggregate {
        key: PeriodKey,
        accounts: Option<Vec<i64>>,
    },
    Confirm {
        key: PeriodKey,
        invoices: Option<Vec<i64>>,
        operation: Uuid,
    },
    Charge {
        accounts: Option<Vec<i64>>,
        operation: Uuid,
    },
}

/// Summary of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub key: PeriodKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: CycleStatus,
    pub completion_percentage: Decimal,
    pub confirmation_percentage: Option<Decimal>,
}
