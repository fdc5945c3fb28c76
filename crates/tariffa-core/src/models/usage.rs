//! Usage event model
//!
//! A usage event is one rating request: a call leg, a data session chunk, an
//! SMS, a credit or a service charge. Events are immutable for the engine;
//! everything the engine derives ends up in a `PricingResult`.

use crate::error::AppError;
use crate::models::{LedgerEntry, PeriodKey, PricingResult};
use crate::AppResult;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// Largest volume, offset or price magnitude an event may carry
pub const MAX_EVENT_QUANTITY: i64 = 1_000_000_000_000;

/// Kind of usage being rated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
    Call,
    Sms,
    Data,
    Credit,
    Service,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::Call => "call",
            UsageType::Sms => "sms",
            UsageType::Data => "data",
            UsageType::Credit => "credit",
            UsageType::Service => "service",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "call" => Some(UsageType::Call),
            "sms" => Some(UsageType::Sms),
            "data" => Some(UsageType::Data),
            "credit" => Some(UsageType::Credit),
            "service" => Some(UsageType::Service),
            _ => None,
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position of a real-time record within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Start,
    Update,
    Final,
}

/// Usage event submitted for rating
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UsageEvent {
    /// Unique event stamp, the idempotence key of the balance transaction log
    #[validate(length(min = 1, max = 128, message = "Event stamp is required"))]
    pub stamp: String,

    /// Subscriber id
    pub sid: i64,

    /// Account id
    #[validate(range(min = 1, message = "Account id must be positive"))]
    pub aid: i64,

    pub usage_type: UsageType,

    /// Requested volume (seconds, bytes, messages or units)
    pub volume: Decimal,

    /// Rate key
    #[validate(length(min = 1, message = "Rate reference is required"))]
    pub rate_ref: String,

    /// Plan name
    #[validate(length(min = 1, message = "Plan name is required"))]
    pub plan: String,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub realtime: bool,

    #[serde(default)]
    pub record_type: Option<RecordType>,

    #[serde(default)]
    pub request_type: Option<i32>,

    /// Event time
    pub urt: DateTime<Utc>,

    /// Active service names, in the order their groups are consumed
    #[serde(default)]
    pub services: Vec<String>,

    /// Price computed upstream; the engine charges it as is
    #[serde(default)]
    pub preprice: Option<Decimal>,

    /// Volume already consumed earlier in the same session
    #[serde(default)]
    pub call_offset: Decimal,

    /// Actual usage reported by the session, used to rebalance earlier grants
    #[serde(default)]
    pub reported_usage: Option<Decimal>,

    /// Internal rebalance operation (never granted volume)
    #[serde(default)]
    pub rebalance: bool,

    /// Price without committing anything
    #[serde(default)]
    pub pretend: bool,

    /// Force free-line handling regardless of the configured policy
    #[serde(default)]
    pub free_line: bool,
}

impl UsageEvent {
    /// Validate field constraints and volume sign
    pub fn check(&self) -> AppResult<()> {
        self.validate()?;
        if self.volume.is_sign_negative() && self.usage_type != UsageType::Credit {
            return Err(AppError::InvalidInput(format!(
                "Negative volume {} is only allowed for credit events",
                self.volume
            )));
        }
        if self.call_offset.is_sign_negative() {
            return Err(AppError::InvalidInput(format!(
                "Negative call offset {}",
                self.call_offset
            )));
        }

        let limit = Decimal::from(MAX_EVENT_QUANTITY);
        let quantities = [
            ("volume", Some(self.volume)),
            ("call_offset", Some(self.call_offset)),
            ("reported_usage", self.reported_usage),
            ("preprice", self.preprice),
        ];
        for (field, value) in quantities {
            if let Some(value) = value.filter(|v| v.abs() > limit) {
                return Err(AppError::InvalidInput(format!(
                    "{} {} exceeds {}",
                    field, value, limit
                )));
            }
        }

        if !PeriodKey::YEARS.contains(&self.urt.year()) {
            return Err(AppError::InvalidInput(format!(
                "Event time {} is outside the supported years",
                self.urt
            )));
        }
        Ok(())
    }

    pub fn is_prepriced(&self) -> bool {
        self.preprice.is_some()
    }

    pub fn is_final(&self) -> bool {
        self.record_type == Some(RecordType::Final)
    }

    pub fn is_request_type(&self, code: i32) -> bool {
        self.request_type == Some(code)
    }
}

impl Default for UsageEvent {
    fn default() -> Self {
        Self {
            stamp: String::new(),
            sid: 0,
            aid: 0,
            usage_type: UsageType::Call,
            volume: Decimal::ZERO,
            rate_ref: String::new(),
            plan: String::new(),
            session_id: None,
            realtime: false,
            record_type: None,
            request_type: None,
            urt: Utc::now(),
            services: Vec::new(),
            preprice: None,
            call_offset: Decimal::ZERO,
            reported_usage: None,
            rebalance: false,
            pretend: false,
            free_line: false,
        }
    }
}

/// Correction field prefix applied to rebalanced lines
pub const REBALANCE_PREFIX: &str = "rebalance_";

/// A priced line as persisted by the downstream unify stage
///
/// Lines are never rewritten after the fact. Rebalancing appends additive
/// deltas to `corrections` under `rebalance_<field>` keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricedLine {
    pub id: Uuid,
    pub stamp: String,
    pub sid: i64,
    pub aid: i64,
    pub session_id: Option<String>,
    pub usage_type: UsageType,
    pub rate_ref: String,
    pub plan: String,
    pub urt: DateTime<Utc>,
    pub usagev: Decimal,
    pub aprice: Decimal,
    pub balance_ref: Option<Uuid>,
    pub in_group: Option<Decimal>,
    pub out_group: Option<Decimal>,
    /// Group consumption behind `in_group`, in allocation order
    #[serde(default)]
    pub arategroups: Vec<LedgerEntry>,
    #[serde(default)]
    pub corrections: BTreeMap<String, Decimal>,
}

impl PricedLine {
    /// Build the line the unify stage would persist for a priced event
    pub fn from_event(event: &UsageEvent, result: &PricingResult) -> Self {
        let nonzero = |v: Decimal| if v.is_zero() { None } else { Some(v) };
        Self {
            id: Uuid::new_v4(),
            stamp: event.stamp.clone(),
            sid: event.sid,
            aid: event.aid,
            session_id: event.session_id.clone(),
            usage_type: event.usage_type,
            rate_ref: event.rate_ref.clone(),
            plan: event.plan.clone(),
            urt: event.urt,
            usagev: result.usagev,
            aprice: result.aprice,
            balance_ref: result.balance_ref,
            in_group: nonzero(result.in_group),
            out_group: nonzero(result.out_group + result.over_group),
            arategroups: result.arategroups.clone(),
            corrections: BTreeMap::new(),
        }
    }

    pub fn correction(&self, field: &str) -> Decimal {
        self.corrections
            .get(&format!("{}{}", REBALANCE_PREFIX, field))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Usage volume including rebalance corrections
    pub fn effective_usagev(&self) -> Decimal {
        self.usagev + self.correction("usagev")
    }

    /// Add deltas to the correction map
    pub fn apply_corrections(&mut self, deltas: &BTreeMap<String, Decimal>) {
        for (field, delta) in deltas {
            *self.corrections.entry(field.clone()).or_insert(Decimal::ZERO) += *delta;
        }
    }
}
