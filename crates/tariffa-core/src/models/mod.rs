//! Domain models for Tariffa
//!
//! This module contains all the core domain models used throughout the application.

pub mod balance;
pub mod cycle;
pub mod ledger;
pub mod plan;
pub mod rate;
pub mod usage;

pub use balance::{
    Allowance, Balance, BalanceKey, BalanceSnapshot, BalanceType, BalanceUpdate, GroupCharge,
    Totals, SHARED_SID,
};
pub use cycle::{CycleInfo, CycleJob, CycleOperation, CycleRecord, CycleStatus, PeriodKey};
pub use ledger::{GrantedReturnCode, LedgerEntry, PricingResult};
pub use plan::{ChargingType, EntityGroup, GroupCeiling, Plan, Service};
pub use rate::{Rate, RateEntry, Tariff, TariffTier, BASE_TARIFF};
pub use usage::{
    PricedLine, RecordType, UsageEvent, UsageType, MAX_EVENT_QUANTITY, REBALANCE_PREFIX,
};
