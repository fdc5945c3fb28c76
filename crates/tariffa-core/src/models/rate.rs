//! Rate model
//!
//! A rate maps each usage type to a tariff, either flat or overridden per
//! plan. Tariffs are tier tables walked in ascending order.

use crate::models::UsageType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plan key of the fallback tariff in a per-plan rate entry
pub const BASE_TARIFF: &str = "BASE";

/// One tier of a tariff
///
/// `to` is the volume the tier spans, `interval` the billing increment and
/// `price` the price of one increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffTier {
    pub to: Decimal,
    pub interval: Decimal,
    pub price: Decimal,
    /// Round partial increments up (default) or charge them proportionally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceil: Option<bool>,
}

impl TariffTier {
    pub fn new(to: Decimal, interval: Decimal, price: Decimal) -> Self {
        Self {
            to,
            interval,
            price,
            ceil: None,
        }
    }

    pub fn rounds_up(&self) -> bool {
        self.ceil.unwrap_or(true)
    }
}

/// Ordered tier table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tariff {
    pub rate: Vec<TariffTier>,
}

impl Tariff {
    pub fn new(rate: Vec<TariffTier>) -> Self {
        Self { rate }
    }

    /// Single unbounded tier
    pub fn flat(interval: Decimal, price: Decimal) -> Self {
        Self::new(vec![TariffTier::new(Decimal::MAX, interval, price)])
    }
}

/// Tariff definition for one usage type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateEntry {
    Flat(Tariff),
    PerPlan(BTreeMap<String, Tariff>),
}

/// Rate definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub key: String,
    pub rates: BTreeMap<UsageType, RateEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billable: Option<bool>,
}

impl Rate {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rates: BTreeMap::new(),
            billable: None,
        }
    }

    /// Add a flat tariff for a usage type
    pub fn with_tariff(mut self, usage_type: UsageType, tariff: Tariff) -> Self {
        self.rates.insert(usage_type, RateEntry::Flat(tariff));
        self
    }

    /// Add a per-plan tariff for a usage type
    pub fn with_plan_tariff(
        mut self,
        usage_type: UsageType,
        plan: impl Into<String>,
        tariff: Tariff,
    ) -> Self {
        let entry = self
            .rates
            .entry(usage_type)
            .or_insert_with(|| RateEntry::PerPlan(BTreeMap::new()));
        if let RateEntry::Flat(existing) = entry {
            let mut plans = BTreeMap::new();
            plans.insert(BASE_TARIFF.to_string(), existing.clone());
            *entry = RateEntry::PerPlan(plans);
        }
        if let RateEntry::PerPlan(plans) = entry {
            plans.insert(plan.into(), tariff);
        }
        self
    }

    pub fn is_billable(&self) -> bool {
        self.billable.unwrap_or(true)
    }
}
