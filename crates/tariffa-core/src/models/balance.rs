//! Balance model
//!
//! A balance is the mutable ledger document of one subscriber (or of the
//! account when `sid == 0`) for one billing period. It accumulates totals per
//! usage type and per entity group, the aggregate cost, and a transaction log
//! keyed by event stamp used for idempotent crash recovery.

use crate::models::{ChargingType, EntityGroup, PeriodKey, PricingResult, UsageType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Subscriber id of account-level shared balances
pub const SHARED_SID: i64 = 0;

/// Unit a quota is tracked in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceType {
    Usagev,
    Cost,
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceType::Usagev => write!(f, "usagev"),
            BalanceType::Cost => write!(f, "cost"),
        }
    }
}

/// Accumulated usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default)]
    pub usagev: Decimal,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub count: i64,
}

impl Totals {
    pub fn amount(&self, balance_type: BalanceType) -> Decimal {
        match balance_type {
            BalanceType::Usagev => self.usagev,
            BalanceType::Cost => self.cost,
        }
    }
}

/// Prepaid allowance loaded on a balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allowance {
    pub balance_type: BalanceType,
    pub amount: Decimal,
    /// Restrict a volume allowance to one usage type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_type: Option<UsageType>,
}

/// Identity of a balance document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub sid: i64,
    pub aid: i64,
    pub period: PeriodKey,
}

impl BalanceKey {
    pub fn new(sid: i64, aid: i64, period: PeriodKey) -> Self {
        Self { sid, aid, period }
    }

    pub fn shared(aid: i64, period: PeriodKey) -> Self {
        Self::new(SHARED_SID, aid, period)
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid={} aid={} period={}", self.sid, self.aid, self.period)
    }
}

/// The mutable part of a balance, compared on conditioned updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub totals: BTreeMap<UsageType, Totals>,
    pub groups: BTreeMap<String, Totals>,
    pub cost: Decimal,
}

impl BalanceSnapshot {
    /// Snapshot after applying `update`
    pub fn applied(&self, update: &BalanceUpdate) -> BalanceSnapshot {
        let mut next = self.clone();
        if let Some(usage_type) = update.usage_type {
            let totals = next.totals.entry(usage_type).or_default();
            totals.usagev += update.usagev;
            totals.cost += update.cost;
            totals.count += update.count;
            next.cost += update.cost;
        }
        for charge in &update.groups {
            let totals = next.groups.entry(charge.group.clone()).or_default();
            match charge.balance_type {
                BalanceType::Usagev => totals.usagev += charge.amount,
                BalanceType::Cost => totals.cost += charge.amount,
            }
            totals.count += update.count;
        }
        next
    }
}

/// Consumption of one group on a balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCharge {
    pub group: String,
    pub balance_type: BalanceType,
    pub amount: Decimal,
}

/// Delta written to a balance by one conditioned update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceUpdate {
    /// Usage totals to bump; `None` for group-only updates on shared balances
    pub usage_type: Option<UsageType>,
    pub usagev: Decimal,
    pub cost: Decimal,
    pub count: i64,
    pub groups: Vec<GroupCharge>,
    /// Transaction log entry appended in the same write
    pub tx: Option<(String, PricingResult)>,
}

/// Balance document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub id: Uuid,
    pub sid: i64,
    pub aid: i64,
    pub period: PeriodKey,
    #[serde(default)]
    pub charging: ChargingType,
    #[serde(default)]
    pub totals: BTreeMap<UsageType, Totals>,
    #[serde(default)]
    pub groups: BTreeMap<String, Totals>,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub allowance: Option<Allowance>,
    #[serde(default)]
    pub tx: BTreeMap<String, PricingResult>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(key: BalanceKey, charging: ChargingType) -> Self {
        Self {
            id: Uuid::new_v4(),
            sid: key.sid,
            aid: key.aid,
            period: key.period,
            charging,
            totals: BTreeMap::new(),
            groups: BTreeMap::new(),
            cost: Decimal::ZERO,
            allowance: None,
            tx: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_allowance(mut self, balance_type: BalanceType, amount: Decimal) -> Self {
        self.allowance = Some(Allowance {
            balance_type,
            amount,
            usage_type: None,
        });
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.sid, self.aid, self.period)
    }

    pub fn is_shared(&self) -> bool {
        self.sid == SHARED_SID
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            totals: self.totals.clone(),
            groups: self.groups.clone(),
            cost: self.cost,
        }
    }

    /// Previously applied result for an event stamp
    pub fn tx_entry(&self, stamp: &str) -> Option<&PricingResult> {
        self.tx.get(stamp)
    }

    pub fn usage_totals(&self, usage_type: UsageType) -> Totals {
        self.totals.get(&usage_type).cloned().unwrap_or_default()
    }

    /// Remaining quota of `group` for `usage_type` on this balance
    pub fn group_remaining(&self, group: &EntityGroup, usage_type: UsageType) -> Decimal {
        let ceiling = group.ceiling_for(usage_type).unwrap_or(Decimal::ZERO);
        let used = self
            .groups
            .get(&group.name)
            .map(|t| t.amount(group.balance_type()))
            .unwrap_or(Decimal::ZERO);
        (ceiling - used).max(Decimal::ZERO)
    }

    /// Whether the allowance is tracked in volume for `usage_type`
    pub fn tracks_volume(&self, usage_type: UsageType) -> bool {
        matches!(
            &self.allowance,
            Some(a) if a.balance_type == BalanceType::Usagev
                && a.usage_type.map_or(true, |u| u == usage_type)
        )
    }

    /// Remaining prepaid allowance; `None` when the balance is unlimited for `usage_type`
    pub fn remaining_allowance(&self, usage_type: UsageType) -> Option<(BalanceType, Decimal)> {
        let allowance = self.allowance.as_ref()?;
        if allowance.usage_type.map_or(false, |u| u != usage_type) {
            return None;
        }
        let used = match allowance.balance_type {
            BalanceType::Usagev => self.usage_totals(usage_type).usagev,
            BalanceType::Cost => self.cost,
        };
        Some((allowance.balance_type, allowance.amount - used))
    }

    /// Apply an update in place, the way a store persists it
    pub fn apply(&mut self, update: &BalanceUpdate) {
        let next = self.snapshot().applied(update);
        self.totals = next.totals;
        self.groups = next.groups;
        self.cost = next.cost;
        if let Some((stamp, result)) = &update.tx {
            self.tx.insert(stamp.clone(), result.clone());
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupCeiling;
    use rust_decimal_macros::dec;

    fn balance() -> Balance {
        let period = PeriodKey::new(2024, 3).unwrap();
        Balance::new(BalanceKey::new(7, 1, period), ChargingType::Prepaid)
    }

    fn group() -> EntityGroup {
        let mut limits = BTreeMap::new();
        limits.insert(UsageType::Call, dec!(600));
        EntityGroup {
            name: "MINUTES".to_string(),
            rates: vec!["LOCAL".to_string()],
            ceiling: GroupCeiling::Volume(limits),
            account_shared: false,
        }
    }

    #[test]
    fn test_apply_update() {
        let mut b = balance();
        b.apply(&BalanceUpdate {
            usage_type: Some(UsageType::Call),
            usagev: dec!(120),
            cost: dec!(2.5),
            count: 1,
            groups: vec![GroupCharge {
                group: "MINUTES".to_string(),
                balance_type: BalanceType::Usagev,
                amount: dec!(100),
            }],
            tx: Some(("ev-1".to_string(), PricingResult::default())),
        });

        assert_eq!(b.usage_totals(UsageType::Call).usagev, dec!(120));
        assert_eq!(b.usage_totals(UsageType::Call).count, 1);
        assert_eq!(b.cost, dec!(2.5));
        assert_eq!(b.group_remaining(&group(), UsageType::Call), dec!(500));
        assert!(b.tx_entry("ev-1").is_some());
    }

    #[test]
    fn test_remaining_allowance() {
        let mut b = balance().with_allowance(BalanceType::Usagev, dec!(300));
        assert_eq!(
            b.remaining_allowance(UsageType::Call),
            Some((BalanceType::Usagev, dec!(300)))
        );

        b.apply(&BalanceUpdate {
            usage_type: Some(UsageType::Call),
            usagev: dec!(100),
            count: 1,
            ..Default::default()
        });
        assert_eq!(
            b.remaining_allowance(UsageType::Call),
            Some((BalanceType::Usagev, dec!(200)))
        );
        assert!(b.tracks_volume(UsageType::Call));

        let wallet = balance().with_allowance(BalanceType::Cost, dec!(10));
        assert!(!wallet.tracks_volume(UsageType::Call));
        assert!(balance().remaining_allowance(UsageType::Call).is_none());
    }

    #[test]
    fn test_snapshot_changes_on_update() {
        let b = balance();
        let before = b.snapshot();
        let after = before.applied(&BalanceUpdate {
            usage_type: Some(UsageType::Sms),
            usagev: dec!(1),
            count: 1,
            ..Default::default()
        });
        assert_ne!(before, after);
    }
}
