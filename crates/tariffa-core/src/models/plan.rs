//! Plan and service models
//!
//! Plans select the charging policy and carry the ordered entity groups
//! (shared quota pools) a subscriber consumes before paying out of group.
//! Services are add-ons with groups of their own.

use crate::error::AppError;
use crate::models::{BalanceType, UsageType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Charging policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChargingType {
    #[default]
    Postpaid,
    Prepaid,
}

/// Ceiling of an entity group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCeiling {
    /// Volume allowance per usage type
    Volume(BTreeMap<UsageType, Decimal>),
    /// Monetary allowance shared by all member rates
    Cost(Decimal),
}

/// Shared quota pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityGroup {
    pub name: String,
    /// Member rate keys
    pub rates: Vec<String>,
    pub ceiling: GroupCeiling,
    /// The group lives on the account-level (sid 0) balance
    #[serde(default)]
    pub account_shared: bool,
}

impl EntityGroup {
    /// Whether this group can absorb usage of `usage_type` on `rate_key`
    pub fn covers(&self, rate_key: &str, usage_type: UsageType) -> bool {
        if !self.rates.iter().any(|r| r == rate_key) {
            return false;
        }
        match &self.ceiling {
            GroupCeiling::Volume(limits) => limits.contains_key(&usage_type),
            GroupCeiling::Cost(_) => true,
        }
    }

    pub fn balance_type(&self) -> BalanceType {
        match self.ceiling {
            GroupCeiling::Volume(_) => BalanceType::Usagev,
            GroupCeiling::Cost(_) => BalanceType::Cost,
        }
    }

    /// Configured ceiling for `usage_type`, in the group's balance type
    pub fn ceiling_for(&self, usage_type: UsageType) -> Option<Decimal> {
        match &self.ceiling {
            GroupCeiling::Volume(limits) => limits.get(&usage_type).copied(),
            GroupCeiling::Cost(amount) => Some(*amount),
        }
    }

    fn check(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("Group name is required".to_string()));
        }
        let negative = match &self.ceiling {
            GroupCeiling::Volume(limits) => limits.values().any(|v| v.is_sign_negative()),
            GroupCeiling::Cost(amount) => amount.is_sign_negative(),
        };
        if negative {
            return Err(AppError::Validation(format!(
                "Group {} has a negative ceiling",
                self.name
            )));
        }
        Ok(())
    }
}

/// Iterate the groups covering a rate and usage type, in configured order
fn covering<'a>(
    groups: &'a [EntityGroup],
    rate_key: &'a str,
    usage_type: UsageType,
) -> impl Iterator<Item = &'a EntityGroup> + 'a {
    groups
        .iter()
        .filter(move |g| g.covers(rate_key, usage_type))
}

fn effective_at(from: DateTime<Utc>, to: Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    at >= from && to.map_or(true, |end| at < end)
}

/// Subscriber plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub charging: ChargingType,
    pub from: DateTime<Utc>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub groups: Vec<EntityGroup>,
}

impl Plan {
    pub fn is_prepaid(&self) -> bool {
        self.charging == ChargingType::Prepaid
    }

    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        effective_at(self.from, self.to, at)
    }

    pub fn groups_for<'a>(
        &'a self,
        rate_key: &'a str,
        usage_type: UsageType,
    ) -> impl Iterator<Item = &'a EntityGroup> + 'a {
        covering(&self.groups, rate_key, usage_type)
    }

    /// The first group covering the rate decides whether the balance is shared
    pub fn is_account_shared(&self, rate_key: &str, usage_type: UsageType) -> bool {
        self.groups_for(rate_key, usage_type)
            .next()
            .map_or(false, |g| g.account_shared)
    }

    /// Validate plan data
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("Plan name is required".to_string()));
        }
        if let Some(to) = self.to {
            if to <= self.from {
                return Err(AppError::Validation(format!(
                    "Plan {} ends before it starts",
                    self.name
                )));
            }
        }
        self.groups.iter().try_for_each(EntityGroup::check)
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            name: String::new(),
            charging: ChargingType::Postpaid,
            from: DateTime::<Utc>::MIN_UTC,
            to: None,
            groups: Vec::new(),
        }
    }
}

/// Add-on service with its own groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub from: DateTime<Utc>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub groups: Vec<EntityGroup>,
}

impl Service {
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        effective_at(self.from, self.to, at)
    }

    pub fn groups_for<'a>(
        &'a self,
        rate_key: &'a str,
        usage_type: UsageType,
    ) -> impl Iterator<Item = &'a EntityGroup> + 'a {
        covering(&self.groups, rate_key, usage_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn minutes_group(shared: bool) -> EntityGroup {
        let mut limits = BTreeMap::new();
        limits.insert(UsageType::Call, dec!(600));
        EntityGroup {
            name: "MINUTES".to_string(),
            rates: vec!["LOCAL".to_string()],
            ceiling: GroupCeiling::Volume(limits),
            account_shared: shared,
        }
    }

    #[test]
    fn test_group_covers() {
        let group = minutes_group(false);
        assert!(group.covers("LOCAL", UsageType::Call));
        assert!(!group.covers("LOCAL", UsageType::Data));
        assert!(!group.covers("INTL", UsageType::Call));
        assert_eq!(group.balance_type(), BalanceType::Usagev);
        assert_eq!(group.ceiling_for(UsageType::Call), Some(dec!(600)));
    }

    #[test]
    fn test_cost_group_covers_any_usage() {
        let group = EntityGroup {
            name: "WALLET".to_string(),
            rates: vec!["LOCAL".to_string()],
            ceiling: GroupCeiling::Cost(dec!(50)),
            account_shared: false,
        };
        assert!(group.covers("LOCAL", UsageType::Data));
        assert_eq!(group.balance_type(), BalanceType::Cost);
    }

    #[test]
    fn test_plan_account_shared() {
        let plan = Plan {
            name: "FAMILY".to_string(),
            groups: vec![minutes_group(true)],
            ..Default::default()
        };
        assert!(plan.is_account_shared("LOCAL", UsageType::Call));
        assert!(!plan.is_account_shared("INTL", UsageType::Call));
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = Plan {
            name: "BASIC".to_string(),
            groups: vec![minutes_group(false)],
            ..Default::default()
        };
        assert!(plan.validate().is_ok());

        plan.groups[0].ceiling = GroupCeiling::Cost(dec!(-1));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_ceiling_serde() {
        let json = r#"{"name":"G","rates":["LOCAL"],"ceiling":{"volume":{"call":"600"}}}"#;
        let group: EntityGroup = serde_json::from_str(json).unwrap();
        assert_eq!(group.ceiling_for(UsageType::Call), Some(dec!(600)));
        assert!(!group.account_shared);
    }
}
