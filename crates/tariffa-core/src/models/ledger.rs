//! Ledger entries and pricing results

use crate::models::BalanceType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Itemized consumption of one quota provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Provider (group) name
    pub group: String,
    pub balance_type: BalanceType,
    /// Consumed, in the provider's balance type
    pub amount: Decimal,
    /// Part of the requested amount this entry covers, in the requested type
    pub covered: Decimal,
    /// Quota left after consumption, in the provider's balance type
    pub left: Decimal,
    /// Configured ceiling
    pub total: Option<Decimal>,
    pub balance_id: Uuid,
}

/// Outcome code of a prepaid grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantedReturnCode {
    Ok,
    NoAvailableBalances,
}

/// Accumulated outcome of pricing one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    /// Priced volume (the granted volume for prepaid)
    pub usagev: Decimal,
    /// Charge
    pub aprice: Decimal,
    /// Volume covered by groups
    #[serde(default)]
    pub in_group: Decimal,
    /// Remainder after groups were partly used
    #[serde(default)]
    pub over_group: Decimal,
    /// Remainder when no group applied
    #[serde(default)]
    pub out_group: Decimal,
    #[serde(default)]
    pub arategroups: Vec<LedgerEntry>,
    #[serde(default)]
    pub balance_ref: Option<Uuid>,
    #[serde(default = "default_billable")]
    pub billable: bool,
    #[serde(default)]
    pub free_line: bool,
    #[serde(default)]
    pub granted_return_code: Option<GrantedReturnCode>,
    /// Session usage preceding this event, rebalance deltas included
    #[serde(default)]
    pub usage_offset: Decimal,
    /// Set once the balance write (or a recovered write) is known to be durable
    #[serde(skip)]
    pub tx_saved: bool,
}

fn default_billable() -> bool {
    true
}

impl PricingResult {
    /// Zero-volume, zero-charge result
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn flat(usagev: Decimal, aprice: Decimal) -> Self {
        Self {
            usagev,
            aprice,
            ..Default::default()
        }
    }

    /// Sum of the volume covered by ledger entries
    pub fn covered(&self) -> Decimal {
        self.arategroups.iter().map(|e| e.covered).sum()
    }
}

impl Default for PricingResult {
    fn default() -> Self {
        Self {
            usagev: Decimal::ZERO,
            aprice: Decimal::ZERO,
            in_group: Decimal::ZERO,
            over_group: Decimal::ZERO,
            out_group: Decimal::ZERO,
            arategroups: Vec::new(),
            balance_ref: None,
            billable: true,
            free_line: false,
            granted_return_code: None,
            usage_offset: Decimal::ZERO,
            tx_saved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tx_saved_not_serialized() {
        let mut result = PricingResult::flat(dec!(60), dec!(1.5));
        result.tx_saved = true;

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("tx_saved"));

        let back: PricingResult = serde_json::from_str(&json).unwrap();
        assert!(!back.tx_saved);
        assert_eq!(back.aprice, dec!(1.5));
    }
}
