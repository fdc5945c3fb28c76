//! Group allocation
//!
//! Splits a requested amount across an ordered list of quota providers (plan
//! groups first, then the groups of each active service) and reports what is
//! left to be billed out of group.
//!
//! Every entry records both the amount consumed in the provider's own unit
//! and the part of the request it covers in the request's unit, so the
//! covered amounts plus the remainder always add up to the request exactly,
//! even across volume/cost conversions.

use crate::rating::RateResolver;
use rust_decimal::Decimal;
use tariffa_core::models::{BalanceType, LedgerEntry, Tariff};
use uuid::Uuid;

/// Amount to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub balance_type: BalanceType,
    pub amount: Decimal,
}

impl Requirement {
    pub fn volume(amount: Decimal) -> Self {
        Self {
            balance_type: BalanceType::Usagev,
            amount,
        }
    }

    pub fn cost(amount: Decimal) -> Self {
        Self {
            balance_type: BalanceType::Cost,
            amount,
        }
    }
}

/// One quota pool, with its remaining quota already read from its balance
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaProvider {
    pub name: String,
    pub balance_type: BalanceType,
    pub remaining: Decimal,
    pub ceiling: Option<Decimal>,
    pub balance_id: Uuid,
}

/// Result of an allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub entries: Vec<LedgerEntry>,
    /// Uncovered part of the request, in the request's unit
    pub remainder: Decimal,
}

impl Allocation {
    pub fn covered(&self) -> Decimal {
        self.entries.iter().map(|e| e.covered).sum()
    }

    pub fn is_in_group(&self) -> bool {
        self.remainder.is_zero() && !self.entries.is_empty()
    }
}

/// Allocates usage across quota providers
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupAllocator {
    resolver: RateResolver,
}

impl GroupAllocator {
    pub fn new(resolver: RateResolver) -> Self {
        Self { resolver }
    }

    /// Convert `amount` from one unit to another under `tariff`
    fn convert(&self, tariff: &Tariff, amount: Decimal, from: BalanceType, to: BalanceType) -> Decimal {
        match (from, to) {
            (BalanceType::Usagev, BalanceType::Cost) => self.resolver.price(tariff, amount),
            (BalanceType::Cost, BalanceType::Usagev) => self.resolver.volume_for_cost(tariff, amount),
            _ => amount,
        }
    }

    /// Allocate `required` across `providers`, visiting each once in order
    pub fn allocate(
        &self,
        tariff: &Tariff,
        required: Requirement,
        providers: &[QuotaProvider],
    ) -> Allocation {
        let mut outstanding = required.amount.max(Decimal::ZERO);
        let mut entries = Vec::new();

        for provider in providers {
            if outstanding <= Decimal::ZERO {
                break;
            }
            if provider.remaining <= Decimal::ZERO {
                continue;
            }

            let available = self.convert(
                tariff,
                provider.remaining,
                provider.balance_type,
                required.balance_type,
            );
            if available <= Decimal::ZERO {
                continue;
            }

            if outstanding <= available {
                let amount = self
                    .convert(tariff, outstanding, required.balance_type, provider.balance_type)
                    .min(provider.remaining);
                entries.push(LedgerEntry {
                    group: provider.name.clone(),
                    balance_type: provider.balance_type,
                    amount,
                    covered: outstanding,
                    left: provider.remaining - amount,
                    total: provider.ceiling,
                    balance_id: provider.balance_id,
                });
                outstanding = Decimal::ZERO;
            } else {
                entries.push(LedgerEntry {
                    group: provider.name.clone(),
                    balance_type: provider.balance_type,
                    amount: provider.remaining,
                    covered: available,
                    left: Decimal::ZERO,
                    total: provider.ceiling,
                    balance_id: provider.balance_id,
                });
                outstanding -= available;
            }
        }

        Allocation {
            entries,
            remainder: outstanding,
        }
    }
}
