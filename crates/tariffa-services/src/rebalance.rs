//! Rebalancing of real-time sessions
//!
//! Real-time sessions are charged for the volume granted up front. When a
//! later request reports that less was actually used, the difference is
//! credited back to the balance and the priced lines of the session receive
//! additive `rebalance_<field>` corrections. Lines are never rewritten.

use crate::rating::RateResolver;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tariffa_core::{
    config::PricingConfig,
    models::{
        BalanceUpdate, GroupCharge, LedgerEntry, PricedLine, PricingResult, UsageEvent, UsageType,
        REBALANCE_PREFIX,
    },
    traits::{BalanceStore, BalanceWrite, Catalog, LineStore, UpdateOutcome},
    AppError, AppResult,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Effect of one rebalance
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOutcome {
    /// Archived line the correction was attached to
    pub line_id: Uuid,
    pub balance_id: Uuid,
    /// Volume previously charged
    pub charged: Decimal,
    /// Volume actually used
    pub reported: Decimal,
    /// Volume credited back (negative)
    pub diff: Decimal,
    /// Charge credited back on the line (negative)
    pub cost_delta: Decimal,
    /// Live lines that received the correction
    pub live_lines: u64,
}

fn correction_field(field: &str) -> String {
    format!("{}{}", REBALANCE_PREFIX, field)
}

/// Split a credit into its out-of-group and in-group parts
///
/// The credit comes out of the out-of-group part first, then the in-group
/// part; neither is driven below zero.
fn split_credit(line: &PricedLine, diff: Decimal) -> (Decimal, Decimal) {
    let take = |left: Decimal, field: &str, value: Option<Decimal>| match value {
        Some(value) => {
            let current = value + line.correction(field);
            left.max(-current.max(Decimal::ZERO))
        }
        None => Decimal::ZERO,
    };

    let out_delta = take(diff, "out_group", line.out_group);
    let in_delta = take(diff - out_delta, "in_group", line.in_group);
    (out_delta, in_delta)
}

/// Correction deltas for an archived line
fn line_corrections(line: &PricedLine, diff: Decimal, cost_delta: Decimal) -> BTreeMap<String, Decimal> {
    let mut deltas = BTreeMap::new();
    deltas.insert(correction_field("usagev"), diff);
    deltas.insert(correction_field("aprice"), cost_delta);

    let (out_delta, in_delta) = split_credit(line, diff);
    if !out_delta.is_zero() {
        deltas.insert(correction_field("out_group"), out_delta);
    }
    if !in_delta.is_zero() {
        deltas.insert(correction_field("in_group"), in_delta);
    }
    deltas
}

/// Group charges returning `in_delta` (negative volume) to the groups that
/// covered the line, last-consumed group first
///
/// `already` is the in-group volume earlier rebalances returned. Charges are
/// keyed by the balance holding each group.
fn group_credits(
    entries: &[LedgerEntry],
    already: Decimal,
    in_delta: Decimal,
) -> BTreeMap<Uuid, Vec<GroupCharge>> {
    let mut credits: BTreeMap<Uuid, Vec<GroupCharge>> = BTreeMap::new();
    let mut returned = (-already).max(Decimal::ZERO);
    let mut left = (-in_delta).max(Decimal::ZERO);

    for entry in entries.iter().rev() {
        if left.is_zero() {
            break;
        }
        let prior = returned.min(entry.covered);
        returned -= prior;
        let take = left.min(entry.covered - prior);
        if take <= Decimal::ZERO {
            continue;
        }
        left -= take;

        // cost-ceiling groups were consumed in money, pro rata of the volume
        let amount = if take == entry.covered {
            entry.amount
        } else {
            entry.amount * take / entry.covered
        };
        credits.entry(entry.balance_id).or_default().push(GroupCharge {
            group: entry.group.clone(),
            balance_type: entry.balance_type,
            amount: -amount,
        });
    }
    credits
}

/// Reconciles granted and reported usage of real-time sessions
pub struct RebalanceManager {
    catalog: Arc<dyn Catalog>,
    balances: Arc<dyn BalanceStore>,
    lines: Arc<dyn LineStore>,
    resolver: RateResolver,
    config: PricingConfig,
    on_final_only: bool,
}

impl RebalanceManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        balances: Arc<dyn BalanceStore>,
        lines: Arc<dyn LineStore>,
        config: PricingConfig,
        on_final_only: bool,
    ) -> Self {
        Self {
            catalog,
            balances,
            lines,
            resolver: RateResolver::new(),
            config,
            on_final_only,
        }
    }

    /// Whether `event` triggers a rebalance of its session
    ///
    /// Only real-time events that report actual usage qualify. Postpaid
    /// charge requests never do. With `on_final_only`, only the final
    /// record of the session does.
    pub fn is_required(&self, event: &UsageEvent) -> bool {
        event.realtime
            && !event.rebalance
            && event.reported_usage.is_some()
            && !event.is_request_type(self.config.postpay_charge_request_type)
            && (event.is_final() || !self.on_final_only)
    }

    /// Credit the difference between charged and reported usage
    ///
    /// Returns `None` when there is nothing to credit.
    #[instrument(skip(self, event), fields(stamp = %event.stamp, sid = event.sid))]
    pub async fn rebalance(&self, event: &UsageEvent) -> AppResult<Option<RebalanceOutcome>> {
        let Some(reported) = event.reported_usage else {
            return Ok(None);
        };
        let session = event.session_id.as_deref();

        let Some(line) = self.lines.last_archived_in_session(event.sid, session).await? else {
            debug!("No archived line in session {:?}", session);
            return Ok(None);
        };

        let charged = if self.on_final_only {
            self.lines.archived_session_usage(event.sid, session).await?
        } else {
            line.effective_usagev()
        };
        let diff = reported - charged;
        if diff >= Decimal::ZERO {
            debug!("Reported {} covers charged {}, nothing to credit", reported, charged);
            return Ok(None);
        }

        let Some(balance_id) = line.balance_ref else {
            warn!("Line {} has no balance reference, skipping rebalance", line.id);
            return Ok(None);
        };

        let rate = self
            .catalog
            .find_rate(&line.rate_ref)
            .await?
            .ok_or_else(|| AppError::RateNotFound(line.rate_ref.clone()))?;
        let tariff = self
            .resolver
            .resolve_tariff(&rate, line.usage_type, Some(&line.plan))?;
        // never refund more than the line was charged
        let charged_price = (line.aprice + line.correction("aprice")).max(Decimal::ZERO);
        let cost_delta = (self.resolver.price(tariff, reported) - self.resolver.price(tariff, charged))
            .max(-charged_price);

        self.credit(&line, balance_id, diff, cost_delta, &event.stamp)
            .await?;

        let deltas = line_corrections(&line, diff, cost_delta);
        self.lines.correct_archived(line.id, &deltas).await?;

        let live_deltas: BTreeMap<String, Decimal> = deltas
            .iter()
            .filter(|(field, _)| {
                **field == correction_field("usagev") || **field == correction_field("aprice")
            })
            .map(|(field, delta)| (field.clone(), *delta))
            .collect();
        let live_lines = self.lines.correct_live(event.sid, session, &live_deltas).await?;

        info!(
            "Rebalanced session {:?} of sid {}: charged {}, used {}, credited {}",
            session, event.sid, charged, reported, diff
        );
        Ok(Some(RebalanceOutcome {
            line_id: line.id,
            balance_id,
            charged,
            reported,
            diff,
            cost_delta,
            live_lines,
        }))
    }

    /// Conditioned credit of the balance, logged under `rebalance_<stamp>`
    ///
    /// The in-group part of the credit goes back to the groups that covered
    /// the line, on whichever balance holds them, in the same atomic write.
    async fn credit(
        &self,
        line: &PricedLine,
        balance_id: Uuid,
        diff: Decimal,
        cost_delta: Decimal,
        stamp: &str,
    ) -> AppResult<()> {
        let tx_stamp = correction_field(stamp);
        let usage_type = line.usage_type;
        let (_, in_delta) = split_credit(line, diff);
        let credits = group_credits(&line.arategroups, line.correction("in_group"), in_delta);
        let max = self.config.concurrent_max_retries.max(1);
        let mut retries = 0u32;

        loop {
            let balance = self
                .balances
                .find_by_id(balance_id)
                .await?
                .ok_or_else(|| AppError::BalanceNotFound(balance_id.to_string()))?;
            if balance.tx_entry(&tx_stamp).is_some() {
                debug!("Credit {} already applied to balance {}", tx_stamp, balance_id);
                return Ok(());
            }

            // volume-tracked allowances are not charged in money
            let cost = if balance.tracks_volume(usage_type) {
                Decimal::ZERO
            } else {
                cost_delta
            };
            let tx = Some((tx_stamp.clone(), PricingResult::flat(diff, cost)));

            let mut writes = vec![BalanceWrite {
                id: balance_id,
                expected: balance.snapshot(),
                update: BalanceUpdate {
                    usage_type: Some(usage_type),
                    usagev: diff,
                    cost,
                    count: 0,
                    groups: credits.get(&balance_id).cloned().unwrap_or_default(),
                    tx: tx.clone(),
                },
            }];
            for (holder_id, groups) in credits.iter().filter(|(id, _)| **id != balance_id) {
                let Some(holder) = self.balances.find_by_id(*holder_id).await? else {
                    warn!("Group holder {} is gone, dropping its credit", holder_id);
                    continue;
                };
                writes.push(BalanceWrite {
                    id: holder.id,
                    expected: holder.snapshot(),
                    update: BalanceUpdate {
                        usage_type: None,
                        count: 0,
                        groups: groups.clone(),
                        tx: tx.clone(),
                        ..Default::default()
                    },
                });
            }

            let outcome = if writes.len() == 1 {
                let write = &writes[0];
                self.balances
                    .conditional_update(write.id, &write.expected, &write.update)
                    .await?
            } else {
                self.balances.conditional_update_all(&writes).await?
            };

            match outcome {
                UpdateOutcome::Applied => return Ok(()),
                UpdateOutcome::Conflict => {
                    retries += 1;
                    if retries >= max {
                        return Err(AppError::PricingRetriesExhausted {
                            stamp: tx_stamp,
                            attempts: retries,
                        });
                    }
                    warn!("Balance {} changed during rebalance, retry {}", balance_id, retries);
                    tokio::time::sleep(Duration::from_micros(u64::from(retries))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tariffa_core::models::{BalanceType, RecordType};

    fn line(in_group: Option<Decimal>, out_group: Option<Decimal>) -> PricedLine {
        PricedLine {
            id: Uuid::new_v4(),
            stamp: "l1".to_string(),
            sid: 1,
            aid: 1,
            session_id: Some("s".to_string()),
            usage_type: UsageType::Data,
            rate_ref: "NET".to_string(),
            plan: "BASIC".to_string(),
            urt: Utc::now(),
            usagev: dec!(100),
            aprice: dec!(1),
            balance_ref: None,
            in_group,
            out_group,
            arategroups: Vec::new(),
            corrections: BTreeMap::new(),
        }
    }

    fn consumed(
        group: &str,
        balance_type: BalanceType,
        covered: Decimal,
        amount: Decimal,
        balance_id: Uuid,
    ) -> LedgerEntry {
        LedgerEntry {
            group: group.to_string(),
            balance_type,
            amount,
            covered,
            left: Decimal::ZERO,
            total: None,
            balance_id,
        }
    }

    #[test]
    fn test_corrections_take_out_of_group_first() {
        let deltas = line_corrections(&line(Some(dec!(70)), Some(dec!(30))), dec!(-40), dec!(-0.4));

        assert_eq!(deltas["rebalance_usagev"], dec!(-40));
        assert_eq!(deltas["rebalance_aprice"], dec!(-0.4));
        assert_eq!(deltas["rebalance_out_group"], dec!(-30));
        assert_eq!(deltas["rebalance_in_group"], dec!(-10));
    }

    #[test]
    fn test_corrections_without_group_fields() {
        let deltas = line_corrections(&line(None, None), dec!(-5), dec!(0));
        assert_eq!(deltas.len(), 2);
        assert!(!deltas.contains_key("rebalance_in_group"));
    }

    #[test]
    fn test_group_credits_return_last_consumed_first() {
        let own = Uuid::new_v4();
        let shared = Uuid::new_v4();
        let entries = vec![
            consumed("PERSONAL", BalanceType::Usagev, dec!(50), dec!(50), own),
            consumed("SHARED", BalanceType::Usagev, dec!(30), dec!(30), shared),
        ];

        let credits = group_credits(&entries, dec!(0), dec!(-40));
        assert_eq!(credits[&shared].len(), 1);
        assert_eq!(credits[&shared][0].amount, dec!(-30));
        assert_eq!(credits[&own][0].group, "PERSONAL");
        assert_eq!(credits[&own][0].amount, dec!(-10));

        // a second rebalance skips what the first one returned
        let credits = group_credits(&entries, dec!(-40), dec!(-20));
        assert!(!credits.contains_key(&shared));
        assert_eq!(credits[&own][0].amount, dec!(-20));
    }

    #[test]
    fn test_cost_group_credit_is_pro_rata() {
        let own = Uuid::new_v4();
        let entries = vec![consumed("BUDGET", BalanceType::Cost, dec!(100), dec!(2.00), own)];

        let credits = group_credits(&entries, dec!(0), dec!(-25));
        assert_eq!(credits[&own][0].amount, dec!(-0.50));
        assert!(group_credits(&entries, dec!(0), dec!(0)).is_empty());
    }

    mod required {
        use super::*;
        use async_trait::async_trait;
        use chrono::DateTime;
        use tariffa_core::models::{
            Balance, BalanceKey, BalanceSnapshot, Plan, Rate, Service,
        };

        struct Unused;

        #[async_trait]
        impl Catalog for Unused {
            async fn find_rate(&self, _key: &str) -> AppResult<Option<Rate>> {
                Ok(None)
            }
            async fn find_plan(&self, _n: &str, _at: DateTime<Utc>) -> AppResult<Option<Plan>> {
                Ok(None)
            }
            async fn find_service(&self, _n: &str, _at: DateTime<Utc>) -> AppResult<Option<Service>> {
                Ok(None)
            }
        }

        #[async_trait]
        impl BalanceStore for Unused {
            async fn load(&self, _key: &BalanceKey) -> AppResult<Option<Balance>> {
                Ok(None)
            }
            async fn find_by_id(&self, _id: Uuid) -> AppResult<Option<Balance>> {
                Ok(None)
            }
            async fn create(&self, balance: &Balance) -> AppResult<Balance> {
                Ok(balance.clone())
            }
            async fn conditional_update(
                &self,
                _id: Uuid,
                _expected: &BalanceSnapshot,
                _update: &BalanceUpdate,
            ) -> AppResult<UpdateOutcome> {
                Ok(UpdateOutcome::Conflict)
            }
            async fn conditional_update_all(
                &self,
                _writes: &[BalanceWrite],
            ) -> AppResult<UpdateOutcome> {
                Ok(UpdateOutcome::Conflict)
            }
            async fn clear_tx(&self, _id: Uuid, _stamp: &str) -> AppResult<bool> {
                Ok(false)
            }
        }

        #[async_trait]
        impl LineStore for Unused {
            async fn last_archived_in_session(
                &self,
                _sid: i64,
                _session_id: Option<&str>,
            ) -> AppResult<Option<PricedLine>> {
                Ok(None)
            }
            async fn archived_session_usage(&self, _sid: i64, _s: Option<&str>) -> AppResult<Decimal> {
                Ok(Decimal::ZERO)
            }
            async fn live_session_usage(&self, _sid: i64, _s: Option<&str>) -> AppResult<Decimal> {
                Ok(Decimal::ZERO)
            }
            async fn correct_archived(
                &self,
                _line_id: Uuid,
                _deltas: &BTreeMap<String, Decimal>,
            ) -> AppResult<()> {
                Ok(())
            }
            async fn correct_live(
                &self,
                _sid: i64,
                _session_id: Option<&str>,
                _deltas: &BTreeMap<String, Decimal>,
            ) -> AppResult<u64> {
                Ok(0)
            }
        }

        fn manager(on_final_only: bool) -> RebalanceManager {
            let unused = Arc::new(Unused);
            RebalanceManager::new(
                unused.clone(),
                unused.clone(),
                unused,
                PricingConfig::default(),
                on_final_only,
            )
        }

        fn realtime(record_type: RecordType) -> UsageEvent {
            UsageEvent {
                stamp: "rt".to_string(),
                sid: 1,
                aid: 1,
                realtime: true,
                record_type: Some(record_type),
                reported_usage: Some(dec!(60)),
                ..Default::default()
            }
        }

        #[test]
        fn test_update_records_rebalance_by_default() {
            assert!(manager(false).is_required(&realtime(RecordType::Update)));
            assert!(manager(false).is_required(&realtime(RecordType::Final)));
        }

        #[test]
        fn test_on_final_only() {
            assert!(!manager(true).is_required(&realtime(RecordType::Update)));
            assert!(manager(true).is_required(&realtime(RecordType::Final)));
        }

        #[test]
        fn test_not_required() {
            let m = manager(false);
            let offline = UsageEvent {
                realtime: false,
                ..realtime(RecordType::Final)
            };
            let unreported = UsageEvent {
                reported_usage: None,
                ..realtime(RecordType::Final)
            };
            let postpay_charge = UsageEvent {
                request_type: Some(PricingConfig::default().postpay_charge_request_type),
                ..realtime(RecordType::Final)
            };
            let internal = UsageEvent {
                rebalance: true,
                ..realtime(RecordType::Final)
            };
            assert!(!m.is_required(&offline));
            assert!(!m.is_required(&unreported));
            assert!(!m.is_required(&postpay_charge));
            assert!(!m.is_required(&internal));
        }

        #[tokio::test]
        async fn test_nothing_archived() {
            let outcome = manager(false)
                .rebalance(&realtime(RecordType::Final))
                .await
                .unwrap();
            assert!(outcome.is_none());
        }
    }
}
