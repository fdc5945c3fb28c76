//! Pricing engine
//!
//! Prices one usage event and commits the charge against the subscriber's
//! balance. The flow per event is:
//!
//! 1. Load the rate and the plan effective at the event time
//! 2. Flat-price events that never touch a balance (credits, services,
//!    prepriced events)
//! 3. Resolve the session offset, rebalancing earlier grants when due
//! 4. Load the balance (the account-level one for account-shared groups)
//! 5. Allocate the granted volume across entity groups and price the rest
//! 6. Commit with a write conditioned on the totals read in step 5,
//!    retrying from step 5 on conflict
//!
//! When an account-shared group is involved the subscriber balance and the
//! account balance are committed in one atomic write, so an event is either
//! applied to both or to neither. The transaction log of the balance makes
//! step 6 idempotent: an event whose stamp is already logged returns the
//! logged result without writing.

use crate::allocator::{Allocation, GroupAllocator, QuotaProvider, Requirement};
use crate::policy::{ChargingPolicy, NoBalanceOutcome, PostpaidPolicy, PrepaidPolicy, PricingContext};
use crate::rating::RateResolver;
use crate::rebalance::RebalanceManager;
use futures::future::try_join_all;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tariffa_core::{
    config::{PrepaidConfig, PricingConfig},
    models::{
        Balance, BalanceKey, BalanceUpdate, ChargingType, EntityGroup, GroupCharge, LedgerEntry,
        Plan, PricingResult, Rate, Service, UsageEvent, UsageType,
    },
    traits::{BalanceStore, BalanceWrite, Catalog, CycleCalendar, LineStore, UpdateOutcome},
    AppError, AppResult,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Progress of one event through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingStage {
    Init,
    RateLoaded,
    FlatPriced,
    BalanceLoaded,
    Priced,
    Committed,
    Failed,
}

impl PricingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingStage::Init => "init",
            PricingStage::RateLoaded => "rate_loaded",
            PricingStage::FlatPriced => "flat_priced",
            PricingStage::BalanceLoaded => "balance_loaded",
            PricingStage::Priced => "priced",
            PricingStage::Committed => "committed",
            PricingStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PricingStage::FlatPriced | PricingStage::Committed | PricingStage::Failed
        )
    }
}

impl fmt::Display for PricingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Groups covering a rate and usage type: plan groups first, then each
/// service's groups in the order the services were listed
fn covering_groups<'a>(
    plan: &'a Plan,
    services: &'a [Service],
    rate_key: &'a str,
    usage_type: UsageType,
) -> impl Iterator<Item = &'a EntityGroup> + 'a {
    plan.groups_for(rate_key, usage_type).chain(
        services
            .iter()
            .flat_map(move |s| s.groups_for(rate_key, usage_type)),
    )
}

fn group_charges(entries: &[LedgerEntry], balance_id: Uuid) -> Vec<GroupCharge> {
    entries
        .iter()
        .filter(|e| e.balance_id == balance_id)
        .map(|e| GroupCharge {
            group: e.group.clone(),
            balance_type: e.balance_type,
            amount: e.amount,
        })
        .collect()
}

/// One priced attempt, ready to commit
struct Attempt {
    result: PricingResult,
    primary: BalanceUpdate,
    shared: Option<(Balance, BalanceUpdate)>,
}

/// Usage rating engine
pub struct PricingEngine {
    catalog: Arc<dyn Catalog>,
    balances: Arc<dyn BalanceStore>,
    lines: Arc<dyn LineStore>,
    calendar: Arc<dyn CycleCalendar>,
    resolver: RateResolver,
    allocator: GroupAllocator,
    config: PricingConfig,
    postpaid: Arc<dyn ChargingPolicy>,
    prepaid: Arc<dyn ChargingPolicy>,
    rebalancer: RebalanceManager,
}

impl PricingEngine {
    /// Create an engine with the default postpaid and prepaid policies
    pub fn new(
        catalog: Arc<dyn Catalog>,
        balances: Arc<dyn BalanceStore>,
        lines: Arc<dyn LineStore>,
        calendar: Arc<dyn CycleCalendar>,
        config: PricingConfig,
        prepaid: PrepaidConfig,
    ) -> Self {
        let resolver = RateResolver::new();
        let rebalancer = RebalanceManager::new(
            catalog.clone(),
            balances.clone(),
            lines.clone(),
            config.clone(),
            prepaid.rebalance_on_final,
        );
        Self {
            catalog,
            balances,
            lines,
            calendar,
            resolver,
            allocator: GroupAllocator::new(resolver),
            config,
            postpaid: Arc::new(PostpaidPolicy::new()),
            prepaid: Arc::new(PrepaidPolicy::new(prepaid)),
            rebalancer,
        }
    }

    /// Replace the charging policies
    pub fn with_policies(
        mut self,
        postpaid: Arc<dyn ChargingPolicy>,
        prepaid: Arc<dyn ChargingPolicy>,
    ) -> Self {
        self.postpaid = postpaid;
        self.prepaid = prepaid;
        self
    }

    pub fn rebalancer(&self) -> &RebalanceManager {
        &self.rebalancer
    }

    fn policy_for(&self, plan: Option<&Plan>) -> &dyn ChargingPolicy {
        match plan.map(|p| p.charging) {
            Some(ChargingType::Prepaid) => self.prepaid.as_ref(),
            _ => self.postpaid.as_ref(),
        }
    }

    fn advance(&self, stage: &mut PricingStage, next: PricingStage) {
        debug!("{} -> {}", stage, next);
        *stage = next;
    }

    /// Price one event and commit it against its balance
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` / `AppError::InvalidInput` for malformed events
    /// - `AppError::RateNotFound` when the rate or its tariff is missing
    /// - `AppError::BalanceNotFound` when the policy cannot price without a balance
    /// - `AppError::PricingRetriesExhausted` when concurrent writers keep winning
    #[instrument(skip(self, event), fields(stamp = %event.stamp, sid = event.sid))]
    pub async fn price(&self, event: &UsageEvent) -> AppResult<PricingResult> {
        let mut stage = PricingStage::Init;
        match self.run(event, &mut stage).await {
            Ok(result) => Ok(result),
            Err(e) => {
                match &e {
                    AppError::PricingRetriesExhausted { .. } => {
                        error!("Event {} left unpriced at stage {}: {}", event.stamp, stage, e)
                    }
                    _ => warn!("Event {} failed at stage {}: {}", event.stamp, stage, e),
                }
                self.advance(&mut stage, PricingStage::Failed);
                Err(e)
            }
        }
    }

    async fn run(&self, event: &UsageEvent, stage: &mut PricingStage) -> AppResult<PricingResult> {
        event.check()?;

        let rate = self
            .catalog
            .find_rate(&event.rate_ref)
            .await?
            .ok_or_else(|| AppError::RateNotFound(event.rate_ref.clone()))?;
        let plan = self.catalog.find_plan(&event.plan, event.urt).await?;
        self.advance(stage, PricingStage::RateLoaded);

        let policy = self.policy_for(plan.as_ref());
        let billable = self.resolver.is_billable(&rate) && policy.is_billable();

        if self.config.types_without_balance.contains(&event.usage_type) || event.is_prepriced() {
            let result = self.flat_price(event, &rate, billable)?;
            self.advance(stage, PricingStage::FlatPriced);
            return Ok(result);
        }

        let tariff = self
            .resolver
            .resolve_tariff(&rate, event.usage_type, Some(&event.plan))?;
        let offset = self.session_offset(event, policy).await?;
        let ctx = PricingContext {
            event,
            rate: &rate,
            tariff,
            plan: plan.as_ref(),
            offset,
        };

        let Some(plan) = plan.as_ref() else {
            debug!("Plan {} not effective at {}", event.plan, event.urt);
            return self.without_balance(policy, &ctx, billable);
        };

        let key = self.balance_key(event, plan, &rate);
        let balance = match self.balances.load(&key).await? {
            Some(balance) if policy.accepts_balance(&ctx, &balance) => balance,
            Some(balance) => {
                debug!("Balance {} cannot cover the minimum reservation", balance.id);
                return self.without_balance(policy, &ctx, billable);
            }
            None if policy.opens_balance() => {
                self.open_balance(key, plan.charging, event.pretend).await?
            }
            None => {
                debug!("No balance for {}", key);
                return self.without_balance(policy, &ctx, billable);
            }
        };
        self.advance(stage, PricingStage::BalanceLoaded);

        let services = self.load_services(event).await?;
        self.commit(&ctx, policy, plan, &services, balance, billable, stage)
            .await
    }

    fn flat_price(&self, event: &UsageEvent, rate: &Rate, billable: bool) -> AppResult<PricingResult> {
        let aprice = match event.preprice {
            Some(preprice) => preprice,
            None => {
                let tariff = self
                    .resolver
                    .resolve_tariff(rate, event.usage_type, Some(&event.plan))?;
                self.resolver.price(tariff, event.volume)
            }
        };
        debug!("Flat priced {} {} at {}", event.usage_type, event.volume, aprice);

        let mut result = PricingResult::flat(event.volume, aprice);
        result.billable = billable;
        Ok(result)
    }

    fn without_balance(
        &self,
        policy: &dyn ChargingPolicy,
        ctx: &PricingContext<'_>,
        billable: bool,
    ) -> AppResult<PricingResult> {
        let mut result = match policy.handle_no_balance(ctx)? {
            NoBalanceOutcome::Priced(result) => result,
            NoBalanceOutcome::ContinueWithoutBalance => PricingResult {
                usage_offset: ctx.offset,
                ..PricingResult::zero()
            },
        };
        result.billable = billable;
        Ok(result)
    }

    /// Volume the session consumed before this event
    async fn session_offset(
        &self,
        event: &UsageEvent,
        policy: &dyn ChargingPolicy,
    ) -> AppResult<Decimal> {
        if !event.realtime || event.is_request_type(self.config.postpay_charge_request_type) {
            return Ok(event.call_offset);
        }

        let session = event.session_id.as_deref();
        let live = self.lines.live_session_usage(event.sid, session).await?;
        let diff = if event.pretend {
            Decimal::ZERO
        } else {
            policy
                .rebalance(&self.rebalancer, event)
                .await?
                .map_or(Decimal::ZERO, |outcome| outcome.diff)
        };
        Ok((live + diff).max(Decimal::ZERO))
    }

    async fn load_services(&self, event: &UsageEvent) -> AppResult<Vec<Service>> {
        let lookups = event
            .services
            .iter()
            .map(|name| self.catalog.find_service(name, event.urt));
        let found = try_join_all(lookups).await?;

        Ok(event
            .services
            .iter()
            .zip(found)
            .filter_map(|(name, service)| {
                if service.is_none() {
                    warn!("Service {} not effective at {}, ignoring its groups", name, event.urt);
                }
                service
            })
            .collect())
    }

    fn balance_key(&self, event: &UsageEvent, plan: &Plan, rate: &Rate) -> BalanceKey {
        let period = self.calendar.key_for(event.urt);
        if plan.is_account_shared(&rate.key, event.usage_type) {
            BalanceKey::shared(event.aid, period)
        } else {
            BalanceKey::new(event.sid, event.aid, period)
        }
    }

    async fn open_balance(
        &self,
        key: BalanceKey,
        charging: ChargingType,
        pretend: bool,
    ) -> AppResult<Balance> {
        if pretend {
            return Ok(Balance::new(key, charging));
        }
        match self.balances.create(&Balance::new(key, charging)).await {
            Ok(balance) => {
                info!("Opened balance {} for {}", balance.id, key);
                Ok(balance)
            }
            // another worker may have opened it first
            Err(e) => self.balances.load(&key).await?.ok_or(e),
        }
    }

    async fn shared_holder(
        &self,
        ctx: &PricingContext<'_>,
        plan: &Plan,
        services: &[Service],
        primary: &Balance,
    ) -> AppResult<Option<Balance>> {
        if primary.is_shared() {
            return Ok(None);
        }
        let needs_shared = covering_groups(plan, services, &ctx.rate.key, ctx.event.usage_type)
            .any(|g| g.account_shared);
        if !needs_shared {
            return Ok(None);
        }

        let key = BalanceKey::shared(primary.aid, primary.period);
        match self.balances.load(&key).await? {
            Some(balance) => Ok(Some(balance)),
            None => self
                .open_balance(key, plan.charging, ctx.event.pretend)
                .await
                .map(Some),
        }
    }

    fn providers(
        &self,
        ctx: &PricingContext<'_>,
        plan: &Plan,
        services: &[Service],
        primary: &Balance,
        shared: Option<&Balance>,
    ) -> Vec<QuotaProvider> {
        let usage_type = ctx.event.usage_type;
        covering_groups(plan, services, &ctx.rate.key, usage_type)
            .map(|group| {
                let holder = match shared {
                    Some(shared) if group.account_shared => shared,
                    _ => primary,
                };
                QuotaProvider {
                    name: group.name.clone(),
                    balance_type: group.balance_type(),
                    remaining: holder.group_remaining(group, usage_type),
                    ceiling: group.ceiling_for(usage_type),
                    balance_id: holder.id,
                }
            })
            .collect()
    }

    /// Price the event against the balances as read
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        ctx: &PricingContext<'_>,
        policy: &dyn ChargingPolicy,
        plan: &Plan,
        services: &[Service],
        primary: &Balance,
        shared: Option<Balance>,
        billable: bool,
    ) -> Attempt {
        let event = ctx.event;
        let granted = policy.granted_volume(ctx, primary);
        let providers = self.providers(ctx, plan, services, primary, shared.as_ref());
        let Allocation { entries, remainder } =
            self.allocator
                .allocate(ctx.tariff, Requirement::volume(granted), &providers);

        let covered: Decimal = entries.iter().map(|e| e.covered).sum();
        let aprice = self
            .resolver
            .price_with_offset(ctx.tariff, remainder, ctx.offset + covered);
        let (over_group, out_group) = if entries.is_empty() {
            (Decimal::ZERO, remainder)
        } else {
            (remainder, Decimal::ZERO)
        };

        let result = PricingResult {
            usagev: granted,
            aprice,
            in_group: covered,
            over_group,
            out_group,
            arategroups: entries,
            balance_ref: Some(primary.id),
            billable,
            free_line: false,
            granted_return_code: policy.grant_code(),
            usage_offset: ctx.offset,
            tx_saved: false,
        };

        let primary_update = BalanceUpdate {
            usage_type: Some(event.usage_type),
            usagev: granted,
            cost: aprice,
            count: 1,
            groups: group_charges(&result.arategroups, primary.id),
            tx: Some((event.stamp.clone(), result.clone())),
        };
        let shared = shared.and_then(|balance| {
            let groups = group_charges(&result.arategroups, balance.id);
            if groups.is_empty() {
                return None;
            }
            let update = BalanceUpdate {
                usage_type: None,
                count: 1,
                groups,
                tx: Some((event.stamp.clone(), result.clone())),
                ..Default::default()
            };
            Some((balance, update))
        });

        Attempt {
            result,
            primary: primary_update,
            shared,
        }
    }

    async fn backoff(&self, stamp: &str, balance_id: Uuid, retries: &mut u32) -> AppResult<()> {
        *retries += 1;
        let max = self.config.concurrent_max_retries.max(1);
        if *retries >= max {
            return Err(AppError::PricingRetriesExhausted {
                stamp: stamp.to_string(),
                attempts: *retries,
            });
        }
        warn!(
            "Balance {} changed concurrently, retry {}/{}",
            balance_id, retries, max
        );
        tokio::time::sleep(Duration::from_micros(u64::from(*retries))).await;
        Ok(())
    }

    async fn reload(&self, id: Uuid) -> AppResult<Balance> {
        self.balances
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::BalanceNotFound(id.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        ctx: &PricingContext<'_>,
        policy: &dyn ChargingPolicy,
        plan: &Plan,
        services: &[Service],
        mut primary: Balance,
        billable: bool,
        stage: &mut PricingStage,
    ) -> AppResult<PricingResult> {
        let stamp = ctx.event.stamp.as_str();
        let mut retries = 0u32;

        loop {
            if let Some(logged) = primary.tx_entry(stamp) {
                info!("Event {} already applied to balance {}", stamp, primary.id);
                let mut result = logged.clone();
                result.tx_saved = true;
                self.advance(stage, PricingStage::Committed);
                return Ok(result);
            }

            let shared = self.shared_holder(ctx, plan, services, &primary).await?;
            let attempt = self.attempt(ctx, policy, plan, services, &primary, shared, billable);
            self.advance(stage, PricingStage::Priced);

            if ctx.event.pretend {
                debug!("Pretend event {}, nothing committed", stamp);
                return Ok(attempt.result);
            }

            let mut writes = vec![BalanceWrite {
                id: primary.id,
                expected: primary.snapshot(),
                update: attempt.primary,
            }];
            let outcome = match attempt.shared {
                None => {
                    self.balances
                        .conditional_update(primary.id, &writes[0].expected, &writes[0].update)
                        .await?
                }
                Some((shared, update)) => {
                    writes.push(BalanceWrite {
                        id: shared.id,
                        expected: shared.snapshot(),
                        update,
                    });
                    self.balances.conditional_update_all(&writes).await?
                }
            };

            match outcome {
                UpdateOutcome::Applied => {
                    info!(
                        "Charged {} {} ({}) on {} balance(s)",
                        attempt.result.usagev,
                        ctx.event.usage_type,
                        attempt.result.aprice,
                        writes.len()
                    );
                    let mut result = attempt.result;
                    result.tx_saved = true;
                    self.advance(stage, PricingStage::Committed);
                    return Ok(result);
                }
                UpdateOutcome::Conflict => {
                    // the shared balance is re-read by the next attempt
                    self.backoff(stamp, primary.id, &mut retries).await?;
                    primary = self.reload(primary.id).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tariffa_core::models::GroupCeiling;

    fn group(name: &str, rate: &str, shared: bool) -> EntityGroup {
        let mut limits = BTreeMap::new();
        limits.insert(UsageType::Call, dec!(100));
        EntityGroup {
            name: name.to_string(),
            rates: vec![rate.to_string()],
            ceiling: GroupCeiling::Volume(limits),
            account_shared: shared,
        }
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(PricingStage::BalanceLoaded.to_string(), "balance_loaded");
        assert!(PricingStage::Committed.is_terminal());
        assert!(PricingStage::FlatPriced.is_terminal());
        assert!(!PricingStage::Priced.is_terminal());
    }

    #[test]
    fn test_covering_groups_order() {
        let plan = Plan {
            name: "BASIC".to_string(),
            groups: vec![group("PLAN_A", "LOCAL", false), group("PLAN_INTL", "INTL", false)],
            ..Default::default()
        };
        let services = vec![
            Service {
                name: "EXTRA".to_string(),
                from: chrono::DateTime::<chrono::Utc>::MIN_UTC,
                to: None,
                groups: vec![group("SVC_B", "LOCAL", true)],
            },
            Service {
                name: "MORE".to_string(),
                from: chrono::DateTime::<chrono::Utc>::MIN_UTC,
                to: None,
                groups: vec![group("SVC_C", "LOCAL", false)],
            },
        ];

        let names: Vec<_> = covering_groups(&plan, &services, "LOCAL", UsageType::Call)
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(names, vec!["PLAN_A", "SVC_B", "SVC_C"]);
    }

    #[test]
    fn test_group_charges_filter_by_balance() {
        let mine = Uuid::new_v4();
        let entry = |id| LedgerEntry {
            group: "G".to_string(),
            balance_type: tariffa_core::models::BalanceType::Usagev,
            amount: dec!(10),
            covered: dec!(10),
            left: dec!(0),
            total: None,
            balance_id: id,
        };
        let charges = group_charges(&[entry(mine), entry(Uuid::new_v4())], mine);
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount, dec!(10));
    }
}
