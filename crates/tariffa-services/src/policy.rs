//! Charging policies
//!
//! The plan's charging type selects a policy. The policy decides how much of
//! the requested volume is granted, what happens when there is no usable
//! balance, whether results are billable, and whether earlier grants of a
//! session get rebalanced.

use crate::rating::RateResolver;
use crate::rebalance::{RebalanceManager, RebalanceOutcome};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tariffa_core::{
    config::PrepaidConfig,
    models::{Balance, BalanceType, GrantedReturnCode, Plan, PricingResult, Rate, Tariff, UsageEvent},
    traits::FreeLinePolicy,
    AppError, AppResult,
};
use tracing::debug;

/// Everything a policy may look at while pricing one event
#[derive(Debug, Clone, Copy)]
pub struct PricingContext<'a> {
    pub event: &'a UsageEvent,
    pub rate: &'a Rate,
    pub tariff: &'a Tariff,
    pub plan: Option<&'a Plan>,
    /// Session usage preceding this event
    pub offset: Decimal,
}

/// What to do when no usable balance exists
#[derive(Debug, Clone, PartialEq)]
pub enum NoBalanceOutcome {
    /// The event is fully priced by the handler
    Priced(PricingResult),
    /// Continue with zero volume and no balance mutation
    ContinueWithoutBalance,
}

/// Charging policy
#[async_trait]
pub trait ChargingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a missing balance on first use instead of calling `handle_no_balance`
    fn opens_balance(&self) -> bool {
        false
    }

    /// Whether a loaded balance can be charged at all
    fn accepts_balance(&self, _ctx: &PricingContext<'_>, _balance: &Balance) -> bool {
        true
    }

    /// Volume to price against `balance`
    fn granted_volume(&self, ctx: &PricingContext<'_>, balance: &Balance) -> Decimal;

    fn handle_no_balance(&self, ctx: &PricingContext<'_>) -> AppResult<NoBalanceOutcome>;

    fn is_billable(&self) -> bool;

    /// Return code stamped on granted results
    fn grant_code(&self) -> Option<GrantedReturnCode> {
        None
    }

    /// Rebalance earlier grants of the event's session, if due
    async fn rebalance(
        &self,
        rebalancer: &RebalanceManager,
        event: &UsageEvent,
    ) -> AppResult<Option<RebalanceOutcome>> {
        if !rebalancer.is_required(event) {
            return Ok(None);
        }
        rebalancer.rebalance(event).await
    }
}

/// Shared fallback: zero-volume requests continue, anything else fails
fn default_no_balance(ctx: &PricingContext<'_>) -> AppResult<NoBalanceOutcome> {
    if ctx.event.volume.is_zero() {
        return Ok(NoBalanceOutcome::ContinueWithoutBalance);
    }
    Err(AppError::BalanceNotFound(format!(
        "sid={} aid={} plan={}",
        ctx.event.sid, ctx.event.aid, ctx.event.plan
    )))
}

/// Postpaid: everything requested is charged and billed at period end
#[derive(Debug, Clone, Copy, Default)]
pub struct PostpaidPolicy;

impl PostpaidPolicy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChargingPolicy for PostpaidPolicy {
    fn name(&self) -> &'static str {
        "postpaid"
    }

    fn opens_balance(&self) -> bool {
        true
    }

    fn granted_volume(&self, ctx: &PricingContext<'_>, _balance: &Balance) -> Decimal {
        ctx.event.volume
    }

    fn handle_no_balance(&self, ctx: &PricingContext<'_>) -> AppResult<NoBalanceOutcome> {
        default_no_balance(ctx)
    }

    fn is_billable(&self) -> bool {
        true
    }
}

/// Free-line hook that never matches; only the event override applies
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFreeLines;

impl FreeLinePolicy for NoFreeLines {
    fn is_free(&self, _event: &UsageEvent) -> bool {
        false
    }
}

/// Prepaid: usage is granted out of a loaded allowance
pub struct PrepaidPolicy {
    config: PrepaidConfig,
    resolver: RateResolver,
    free_lines: Arc<dyn FreeLinePolicy>,
}

impl PrepaidPolicy {
    pub fn new(config: PrepaidConfig) -> Self {
        Self {
            config,
            resolver: RateResolver::new(),
            free_lines: Arc::new(NoFreeLines),
        }
    }

    pub fn with_free_lines(mut self, free_lines: Arc<dyn FreeLinePolicy>) -> Self {
        self.free_lines = free_lines;
        self
    }

    fn min_usage(&self, ctx: &PricingContext<'_>) -> Decimal {
        self.config.min_usage_for(ctx.event.usage_type)
    }

    /// Charge of the minimum reservation at the session's current offset
    fn min_cost(&self, ctx: &PricingContext<'_>) -> Decimal {
        self.resolver
            .price_with_offset(ctx.tariff, self.min_usage(ctx), ctx.offset)
    }

    /// Largest volume the balance can pay for; `None` when unlimited
    fn affordable(&self, ctx: &PricingContext<'_>, balance: &Balance) -> Option<Decimal> {
        let (balance_type, remaining) = balance.remaining_allowance(ctx.event.usage_type)?;
        let remaining = remaining.max(Decimal::ZERO);
        Some(match balance_type {
            BalanceType::Usagev => remaining,
            BalanceType::Cost => {
                self.resolver
                    .volume_for_cost_with_offset(ctx.tariff, remaining, ctx.offset)
            }
        })
    }

    fn result(&self, ctx: &PricingContext<'_>, usagev: Decimal, aprice: Decimal) -> PricingResult {
        PricingResult {
            usagev,
            aprice,
            billable: false,
            granted_return_code: Some(GrantedReturnCode::Ok),
            usage_offset: ctx.offset,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChargingPolicy for PrepaidPolicy {
    fn name(&self) -> &'static str {
        "prepaid"
    }

    fn accepts_balance(&self, ctx: &PricingContext<'_>, balance: &Balance) -> bool {
        if !self.config.reject_below_minimum {
            return true;
        }
        match balance.remaining_allowance(ctx.event.usage_type) {
            None => true,
            Some((BalanceType::Usagev, remaining)) => remaining >= self.min_usage(ctx),
            Some((BalanceType::Cost, remaining)) => remaining >= self.min_cost(ctx),
        }
    }

    fn granted_volume(&self, ctx: &PricingContext<'_>, balance: &Balance) -> Decimal {
        let requested = ctx.event.volume;
        if ctx.event.rebalance {
            return requested;
        }
        match self.affordable(ctx, balance) {
            Some(affordable) => requested.min(affordable),
            None => requested,
        }
    }

    fn handle_no_balance(&self, ctx: &PricingContext<'_>) -> AppResult<NoBalanceOutcome> {
        let event = ctx.event;
        if event.free_line || self.free_lines.is_free(event) {
            debug!("Free line {} for sid {}", event.stamp, event.sid);
            let mut result = self.result(ctx, event.volume, Decimal::ZERO);
            result.free_line = true;
            return Ok(NoBalanceOutcome::Priced(result));
        }

        let min_cost = self.min_cost(ctx);
        if min_cost.is_zero() {
            let usagev = if self.config.is_provisional(event.record_type) {
                Decimal::ZERO
            } else {
                self.min_usage(ctx)
            };
            return Ok(NoBalanceOutcome::Priced(self.result(ctx, usagev, min_cost)));
        }

        debug!(
            "No available balance for sid {} (minimum charge {})",
            event.sid, min_cost
        );
        match default_no_balance(ctx)? {
            NoBalanceOutcome::ContinueWithoutBalance => {
                let mut result = self.result(ctx, Decimal::ZERO, Decimal::ZERO);
                result.granted_return_code = Some(GrantedReturnCode::NoAvailableBalances);
                Ok(NoBalanceOutcome::Priced(result))
            }
            priced => Ok(priced),
        }
    }

    fn is_billable(&self) -> bool {
        false
    }

    fn grant_code(&self) -> Option<GrantedReturnCode> {
        Some(GrantedReturnCode::Ok)
    }
}
