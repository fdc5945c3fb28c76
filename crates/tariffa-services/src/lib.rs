//! Rating engine and billing cycle services for Tariffa
//!
//! This crate contains the services that price usage events against
//! subscriber balances and drive the lifecycle of billing periods.
//!
//! # Architecture
//!
//! Services are composed from the store traits of tariffa-core:
//! - Each service receives its collaborators as `Arc<dyn Trait>`
//! - Balance writes are optimistic, conditioned on the totals snapshot
//! - All operations are instrumented with tracing
//! - Every failure is an `AppError`
//!
//! # Services
//!
//! - `RateResolver` - Tariff resolution and tiered pricing
//! - `CatalogService` - Rate/plan/service lookups with a Redis read-through cache
//! - `GroupAllocator` - Splits usage across entity group quotas
//! - `PricingEngine` - Prices and commits one usage event
//! - `PostpaidPolicy` / `PrepaidPolicy` - Charging policies selected by plan
//! - `RebalanceManager` - Credits over-granted real-time usage
//! - `BillingCycleManager` - Billing period status and lifecycle commands

pub mod allocator;
pub mod billing_cycle;
pub mod policy;
pub mod pricing;
pub mod rating;
pub mod rebalance;

pub use allocator::{Allocation, GroupAllocator, QuotaProvider, Requirement};
pub use billing_cycle::{BillingCycleManager, ChannelJobLauncher, MonthlyCalendar};
pub use policy::{
    ChargingPolicy, NoBalanceOutcome, NoFreeLines, PostpaidPolicy, PrepaidPolicy, PricingContext,
};
pub use pricing::{PricingEngine, PricingStage};
pub use rating::{CatalogService, RateResolver};
pub use rebalance::{RebalanceManager, RebalanceOutcome};

/// Rating constants
pub mod constants {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Cycle listings never return more periods than this
    pub const MAX_LISTED_CYCLES: usize = 100;

    /// Default listing window when no range is given, in months
    pub const DEFAULT_LISTING_MONTHS: u32 = 12;

    /// Percentage scale used for completion and confirmation figures
    pub const FULL_PERCENT: Decimal = dec!(100);
}
