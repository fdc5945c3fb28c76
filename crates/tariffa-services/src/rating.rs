//! Rate resolution and catalog lookups
//!
//! `RateResolver` turns a rate definition into the tariff that applies to a
//! usage type and plan, and walks tier tables in both directions (volume to
//! charge, and charge budget to affordable volume). `CatalogService` reads
//! rates, plans and services through a Redis read-through cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tariffa_cache::{keys, RedisCache};
use tariffa_core::{
    models::{Plan, Rate, RateEntry, Service, Tariff, TariffTier, UsageType, BASE_TARIFF},
    traits::{CacheService, Catalog},
    AppError, AppResult,
};
use tracing::{debug, instrument, warn};

/// Tariff resolution and tiered pricing
#[derive(Debug, Clone, Copy, Default)]
pub struct RateResolver;

impl RateResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the tariff of `rate` for `usage_type` under `plan`.
    ///
    /// Per-plan entries fall back to the `BASE` tariff; flat entries apply
    /// to every plan.
    pub fn resolve_tariff<'a>(
        &self,
        rate: &'a Rate,
        usage_type: UsageType,
        plan: Option<&str>,
    ) -> AppResult<&'a Tariff> {
        let entry = rate.rates.get(&usage_type).ok_or_else(|| {
            AppError::RateNotFound(format!("{} has no {} tariff", rate.key, usage_type))
        })?;

        match entry {
            RateEntry::Flat(tariff) => Ok(tariff),
            RateEntry::PerPlan(plans) => plan
                .and_then(|name| plans.get(name))
                .or_else(|| plans.get(BASE_TARIFF))
                .ok_or_else(|| {
                    AppError::RateNotFound(format!(
                        "{} has no {} tariff for plan {}",
                        rate.key,
                        usage_type,
                        plan.unwrap_or(BASE_TARIFF)
                    ))
                }),
        }
    }

    pub fn is_billable(&self, rate: &Rate) -> bool {
        rate.is_billable()
    }

    fn interval(tier: &TariffTier) -> Decimal {
        if tier.interval > Decimal::ZERO {
            tier.interval
        } else {
            Decimal::ONE
        }
    }

    /// Charge for `volume`, walking tiers in order.
    ///
    /// Each tier absorbs at most `to` units. Partial increments are rounded
    /// up unless the tier disables `ceil`. Non-positive volume costs nothing.
    /// Charges beyond the decimal range saturate.
    pub fn price(&self, tariff: &Tariff, volume: Decimal) -> Decimal {
        if volume <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut remaining = volume;
        let mut charge = Decimal::ZERO;
        for tier in &tariff.rate {
            if remaining <= Decimal::ZERO {
                break;
            }
            let portion = remaining.min(tier.to.max(Decimal::ZERO));
            let units = portion
                .checked_div(Self::interval(tier))
                .unwrap_or(Decimal::MAX);
            let units = if tier.rounds_up() { units.ceil() } else { units };
            charge = charge.saturating_add(units.saturating_mul(tier.price));
            remaining -= portion;
        }
        charge
    }

    /// Charge for `volume` consumed after `offset` units of the same session
    pub fn price_with_offset(&self, tariff: &Tariff, volume: Decimal, offset: Decimal) -> Decimal {
        self.price(tariff, offset.saturating_add(volume))
            .saturating_sub(self.price(tariff, offset))
    }

    /// Largest volume whose charge does not exceed `cost`
    pub fn volume_for_cost(&self, tariff: &Tariff, cost: Decimal) -> Decimal {
        if cost <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut remaining = cost;
        let mut volume = Decimal::ZERO;
        for tier in &tariff.rate {
            let to = tier.to.max(Decimal::ZERO);
            if tier.price <= Decimal::ZERO {
                volume = volume.saturating_add(to);
                continue;
            }

            let interval = Self::interval(tier);
            let tier_units = if tier.rounds_up() {
                to.checked_div(interval).unwrap_or(Decimal::MAX).ceil()
            } else {
                to.checked_div(interval).unwrap_or(Decimal::MAX)
            };
            if let Some(tier_cost) = tier_units.checked_mul(tier.price) {
                if remaining >= tier_cost {
                    volume = volume.saturating_add(to);
                    remaining -= tier_cost;
                    continue;
                }
            }

            let units = remaining.checked_div(tier.price).unwrap_or(Decimal::MAX);
            let units = if tier.rounds_up() { units.floor() } else { units };
            volume = volume.saturating_add(units.saturating_mul(interval).min(to));
            break;
        }
        volume
    }

    /// Largest volume after `offset` whose incremental charge does not exceed `cost`
    pub fn volume_for_cost_with_offset(
        &self,
        tariff: &Tariff,
        cost: Decimal,
        offset: Decimal,
    ) -> Decimal {
        let total = self.volume_for_cost(tariff, cost.saturating_add(self.price(tariff, offset)));
        (total - offset).max(Decimal::ZERO)
    }
}

/// Catalog reader with an optional Redis read-through cache
///
/// Cache failures are logged and treated as misses; they never fail pricing.
pub struct CatalogService<C: Catalog, K: CacheService = RedisCache> {
    catalog: Arc<C>,
    cache: Option<Arc<K>>,
    ttl_secs: u64,
}

impl<C: Catalog, K: CacheService> CatalogService<C, K> {
    /// Create a catalog service reading through `cache`
    pub fn new(catalog: Arc<C>, cache: Option<Arc<K>>) -> Self {
        Self {
            catalog,
            cache,
            ttl_secs: keys::RATE_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    async fn cached<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        let cache = self.cache.as_ref()?;
        match cache.get::<T>(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Cache error for {}: {}", key, e);
                None
            }
        }
    }

    async fn store<T>(&self, key: &str, value: &T)
    where
        T: serde::Serialize + Send + Sync,
    {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(key, value, self.ttl_secs).await {
                warn!("Failed to cache {}: {}", key, e);
            }
        }
    }
}

#[async_trait]
impl<C: Catalog, K: CacheService> Catalog for CatalogService<C, K> {
    #[instrument(skip(self))]
    async fn find_rate(&self, key: &str) -> AppResult<Option<Rate>> {
        let cache_key = keys::rate_key(key);
        if let Some(rate) = self.cached::<Rate>(&cache_key).await {
            return Ok(Some(rate));
        }

        debug!("Rate cache MISS for {}", key);
        let rate = self.catalog.find_rate(key).await?;
        if let Some(ref r) = rate {
            self.store(&cache_key, r).await;
        }
        Ok(rate)
    }

    #[instrument(skip(self))]
    async fn find_plan(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Plan>> {
        let cache_key = keys::plan_key(name, at);
        if let Some(plan) = self.cached::<Plan>(&cache_key).await {
            if plan.is_effective_at(at) {
                return Ok(Some(plan));
            }
        }

        let plan = self.catalog.find_plan(name, at).await?;
        if let Some(ref p) = plan {
            self.store(&cache_key, p).await;
        }
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn find_service(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Service>> {
        let cache_key = keys::service_key(name, at);
        if let Some(service) = self.cached::<Service>(&cache_key).await {
            if service.is_effective_at(at) {
                return Ok(Some(service));
            }
        }

        let service = self.catalog.find_service(name, at).await?;
        if let Some(ref s) = service {
            self.store(&cache_key, s).await;
        }
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use serde::{de::DeserializeOwned, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tariffa_core::models::TariffTier;

    fn tiered() -> Tariff {
        // first 60s billed per minute at 1.00, then per second at 0.02
        Tariff::new(vec![
            TariffTier::new(dec!(60), dec!(60), dec!(1)),
            TariffTier::new(Decimal::MAX, dec!(1), dec!(0.02)),
        ])
    }

    #[test]
    fn test_price_tiers() {
        let r = RateResolver::new();
        assert_eq!(r.price(&tiered(), dec!(0)), dec!(0));
        assert_eq!(r.price(&tiered(), dec!(1)), dec!(1));
        assert_eq!(r.price(&tiered(), dec!(60)), dec!(1));
        assert_eq!(r.price(&tiered(), dec!(90)), dec!(1.60));
        assert_eq!(r.price(&tiered(), dec!(-30)), dec!(0));
    }

    #[test]
    fn test_price_proportional_tier() {
        let r = RateResolver::new();
        let tariff = Tariff::new(vec![TariffTier {
            ceil: Some(false),
            ..TariffTier::new(Decimal::MAX, dec!(60), dec!(1.20))
        }]);
        assert_eq!(r.price(&tariff, dec!(30)), dec!(0.60));
    }

    #[test]
    fn test_price_with_offset() {
        let r = RateResolver::new();
        // 30s after 45s: crosses into the per-second tier
        assert_eq!(
            r.price_with_offset(&tiered(), dec!(30), dec!(45)),
            dec!(0.30)
        );
    }

    #[test]
    fn test_price_saturates_instead_of_overflowing() {
        let r = RateResolver::new();
        let expensive = Tariff::flat(dec!(1), dec!(10));
        let huge = dec!(10000000000000000000000000000);

        assert_eq!(r.price(&expensive, huge), Decimal::MAX);
        assert_eq!(r.price_with_offset(&expensive, huge, huge), Decimal::ZERO);

        let cheap = Tariff::flat(dec!(1), dec!(0.0000000000000000000000000001));
        assert_eq!(r.volume_for_cost(&cheap, dec!(1000)), Decimal::MAX);
    }

    #[test]
    fn test_volume_for_cost() {
        let r = RateResolver::new();
        assert_eq!(r.volume_for_cost(&tiered(), dec!(0.5)), dec!(0));
        assert_eq!(r.volume_for_cost(&tiered(), dec!(1)), dec!(60));
        assert_eq!(r.volume_for_cost(&tiered(), dec!(1.61)), dec!(90));
    }

    #[test]
    fn test_volume_for_cost_free_tier() {
        let r = RateResolver::new();
        let tariff = Tariff::new(vec![
            TariffTier::new(dec!(100), dec!(1), dec!(0)),
            TariffTier::new(Decimal::MAX, dec!(1), dec!(0.01)),
        ]);
        assert_eq!(r.volume_for_cost(&tariff, dec!(1)), dec!(200));
    }

    #[test]
    fn test_resolve_tariff_fallbacks() {
        let r = RateResolver::new();
        let gold = Tariff::flat(dec!(60), dec!(0.5));
        let rate = Rate::new("LOCAL")
            .with_tariff(UsageType::Call, tiered())
            .with_plan_tariff(UsageType::Call, "GOLD", gold.clone())
            .with_tariff(UsageType::Sms, Tariff::flat(dec!(1), dec!(0.1)));

        assert_eq!(r.resolve_tariff(&rate, UsageType::Call, Some("GOLD")).unwrap(), &gold);
        assert_eq!(r.resolve_tariff(&rate, UsageType::Call, Some("BASIC")).unwrap(), &tiered());
        assert!(r.resolve_tariff(&rate, UsageType::Sms, Some("GOLD")).is_ok());
        assert!(matches!(
            r.resolve_tariff(&rate, UsageType::Data, None),
            Err(AppError::RateNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_tariff_without_base() {
        let r = RateResolver::new();
        let mut rate = Rate::new("ROAM");
        let mut plans = std::collections::BTreeMap::new();
        plans.insert("GOLD".to_string(), Tariff::flat(dec!(1), dec!(1)));
        rate.rates.insert(UsageType::Data, RateEntry::PerPlan(plans));

        assert!(r.resolve_tariff(&rate, UsageType::Data, Some("GOLD")).is_ok());
        assert!(r.resolve_tariff(&rate, UsageType::Data, Some("BASIC")).is_err());
    }

    proptest! {
        #[test]
        fn prop_price_is_monotone(a in 0u32..100_000, b in 0u32..100_000) {
            let r = RateResolver::new();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let tariff = tiered();
            prop_assert!(r.price(&tariff, Decimal::from(lo)) <= r.price(&tariff, Decimal::from(hi)));
        }

        #[test]
        fn prop_volume_for_cost_is_affordable(cents in 0u32..1_000_000) {
            let r = RateResolver::new();
            let tariff = tiered();
            let cost = Decimal::new(cents as i64, 2);
            let volume = r.volume_for_cost(&tariff, cost);
            prop_assert!(r.price(&tariff, volume) <= cost);
        }
    }

    // Catalog caching

    struct CountingCatalog {
        rate_reads: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for CountingCatalog {
        async fn find_rate(&self, key: &str) -> AppResult<Option<Rate>> {
            self.rate_reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Rate::new(key).with_tariff(UsageType::Call, tiered())))
        }

        async fn find_plan(&self, _name: &str, _at: DateTime<Utc>) -> AppResult<Option<Plan>> {
            Ok(None)
        }

        async fn find_service(&self, _name: &str, _at: DateTime<Utc>) -> AppResult<Option<Service>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MapCache {
        entries: Mutex<HashMap<String, String>>,
        broken: bool,
    }

    #[async_trait]
    impl CacheService for MapCache {
        async fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
            if self.broken {
                return Err(AppError::CacheConnection("down".to_string()));
            }
            let raw = self.entries.lock().get(key).cloned();
            raw.map(|s| serde_json::from_str(&s).map_err(AppError::from))
                .transpose()
        }

        async fn set<T: Serialize + Send + Sync>(
            &self,
            key: &str,
            value: &T,
            _ttl_secs: u64,
        ) -> AppResult<()> {
            if self.broken {
                return Err(AppError::CacheConnection("down".to_string()));
            }
            let json = serde_json::to_string(value)?;
            self.entries.lock().insert(key.to_string(), json);
            Ok(())
        }

        async fn delete(&self, key: &str) -> AppResult<bool> {
            Ok(self.entries.lock().remove(key).is_some())
        }

        async fn exists(&self, key: &str) -> AppResult<bool> {
            Ok(self.entries.lock().contains_key(key))
        }
    }

    #[tokio::test]
    async fn test_rate_read_through_cache() {
        let catalog = Arc::new(CountingCatalog {
            rate_reads: AtomicUsize::new(0),
        });
        let service = CatalogService::new(catalog.clone(), Some(Arc::new(MapCache::default())));

        let first = service.find_rate("LOCAL").await.unwrap();
        let second = service.find_rate("LOCAL").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(catalog.rate_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_cache_degrades_to_miss() {
        let catalog = Arc::new(CountingCatalog {
            rate_reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(MapCache {
            broken: true,
            ..Default::default()
        });
        let service = CatalogService::new(catalog.clone(), Some(cache));

        assert!(service.find_rate("LOCAL").await.unwrap().is_some());
        assert!(service.find_rate("LOCAL").await.unwrap().is_some());
        assert_eq!(catalog.rate_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_cache() {
        let catalog = Arc::new(CountingCatalog {
            rate_reads: AtomicUsize::new(0),
        });
        let service: CatalogService<_, MapCache> = CatalogService::new(catalog, None);
        assert!(service.find_rate("LOCAL").await.unwrap().is_some());
        assert!(service.find_plan("BASIC", Utc::now()).await.unwrap().is_none());
    }
}
