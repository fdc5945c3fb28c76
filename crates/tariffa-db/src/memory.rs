//! In-memory stores
//!
//! Implement the same traits as the Postgres stores, with the same
//! conditioned-update semantics, for tests and local runs. Documents are
//! guarded by `parking_lot` locks; no lock is held across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tariffa_core::{
    models::{
        Balance, BalanceKey, BalanceSnapshot, BalanceUpdate, CycleOperation, CycleRecord,
        PeriodKey, Plan, PricedLine, Rate, Service,
    },
    traits::{BalanceStore, BalanceWrite, Catalog, CycleStore, LineStore, UpdateOutcome},
    AppError, AppResult,
};
use tracing::debug;
use uuid::Uuid;

/// In-memory balance documents
#[derive(Default)]
pub struct MemoryBalanceStore {
    docs: RwLock<HashMap<Uuid, Balance>>,
    writes: AtomicU64,
    injected_conflicts: AtomicU32,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a balance document
    pub fn insert(&self, balance: Balance) -> Uuid {
        let id = balance.id;
        self.docs.write().insert(id, balance);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Balance> {
        self.docs.read().get(&id).cloned()
    }

    /// Number of applied conditioned updates
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` conditioned updates report a conflict without writing
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn load(&self, key: &BalanceKey) -> AppResult<Option<Balance>> {
        Ok(self
            .docs
            .read()
            .values()
            .find(|b| b.key() == *key)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Balance>> {
        Ok(self.get(id))
    }

    async fn create(&self, balance: &Balance) -> AppResult<Balance> {
        let mut docs = self.docs.write();
        if docs.values().any(|b| b.key() == balance.key()) {
            return Err(AppError::Database(format!(
                "Balance {} already exists",
                balance.key()
            )));
        }
        docs.insert(balance.id, balance.clone());
        Ok(balance.clone())
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &BalanceSnapshot,
        update: &BalanceUpdate,
    ) -> AppResult<UpdateOutcome> {
        if self.take_injected_conflict() {
            debug!("Injected conflict on balance {}", id);
            return Ok(UpdateOutcome::Conflict);
        }

        let mut docs = self.docs.write();
        let balance = docs
            .get_mut(&id)
            .ok_or_else(|| AppError::BalanceNotFound(id.to_string()))?;

        if balance.snapshot() != *expected {
            return Ok(UpdateOutcome::Conflict);
        }

        balance.apply(update);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(UpdateOutcome::Applied)
    }

    async fn conditional_update_all(&self, writes: &[BalanceWrite]) -> AppResult<UpdateOutcome> {
        if self.take_injected_conflict() {
            debug!("Injected conflict on {} balances", writes.len());
            return Ok(UpdateOutcome::Conflict);
        }

        let mut docs = self.docs.write();
        for write in writes {
            let balance = docs
                .get(&write.id)
                .ok_or_else(|| AppError::BalanceNotFound(write.id.to_string()))?;
            if balance.snapshot() != write.expected {
                return Ok(UpdateOutcome::Conflict);
            }
        }

        for write in writes {
            if let Some(balance) = docs.get_mut(&write.id) {
                balance.apply(&write.update);
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn clear_tx(&self, id: Uuid, stamp: &str) -> AppResult<bool> {
        Ok(self
            .docs
            .write()
            .get_mut(&id)
            .map_or(false, |b| b.tx.remove(stamp).is_some()))
    }
}

/// In-memory catalog
#[derive(Default)]
pub struct MemoryCatalog {
    rates: RwLock<HashMap<String, Rate>>,
    plans: RwLock<Vec<Plan>>,
    services: RwLock<Vec<Service>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(self, rate: Rate) -> Self {
        self.rates.write().insert(rate.key.clone(), rate);
        self
    }

    pub fn with_plan(self, plan: Plan) -> Self {
        self.plans.write().push(plan);
        self
    }

    pub fn with_service(self, service: Service) -> Self {
        self.services.write().push(service);
        self
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_rate(&self, key: &str) -> AppResult<Option<Rate>> {
        Ok(self.rates.read().get(key).cloned())
    }

    async fn find_plan(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Plan>> {
        Ok(self
            .plans
            .read()
            .iter()
            .filter(|p| p.name == name && p.is_effective_at(at))
            .max_by_key(|p| p.from)
            .cloned())
    }

    async fn find_service(&self, name: &str, at: DateTime<Utc>) -> AppResult<Option<Service>> {
        Ok(self
            .services
            .read()
            .iter()
            .filter(|s| s.name == name && s.is_effective_at(at))
            .max_by_key(|s| s.from)
            .cloned())
    }
}

fn in_session(line: &PricedLine, sid: i64, session_id: Option<&str>) -> bool {
    line.sid == sid && line.session_id.as_deref() == session_id
}

/// In-memory archived and live lines
#[derive(Default)]
pub struct MemoryLineStore {
    archive: RwLock<Vec<PricedLine>>,
    live: RwLock<Vec<PricedLine>>,
}

impl MemoryLineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_archived(&self, line: PricedLine) {
        self.archive.write().push(line);
    }

    pub fn insert_live(&self, line: PricedLine) {
        self.live.write().push(line);
    }

    pub fn archived(&self, id: Uuid) -> Option<PricedLine> {
        self.archive.read().iter().find(|l| l.id == id).cloned()
    }

    pub fn live(&self, sid: i64, session_id: Option<&str>) -> Vec<PricedLine> {
        self.live
            .read()
            .iter()
            .filter(|l| in_session(l, sid, session_id))
            .cloned()
            .collect()
    }

    fn usage(lines: &[PricedLine], sid: i64, session_id: Option<&str>) -> Decimal {
        lines
            .iter()
            .filter(|l| in_session(l, sid, session_id))
            .map(PricedLine::effective_usagev)
            .sum()
    }
}

#[async_trait]
impl LineStore for MemoryLineStore {
    async fn last_archived_in_session(
        &self,
        sid: i64,
        session_id: Option<&str>,
    ) -> AppResult<Option<PricedLine>> {
        Ok(self
            .archive
            .read()
            .iter()
            .filter(|l| in_session(l, sid, session_id))
            .max_by_key(|l| l.urt)
            .cloned())
    }

    async fn archived_session_usage(&self, sid: i64, session_id: Option<&str>) -> AppResult<Decimal> {
        Ok(Self::usage(&self.archive.read(), sid, session_id))
    }

    async fn live_session_usage(&self, sid: i64, session_id: Option<&str>) -> AppResult<Decimal> {
        Ok(Self::usage(&self.live.read(), sid, session_id))
    }

    async fn correct_archived(
        &self,
        line_id: Uuid,
        deltas: &BTreeMap<String, Decimal>,
    ) -> AppResult<()> {
        let mut archive = self.archive.write();
        let line = archive
            .iter_mut()
            .find(|l| l.id == line_id)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown archived line {}", line_id)))?;
        line.apply_corrections(deltas);
        Ok(())
    }

    async fn correct_live(
        &self,
        sid: i64,
        session_id: Option<&str>,
        deltas: &BTreeMap<String, Decimal>,
    ) -> AppResult<u64> {
        let mut touched = 0;
        for line in self
            .live
            .write()
            .iter_mut()
            .filter(|l| in_session(l, sid, session_id))
        {
            line.apply_corrections(deltas);
            touched += 1;
        }
        Ok(touched)
    }
}

#[derive(Debug, Clone)]
struct OperationEntry {
    operation: CycleOperation,
    ended_at: Option<DateTime<Utc>>,
}

/// In-memory billing cycle markers
#[derive(Default)]
pub struct MemoryCycleStore {
    records: Mutex<HashMap<PeriodKey, CycleRecord>>,
    operations: Mutex<HashMap<Uuid, OperationEntry>>,
    accounts: AtomicU64,
}

impl MemoryCycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the account count reported for every period
    pub fn set_account_count(&self, count: u64) {
        self.accounts.store(count, Ordering::SeqCst);
    }

    /// Insert a record directly
    pub fn insert(&self, record: CycleRecord) {
        self.records.lock().insert(record.key, record);
    }
}

#[async_trait]
impl CycleStore for MemoryCycleStore {
    async fn load(&self, key: PeriodKey) -> AppResult<Option<CycleRecord>> {
        Ok(self.records.lock().get(&key).cloned())
    }

    async fn try_start(
        &self,
        key: PeriodKey,
        batches_total: u32,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut records = self.records.lock();
        if records.get(&key).map_or(false, |r| r.running) {
            return Ok(false);
        }
        records.insert(key, CycleRecord::started(key, batches_total, at));
        Ok(true)
    }

    async fn complete_batch(&self, key: PeriodKey, at: DateTime<Utc>) -> AppResult<CycleRecord> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&key)
            .ok_or_else(|| AppError::cycle_state(key, "no run in progress"))?;
        record.complete_batch(at);
        Ok(record.clone())
    }

    async fn mark_confirmed(
        &self,
        key: PeriodKey,
        invoices: Option<&[i64]>,
        at: DateTime<Utc>,
    ) -> AppResult<CycleRecord> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&key)
            .ok_or_else(|| AppError::cycle_state(key, "cycle was never run"))?;
        record.confirm(invoices, at);
        Ok(record.clone())
    }

    async fn discard(&self, key: PeriodKey) -> AppResult<()> {
        self.records.lock().remove(&key);
        Ok(())
    }

    async fn account_count(&self, _key: PeriodKey) -> AppResult<u64> {
        Ok(self.accounts.load(Ordering::SeqCst))
    }

    async fn begin_operation(
        &self,
        operation: CycleOperation,
        _key: Option<PeriodKey>,
        _at: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        self.operations.lock().insert(
            id,
            OperationEntry {
                operation,
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn finish_operation(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(entry) = self.operations.lock().get_mut(&id) {
            entry.ended_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn operations_in_flight(&self, operations: &[CycleOperation]) -> AppResult<usize> {
        Ok(self
            .operations
            .lock()
            .values()
            .filter(|e| e.ended_at.is_none() && operations.contains(&e.operation))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tariffa_core::models::{ChargingType, PricingResult, UsageType};

    fn balance() -> Balance {
        Balance::new(
            BalanceKey::new(9, 1, PeriodKey::new(2024, 5).unwrap()),
            ChargingType::Postpaid,
        )
    }

    fn update(stamp: &str) -> BalanceUpdate {
        BalanceUpdate {
            usage_type: Some(UsageType::Call),
            usagev: dec!(30),
            cost: dec!(0.5),
            count: 1,
            groups: Vec::new(),
            tx: Some((stamp.to_string(), PricingResult::default())),
        }
    }

    #[tokio::test]
    async fn test_conditional_update_detects_stale_snapshot() {
        let store = MemoryBalanceStore::new();
        let b = balance();
        let id = store.insert(b.clone());
        let stale = b.snapshot();

        assert_eq!(
            store.conditional_update(id, &stale, &update("a")).await.unwrap(),
            UpdateOutcome::Applied
        );
        assert_eq!(
            store.conditional_update(id, &stale, &update("b")).await.unwrap(),
            UpdateOutcome::Conflict
        );
        assert_eq!(store.write_count(), 1);

        let stored = store.get(id).unwrap();
        assert!(stored.tx_entry("a").is_some());
        assert!(stored.tx_entry("b").is_none());
        assert!(store.clear_tx(id, "a").await.unwrap());
        assert!(!store.clear_tx(id, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_conflicts_do_not_write() {
        let store = MemoryBalanceStore::new();
        let b = balance();
        let id = store.insert(b.clone());
        store.inject_conflicts(2);

        for _ in 0..2 {
            assert_eq!(
                store
                    .conditional_update(id, &b.snapshot(), &update("a"))
                    .await
                    .unwrap(),
                UpdateOutcome::Conflict
            );
        }
        assert_eq!(store.write_count(), 0);
        assert_eq!(
            store
                .conditional_update(id, &b.snapshot(), &update("a"))
                .await
                .unwrap(),
            UpdateOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_multi_balance_write_is_all_or_nothing() {
        let store = MemoryBalanceStore::new();
        let own = balance();
        let shared = Balance::new(
            BalanceKey::shared(1, PeriodKey::new(2024, 5).unwrap()),
            ChargingType::Postpaid,
        );
        store.insert(own.clone());
        store.insert(shared.clone());

        // the shared balance moved since it was read
        store
            .conditional_update(shared.id, &shared.snapshot(), &update("other"))
            .await
            .unwrap();

        let writes = vec![
            BalanceWrite {
                id: own.id,
                expected: own.snapshot(),
                update: update("a"),
            },
            BalanceWrite {
                id: shared.id,
                expected: shared.snapshot(),
                update: update("a"),
            },
        ];
        assert_eq!(
            store.conditional_update_all(&writes).await.unwrap(),
            UpdateOutcome::Conflict
        );
        assert!(store.get(own.id).unwrap().tx_entry("a").is_none());
        assert_eq!(store.write_count(), 1);

        let fresh = store.get(shared.id).unwrap();
        let writes = vec![
            writes[0].clone(),
            BalanceWrite {
                expected: fresh.snapshot(),
                ..writes[1].clone()
            },
        ];
        assert_eq!(
            store.conditional_update_all(&writes).await.unwrap(),
            UpdateOutcome::Applied
        );
        assert!(store.get(own.id).unwrap().tx_entry("a").is_some());
        assert!(store.get(shared.id).unwrap().tx_entry("a").is_some());
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_key() {
        let store = MemoryBalanceStore::new();
        let b = balance();
        store.create(&b).await.unwrap();
        let mut dup = b.clone();
        dup.id = Uuid::new_v4();
        assert!(store.create(&dup).await.is_err());
        assert!(store.load(&b.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_line_corrections() {
        let store = MemoryLineStore::new();
        let mut line = PricedLine::from_event(
            &tariffa_core::models::UsageEvent {
                stamp: "s1".to_string(),
                sid: 4,
                aid: 1,
                session_id: Some("sess".to_string()),
                ..Default::default()
            },
            &PricingResult::flat(dec!(100), dec!(0)),
        );
        let id = line.id;
        store.insert_archived(line.clone());
        line.id = Uuid::new_v4();
        store.insert_live(line);

        let mut deltas = BTreeMap::new();
        deltas.insert("rebalance_usagev".to_string(), dec!(-40));
        store.correct_archived(id, &deltas).await.unwrap();
        let touched = store.correct_live(4, Some("sess"), &deltas).await.unwrap();

        assert_eq!(touched, 1);
        assert_eq!(
            store.archived_session_usage(4, Some("sess")).await.unwrap(),
            dec!(60)
        );
        assert_eq!(
            store.live_session_usage(4, Some("sess")).await.unwrap(),
            dec!(60)
        );
        assert_eq!(store.live_session_usage(4, None).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_operations_in_flight() {
        let store = MemoryCycleStore::new();
        let now = Utc::now();
        let op = store
            .begin_operation(CycleOperation::Confirm, None, now)
            .await
            .unwrap();

        assert_eq!(
            store
                .operations_in_flight(&[CycleOperation::Confirm, CycleOperation::Charge])
                .await
                .unwrap(),
            1
        );
        store.finish_operation(op, now).await.unwrap();
        assert_eq!(
            store
                .operations_in_flight(&[CycleOperation::Confirm])
                .await
                .unwrap(),
            0
        );
    }
}
