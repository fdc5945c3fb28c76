//! Real-time session rebalancing through the pricing engine

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tariffa_core::{
    config::{PrepaidConfig, PricingConfig},
    models::{
        Balance, BalanceKey, BalanceType, BalanceUpdate, ChargingType, GroupCharge, LedgerEntry,
        PeriodKey, Plan, PricedLine, Rate, RecordType, Tariff, UsageEvent, UsageType,
    },
    traits::LineStore,
};
use tariffa_db::{MemoryBalanceStore, MemoryCatalog, MemoryLineStore};
use tariffa_services::{MonthlyCalendar, PricingEngine};
use uuid::Uuid;

const SESSION: &str = "sess-1";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
}

fn key(sid: i64) -> BalanceKey {
    BalanceKey::new(sid, 1, PeriodKey::new(2024, 3).unwrap())
}

/// Prepaid balance that already paid for 100 seconds
fn charged_balance(sid: i64) -> Balance {
    let mut balance =
        Balance::new(key(sid), ChargingType::Prepaid).with_allowance(BalanceType::Cost, dec!(10));
    balance.apply(&BalanceUpdate {
        usage_type: Some(UsageType::Call),
        usagev: dec!(100),
        cost: dec!(1.00),
        count: 1,
        ..Default::default()
    });
    balance
}

fn granted_line(sid: i64, balance_ref: Uuid) -> PricedLine {
    PricedLine {
        id: Uuid::new_v4(),
        stamp: "grant-1".to_string(),
        sid,
        aid: 1,
        session_id: Some(SESSION.to_string()),
        usage_type: UsageType::Call,
        rate_ref: "LOCAL".to_string(),
        plan: "PRE".to_string(),
        urt: start(),
        usagev: dec!(100),
        aprice: dec!(1.00),
        balance_ref: Some(balance_ref),
        in_group: None,
        out_group: Some(dec!(100)),
        arategroups: Vec::new(),
        corrections: BTreeMap::new(),
    }
}

struct Session {
    engine: PricingEngine,
    balances: Arc<MemoryBalanceStore>,
    lines: Arc<MemoryLineStore>,
    archived: Uuid,
    own: Uuid,
    other: Uuid,
}

fn session(prepaid: PrepaidConfig) -> Session {
    let catalog = MemoryCatalog::new()
        .with_rate(Rate::new("LOCAL").with_tariff(UsageType::Call, Tariff::flat(dec!(1), dec!(0.01))))
        .with_plan(Plan {
            name: "PRE".to_string(),
            charging: ChargingType::Prepaid,
            ..Default::default()
        });

    let balances = Arc::new(MemoryBalanceStore::new());
    let own = balances.insert(charged_balance(40));
    let other = balances.insert(charged_balance(41));

    let lines = Arc::new(MemoryLineStore::new());
    let line = granted_line(40, own);
    let archived = line.id;
    lines.insert_archived(line.clone());
    lines.insert_live(PricedLine {
        id: Uuid::new_v4(),
        ..line
    });

    let engine = PricingEngine::new(
        Arc::new(catalog),
        balances.clone(),
        lines.clone(),
        Arc::new(MonthlyCalendar::default()),
        PricingConfig::default(),
        prepaid,
    );
    Session {
        engine,
        balances,
        lines,
        archived,
        own,
        other,
    }
}

fn update(stamp: &str, volume: Decimal, reported: Option<Decimal>, record_type: RecordType) -> UsageEvent {
    UsageEvent {
        stamp: stamp.to_string(),
        sid: 40,
        aid: 1,
        usage_type: UsageType::Call,
        volume,
        rate_ref: "LOCAL".to_string(),
        plan: "PRE".to_string(),
        session_id: Some(SESSION.to_string()),
        realtime: true,
        record_type: Some(record_type),
        urt: start() + Duration::seconds(100),
        reported_usage: reported,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_over_grant_is_credited_before_pricing() {
    let s = session(PrepaidConfig::default());

    let result = s
        .engine
        .price(&update("upd-1", dec!(30), Some(dec!(60)), RecordType::Update))
        .await
        .unwrap();

    // offset is the live 100 minus the 40 credited
    assert_eq!(result.usage_offset, dec!(60));
    assert_eq!(result.usagev, dec!(30));
    assert_eq!(result.aprice, dec!(0.30));

    let own = s.balances.get(s.own).unwrap();
    let totals = own.usage_totals(UsageType::Call);
    assert_eq!(totals.usagev, dec!(90));
    assert_eq!(totals.count, 2);
    assert_eq!(own.cost, dec!(0.90));
    assert!(own.tx_entry("rebalance_upd-1").is_some());

    let other = s.balances.get(s.other).unwrap();
    assert_eq!(other.usage_totals(UsageType::Call).usagev, dec!(100));
    assert_eq!(other.cost, dec!(1.00));

    let line = s.lines.archived(s.archived).unwrap();
    assert_eq!(line.correction("usagev"), dec!(-40));
    assert_eq!(line.correction("aprice"), dec!(-0.40));
    assert_eq!(line.correction("out_group"), dec!(-40));
    assert_eq!(line.effective_usagev(), dec!(60));

    let live = s.lines.live(40, Some(SESSION));
    assert_eq!(live[0].correction("usagev"), dec!(-40));
    assert_eq!(live[0].correction("out_group"), dec!(0));
}

#[tokio::test]
async fn test_rebalance_is_not_repeated() {
    let s = session(PrepaidConfig::default());
    let event = update("upd-1", dec!(0), Some(dec!(60)), RecordType::Update);

    let outcome = s.engine.rebalancer().rebalance(&event).await.unwrap().unwrap();
    assert_eq!(outcome.charged, dec!(100));
    assert_eq!(outcome.diff, dec!(-40));
    assert_eq!(outcome.cost_delta, dec!(-0.40));
    assert_eq!(outcome.live_lines, 1);

    // the archived line now reflects the reported usage
    assert!(s.engine.rebalancer().rebalance(&event).await.unwrap().is_none());
    let own = s.balances.get(s.own).unwrap();
    assert_eq!(own.usage_totals(UsageType::Call).usagev, dec!(60));
    assert_eq!(s.balances.write_count(), 1);
}

#[tokio::test]
async fn test_no_credit_when_usage_matches() {
    let s = session(PrepaidConfig::default());
    let event = update("upd-1", dec!(30), Some(dec!(100)), RecordType::Update);

    let result = s.engine.price(&event).await.unwrap();
    assert_eq!(result.usage_offset, dec!(100));

    let line = s.lines.archived(s.archived).unwrap();
    assert!(line.corrections.is_empty());
}

#[tokio::test]
async fn test_missing_reported_usage_skips_rebalance() {
    let s = session(PrepaidConfig::default());

    let result = s
        .engine
        .price(&update("upd-1", dec!(30), None, RecordType::Update))
        .await
        .unwrap();
    assert_eq!(result.usage_offset, dec!(100));
    assert_eq!(
        s.lines.archived_session_usage(40, Some(SESSION)).await.unwrap(),
        dec!(100)
    );
}

#[tokio::test]
async fn test_final_only_waits_for_final_record() {
    let s = session(PrepaidConfig {
        rebalance_on_final: true,
        ..Default::default()
    });

    s.engine
        .price(&update("upd-1", dec!(10), Some(dec!(60)), RecordType::Update))
        .await
        .unwrap();
    let line = s.lines.archived(s.archived).unwrap();
    assert!(line.corrections.is_empty());

    let outcome = s
        .engine
        .rebalancer()
        .rebalance(&update("fin-1", dec!(0), Some(dec!(60)), RecordType::Final))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.charged, dec!(100));
    assert_eq!(outcome.diff, dec!(-40));
}

fn consumed(group: &str, covered: Decimal, balance_id: Uuid) -> LedgerEntry {
    LedgerEntry {
        group: group.to_string(),
        balance_type: BalanceType::Usagev,
        amount: covered,
        covered,
        left: Decimal::ZERO,
        total: Some(dec!(100)),
        balance_id,
    }
}

fn group_use(usage_type: Option<UsageType>, usagev: Decimal, groups: &[(&str, Decimal)]) -> BalanceUpdate {
    BalanceUpdate {
        usage_type,
        usagev: if usage_type.is_some() { usagev } else { Decimal::ZERO },
        count: 1,
        groups: groups
            .iter()
            .map(|(group, amount)| GroupCharge {
                group: group.to_string(),
                balance_type: BalanceType::Usagev,
                amount: *amount,
            })
            .collect(),
        ..Default::default()
    }
}

/// Postpaid session whose grant was fully covered by groups
struct GroupSession {
    engine: PricingEngine,
    balances: Arc<MemoryBalanceStore>,
    lines: Arc<MemoryLineStore>,
    line: Uuid,
}

fn group_session(sid: i64, balances: Arc<MemoryBalanceStore>, line: PricedLine) -> GroupSession {
    let catalog = MemoryCatalog::new()
        .with_rate(Rate::new("LOCAL").with_tariff(UsageType::Call, Tariff::flat(dec!(1), dec!(0.01))));
    let lines = Arc::new(MemoryLineStore::new());
    let id = line.id;
    lines.insert_archived(PricedLine { sid, ..line });

    let engine = PricingEngine::new(
        Arc::new(catalog),
        balances.clone(),
        lines.clone(),
        Arc::new(MonthlyCalendar::default()),
        PricingConfig::default(),
        PrepaidConfig::default(),
    );
    GroupSession {
        engine,
        balances,
        lines,
        line: id,
    }
}

fn final_report(sid: i64, stamp: &str, reported: Decimal) -> UsageEvent {
    UsageEvent {
        sid,
        plan: "BASIC".to_string(),
        ..update(stamp, dec!(0), Some(reported), RecordType::Final)
    }
}

#[tokio::test]
async fn test_in_group_credit_returns_to_its_group() {
    let balances = Arc::new(MemoryBalanceStore::new());
    let mut balance = Balance::new(key(50), ChargingType::Postpaid);
    balance.apply(&group_use(Some(UsageType::Call), dec!(100), &[("MINUTES", dec!(100))]));
    let own = balances.insert(balance);

    let s = group_session(
        50,
        balances,
        PricedLine {
            aprice: dec!(0),
            in_group: Some(dec!(100)),
            out_group: None,
            arategroups: vec![consumed("MINUTES", dec!(100), own)],
            ..granted_line(50, own)
        },
    );

    let outcome = s
        .engine
        .rebalancer()
        .rebalance(&final_report(50, "fin-1", dec!(60)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.diff, dec!(-40));
    // the line was never charged in money
    assert_eq!(outcome.cost_delta, dec!(0));

    let balance = s.balances.get(own).unwrap();
    assert_eq!(balance.usage_totals(UsageType::Call).usagev, dec!(60));
    assert_eq!(balance.groups["MINUTES"].usagev, dec!(60));
    assert_eq!(balance.cost, dec!(0));

    let line = s.lines.archived(s.line).unwrap();
    assert_eq!(line.correction("in_group"), dec!(-40));
    assert_eq!(line.correction("out_group"), dec!(0));
}

#[tokio::test]
async fn test_shared_group_credit_lands_on_account_balance() {
    let balances = Arc::new(MemoryBalanceStore::new());
    let mut balance = Balance::new(key(51), ChargingType::Postpaid);
    balance.apply(&group_use(Some(UsageType::Call), dec!(80), &[("PERSONAL", dec!(50))]));
    let own = balances.insert(balance);
    let mut shared = Balance::new(
        BalanceKey::shared(1, PeriodKey::new(2024, 3).unwrap()),
        ChargingType::Postpaid,
    );
    shared.apply(&group_use(None, dec!(0), &[("SHARED", dec!(30))]));
    let shared = balances.insert(shared);

    let s = group_session(
        51,
        balances,
        PricedLine {
            usagev: dec!(80),
            aprice: dec!(0),
            in_group: Some(dec!(80)),
            out_group: None,
            arategroups: vec![
                consumed("PERSONAL", dec!(50), own),
                consumed("SHARED", dec!(30), shared),
            ],
            ..granted_line(51, own)
        },
    );

    s.engine
        .rebalancer()
        .rebalance(&final_report(51, "fin-2", dec!(40)))
        .await
        .unwrap()
        .unwrap();

    // the pool consumed last is returned first
    let account = s.balances.get(shared).unwrap();
    assert_eq!(account.groups["SHARED"].usagev, dec!(0));
    assert!(account.tx_entry("rebalance_fin-2").is_some());
    assert!(account.totals.is_empty());

    let balance = s.balances.get(own).unwrap();
    assert_eq!(balance.groups["PERSONAL"].usagev, dec!(40));
    assert_eq!(balance.usage_totals(UsageType::Call).usagev, dec!(40));
    assert_eq!(s.balances.write_count(), 2);

    // the credit is applied once
    assert!(s
        .engine
        .rebalancer()
        .rebalance(&final_report(51, "fin-2", dec!(40)))
        .await
        .unwrap()
        .is_none());
    assert_eq!(s.balances.write_count(), 2);
}
