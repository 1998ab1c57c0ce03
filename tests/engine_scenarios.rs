//! End-to-end flows through the marketplace over the in-memory ledger.

use chrono::{DateTime, Duration, TimeZone, Utc};

use estatefx::catalog::{HomeTier, UpgradeKind};
use estatefx::error::{EngineError, FailedStep};
use estatefx::ledger::{FaultyLedger, LedgerOp, LedgerStore, MemoryLedger};
use estatefx::model::{InstallStatus, Property, TransferFilter};
use estatefx::reliability::journal::Journal;
use estatefx::valuation::compute_system_value;
use estatefx::Marketplace;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

/// Put a property with an arbitrary base value straight into the store.
fn seed_property<S: LedgerStore>(store: &mut S, id: &str, owner: &str, base_value: i64) -> Property {
    let p = Property::new(id.to_string(), owner.to_string(), base_value, false, None, t0());
    store.create_property(&p).unwrap();
    store.upsert_deed(id, owner).unwrap();
    p
}

#[test]
fn starter_home_value_now_and_after_ten_months() {
    let mut m = Marketplace::new(MemoryLedger::new());
    let home = m.claim_starter_home("alice", t0()).unwrap();
    assert!(home.is_starter);
    assert_eq!(m.system_value(&home.id, t0()).unwrap(), 1500);
    assert_eq!(m.system_value(&home.id, t0() + Duration::days(300)).unwrap(), 1427);
}

#[test]
fn upgrade_lifecycle_debits_then_installs() {
    let mut m = Marketplace::new(MemoryLedger::new());
    m.store_mut().set_balance("alice", 10_000).unwrap();
    let home = m.claim_starter_home("alice", t0()).unwrap();

    let inst = m.start_upgrade("alice", &home.id, UpgradeKind::Landscaping, t0()).unwrap();
    assert_eq!(inst.cost, 500);
    assert_eq!(inst.tasks_required_total, 2);
    assert_eq!(inst.tasks_completed, 0);
    assert_eq!(inst.status, InstallStatus::Pending);
    assert_eq!(m.balance("alice").unwrap(), 9_500);
    // Nothing counts toward value until installed.
    assert_eq!(m.property(&home.id).unwrap().upgrade_spend_total, 0);

    let again = m.start_upgrade("alice", &home.id, UpgradeKind::Landscaping, t0()).unwrap_err();
    assert_eq!(again.kind(), "upgrade_in_progress");
    assert_eq!(m.balance("alice").unwrap(), 9_500);

    let first = m.complete_task(&inst.id, t0()).unwrap();
    assert_eq!(first.tasks_completed, 1);
    assert_eq!(first.status, InstallStatus::Pending);

    let done = m.complete_task(&inst.id, t0() + Duration::hours(1)).unwrap();
    assert_eq!(done.status, InstallStatus::Installed);
    assert!(done.installed_at.is_some());

    let home = m.property(&home.id).unwrap();
    assert_eq!(home.upgrade_spend_total, 500);
    assert_eq!(home.condition_bps, 10_100);
    // 1500 * 1.01 + 500 * 0.75
    assert_eq!(compute_system_value(&home, t0()), 1890);

    let err = m.complete_task(&inst.id, t0()).unwrap_err();
    assert_eq!(err.kind(), "already_installed");
    let err = m.start_upgrade("alice", &home.id, UpgradeKind::Landscaping, t0()).unwrap_err();
    assert_eq!(err.kind(), "already_installed");
    assert!(m
        .available_upgrades(&home.id)
        .unwrap()
        .iter()
        .all(|d| d.kind != UpgradeKind::Landscaping));
}

#[test]
fn upgrade_without_funds_changes_nothing() {
    let mut m = Marketplace::new(MemoryLedger::new());
    m.store_mut().set_balance("alice", 100).unwrap();
    let home = m.claim_starter_home("alice", t0()).unwrap();
    let err = m.start_upgrade("alice", &home.id, UpgradeKind::SolarPanels, t0()).unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientFunds { user_id: "alice".to_string(), needed: 3000, available: 100 }
    );
    assert!(m.installations(&home.id).unwrap().is_empty());
}

#[test]
fn listing_cap_is_115_percent_of_value() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "seller", 1000);

    let err = m.list_for_sale("seller", "p-1", 1200, t0()).unwrap_err();
    assert_eq!(err, EngineError::ExceedsListingCap { ask_price: 1200, cap: 1150 });
    assert!(!m.property("p-1").unwrap().is_listed);

    let listed = m.list_for_sale("seller", "p-1", 1150, t0()).unwrap();
    assert!(listed.is_listed);
    assert_eq!(listed.ask_price, Some(1150));
}

#[test]
fn sale_splits_price_between_seller_and_fee_pool() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("buyer", 1000).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();

    let transfer = m.buy_listed_property("buyer", &listing, t0()).unwrap();
    assert_eq!(transfer.sale_price, 1000);
    assert_eq!(transfer.deed_fee, 100);
    assert_eq!(transfer.seller_net, 900);
    assert_eq!(transfer.system_value_at_sale, 1000);
    assert_eq!(transfer.prev_hash, "");

    assert_eq!(m.balance("buyer").unwrap(), 0);
    assert_eq!(m.balance("seller").unwrap(), 900);
    assert_eq!(m.fee_pool_balance().unwrap(), 100);

    let sold = m.property("p-1").unwrap();
    assert_eq!(sold.owner_id, "buyer");
    assert!(!sold.is_listed);
    assert_eq!(sold.ask_price, None);
    assert_eq!(m.deed("p-1").unwrap().owner_id, "buyer");

    let history = m.deed_transfers(&TransferFilter::default()).unwrap();
    assert_eq!(history, vec![transfer]);
}

#[test]
fn starter_home_sold_frees_a_new_claim() {
    let mut m = Marketplace::new(MemoryLedger::new());
    let home = m.claim_starter_home("alice", t0()).unwrap();
    let listing = m.list_for_sale("alice", &home.id, 1500, t0()).unwrap();
    m.store_mut().set_balance("bob", 2_000).unwrap();
    m.buy_listed_property("bob", &listing, t0()).unwrap();

    assert!(!m.property(&home.id).unwrap().is_starter);
    assert!(m.claim_starter_home("alice", t0()).is_ok());
    assert!(m.claim_starter_home("bob", t0()).is_ok());
}

#[test]
fn second_buyer_of_same_listing_loses() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("b1", 5_000).unwrap();
    m.store_mut().set_balance("b2", 5_000).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();

    m.buy_listed_property("b1", &listing, t0()).unwrap();
    let err = m.buy_listed_property("b2", &listing, t0()).unwrap_err();
    assert_eq!(err.kind(), "no_longer_listed");
    assert_eq!(m.balance("b2").unwrap(), 5_000);

    // The winner retrying with the same view already owns it.
    let err = m.buy_listed_property("b1", &listing, t0()).unwrap_err();
    assert_eq!(err.kind(), "already_owned");
}

#[test]
fn owner_cannot_buy_own_listing() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("seller", 5_000).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();
    let err = m.buy_listed_property("seller", &listing, t0()).unwrap_err();
    assert_eq!(err.kind(), "already_owned");
    assert_eq!(m.fee_pool_balance().unwrap(), 0);
}

#[test]
fn buyer_short_of_ask_keeps_coins() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("buyer", 999).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();
    let err = m.buy_listed_property("buyer", &listing, t0()).unwrap_err();
    assert_eq!(err.kind(), "insufficient_funds");
    assert_eq!(m.balance("buyer").unwrap(), 999);
    assert!(m.property("p-1").unwrap().is_listed);
}

#[test]
fn failed_transfer_append_rolls_the_whole_sale_back() {
    let store = FaultyLedger::new(MemoryLedger::new());
    let mut m = Marketplace::new(store);
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("buyer", 1000).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();

    m.store_mut().failing.push(LedgerOp::AppendTransfer);
    let err = m.buy_listed_property("buyer", &listing, t0()).unwrap_err();
    assert_eq!(err.kind(), "store");
    assert!(err.is_recoverable());

    assert_eq!(m.balance("buyer").unwrap(), 1000);
    assert_eq!(m.balance("seller").unwrap(), 0);
    assert_eq!(m.fee_pool_balance().unwrap(), 0);
    assert_eq!(m.property("p-1").unwrap().owner_id, "seller");
    assert_eq!(m.deed("p-1").unwrap().owner_id, "seller");

    m.store_mut().heal();
    assert!(m.buy_listed_property("buyer", &listing, t0()).is_ok());
}

#[test]
fn failed_rollback_after_debit_is_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("estate.journal");
    let journal_path = journal_path.to_str().unwrap();

    let store = FaultyLedger::new(MemoryLedger::new());
    let mut m = Marketplace::new(store).with_journal(Journal::open(journal_path).unwrap());
    seed_property(m.store_mut(), "p-1", "seller", 1000);
    m.store_mut().set_balance("buyer", 1000).unwrap();
    let listing = m.list_for_sale("seller", "p-1", 1000, t0()).unwrap();

    m.store_mut().failing.push(LedgerOp::CreditFeePool);
    m.store_mut().failing.push(LedgerOp::Rollback);
    let err = m.buy_listed_property("buyer", &listing, t0()).unwrap_err();
    assert!(!err.is_recoverable());
    match &err {
        EngineError::PartialFailureAfterDebit(p) => {
            assert_eq!(p.buyer_id, "buyer");
            assert_eq!(p.seller_id.as_deref(), Some("seller"));
            assert_eq!(p.property_id.as_deref(), Some("p-1"));
            assert_eq!(p.amount, 1000);
            assert_eq!(p.step, FailedStep::CreditFeePool);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    let open = Journal::open_incidents(journal_path).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].failure.step, FailedStep::CreditFeePool);
    assert_eq!(open[0].failure.amount, 1000);
}

#[test]
fn partial_failure_on_tier_purchase_names_the_step() {
    let store = FaultyLedger::new(MemoryLedger::new())
        .fail(LedgerOp::CreateProperty)
        .fail(LedgerOp::Rollback);
    let mut m = Marketplace::new(store);
    m.store_mut().set_balance("alice", 5_000).unwrap();
    match m.buy_tiered_home("alice", HomeTier::Cottage, t0()) {
        Err(EngineError::PartialFailureAfterDebit(p)) => {
            assert_eq!(p.step, FailedStep::CreateProperty);
            assert_eq!(p.amount, 5_000);
            assert_eq!(p.seller_id, None);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
}

#[test]
fn failure_before_debit_is_never_partial() {
    let store = FaultyLedger::new(MemoryLedger::new())
        .fail(LedgerOp::CreateProperty)
        .fail(LedgerOp::Rollback);
    let mut m = Marketplace::new(store);
    let err = m.claim_starter_home("alice", t0()).unwrap_err();
    assert_eq!(err.kind(), "store");
}

#[test]
fn transfer_history_filters_and_chains() {
    let mut m = Marketplace::new(MemoryLedger::new());
    seed_property(m.store_mut(), "p-1", "alice", 1000);
    seed_property(m.store_mut(), "p-2", "alice", 2000);
    m.store_mut().set_balance("bob", 10_000).unwrap();
    m.store_mut().set_balance("carol", 10_000).unwrap();

    let l1 = m.list_for_sale("alice", "p-1", 1000, t0()).unwrap();
    let first = m.buy_listed_property("bob", &l1, t0()).unwrap();
    let l2 = m.list_for_sale("alice", "p-2", 2000, t0()).unwrap();
    let second = m.buy_listed_property("carol", &l2, t0() + Duration::days(1)).unwrap();
    let l3 = m.list_for_sale("bob", "p-1", 1100, t0()).unwrap();
    let third = m.buy_listed_property("carol", &l3, t0() + Duration::days(2)).unwrap();

    assert_eq!(second.prev_hash, first.record_hash);
    assert_eq!(third.prev_hash, second.record_hash);
    assert_eq!(m.audit_transfers().unwrap(), 3);

    let all = m.deed_transfers(&TransferFilter::default()).unwrap();
    assert_eq!(all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec![
        third.id.as_str(),
        second.id.as_str(),
        first.id.as_str()
    ]);

    let by_carol = TransferFilter { buyer_id: Some("carol".to_string()), ..Default::default() };
    assert_eq!(m.deed_transfers(&by_carol).unwrap().len(), 2);

    let pricey = TransferFilter { min_price: Some(1500), ..Default::default() };
    assert_eq!(m.deed_transfers(&pricey).unwrap(), vec![second.clone()]);

    let window = TransferFilter {
        start: Some(t0() + Duration::hours(12)),
        end: Some(t0() + Duration::days(1)),
        ..Default::default()
    };
    assert_eq!(m.deed_transfers(&window).unwrap(), vec![second]);

    // 100 + 200 + 110
    assert_eq!(m.fee_pool_balance().unwrap(), 410);
}
