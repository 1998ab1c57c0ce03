//! Marketplace over the SQLite ledger, including two connections racing
//! for one listing.

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use estatefx::catalog::{HomeTier, UpgradeKind};
use estatefx::ledger::{LedgerStore, SqliteLedger};
use estatefx::model::{InstallStatus, TransferFilter};
use estatefx::Marketplace;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 10, 8, 30, 0).unwrap()
}

fn db(dir: &TempDir) -> String {
    dir.path().join("estate.sqlite").to_str().unwrap().to_string()
}

fn open(path: &str) -> Marketplace<SqliteLedger> {
    Marketplace::new(SqliteLedger::open(path).unwrap())
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db(&dir);

    let (home, inst) = {
        let mut m = open(&path);
        m.store_mut().set_balance("alice", 10_000).unwrap();
        let home = m.claim_starter_home("alice", t0()).unwrap();
        let inst = m.start_upgrade("alice", &home.id, UpgradeKind::FreshPaint, t0()).unwrap();
        (home, inst)
    };

    let mut m = open(&path);
    assert_eq!(m.balance("alice").unwrap(), 9_700);
    assert_eq!(m.property(&home.id).unwrap(), home);
    let stored = m.store().get_installation(&inst.id).unwrap().unwrap();
    assert_eq!(stored, inst);

    let done = m.complete_task(&inst.id, t0() + Duration::minutes(5)).unwrap();
    assert_eq!(done.status, InstallStatus::Installed);
    let home = m.property(&home.id).unwrap();
    assert_eq!(home.condition_bps, 10_050);
    assert_eq!(home.upgrade_spend_total, 300);
}

#[test]
fn tier_purchase_and_deed_lookup() {
    let dir = TempDir::new().unwrap();
    let mut m = open(&db(&dir));
    m.store_mut().set_balance("bob", 30_000).unwrap();
    let cottage = m.buy_tiered_home("bob", HomeTier::Cottage, t0()).unwrap();
    let bungalow = m.buy_tiered_home("bob", HomeTier::Bungalow, t0()).unwrap();
    assert_eq!(m.balance("bob").unwrap(), 0);
    assert_eq!(cottage.tier, Some(HomeTier::Cottage));

    let owned = m.properties_of("bob").unwrap();
    assert_eq!(owned.len(), 2);
    let groups = m.deeds_by_owner().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].deeds.len(), 2);
    assert_eq!(m.deed(&bungalow.id).unwrap().owner_id, "bob");

    let err = m.buy_tiered_home("bob", HomeTier::Cottage, t0()).unwrap_err();
    assert_eq!(err.kind(), "insufficient_funds");
    assert_eq!(m.properties_of("bob").unwrap().len(), 2);
}

#[test]
fn stale_view_from_second_connection_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = db(&dir);
    let mut seller = open(&path);
    let mut other = open(&path);

    let home = seller.claim_starter_home("seller", t0()).unwrap();
    seller.store_mut().set_balance("b1", 5_000).unwrap();
    seller.store_mut().set_balance("b2", 5_000).unwrap();
    let listing = seller.list_for_sale("seller", &home.id, 1500, t0()).unwrap();

    let seen_by_b2 = other.property(&home.id).unwrap();
    seller.buy_listed_property("b1", &listing, t0()).unwrap();

    let err = other.buy_listed_property("b2", &seen_by_b2, t0()).unwrap_err();
    assert_eq!(err.kind(), "no_longer_listed");
    assert_eq!(other.balance("b2").unwrap(), 5_000);
    assert_eq!(other.balance("seller").unwrap(), 1350);
    assert_eq!(other.fee_pool_balance().unwrap(), 150);
}

#[test]
fn concurrent_buyers_exactly_one_wins() {
    let dir = TempDir::new().unwrap();
    let path = db(&dir);
    let listing = {
        let mut m = open(&path);
        let home = m.claim_starter_home("seller", t0()).unwrap();
        for b in ["b0", "b1", "b2", "b3"] {
            m.store_mut().set_balance(b, 2_000).unwrap();
        }
        m.list_for_sale("seller", &home.id, 1200, t0()).unwrap()
    };

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = ["b0", "b1", "b2", "b3"]
        .into_iter()
        .map(|buyer| {
            let mut m = open(&path);
            let listing = listing.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                m.buy_listed_property(buyer, &listing, t0()).map(|_| buyer)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for r in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(r.kind(), "no_longer_listed");
    }

    let m = open(&path);
    let winner = *winners[0];
    assert_eq!(m.property(&listing.id).unwrap().owner_id, winner);
    assert_eq!(m.balance(winner).unwrap(), 800);
    assert_eq!(m.store().total_coins().unwrap(), 8_000);
    assert_eq!(m.deed_transfers(&TransferFilter::default()).unwrap().len(), 1);
}

#[test]
fn transfer_filters_in_sql() {
    let dir = TempDir::new().unwrap();
    let mut m = open(&db(&dir));
    m.store_mut().set_balance("bob", 10_000).unwrap();
    m.store_mut().set_balance("carol", 10_000).unwrap();

    let a = m.claim_starter_home("alice", t0()).unwrap();
    let l = m.list_for_sale("alice", &a.id, 1000, t0()).unwrap();
    m.buy_listed_property("bob", &l, t0()).unwrap();
    let l = m.list_for_sale("bob", &a.id, 1600, t0()).unwrap();
    m.buy_listed_property("carol", &l, t0() + Duration::days(3)).unwrap();

    let from_bob = TransferFilter { seller_id: Some("bob".to_string()), ..Default::default() };
    let rows = m.deed_transfers(&from_bob).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].buyer_id, "carol");
    assert_eq!(rows[0].deed_fee, 160);

    let cheap = TransferFilter { max_price: Some(1000), ..Default::default() };
    assert_eq!(m.deed_transfers(&cheap).unwrap()[0].seller_id, "alice");

    let later = TransferFilter { start: Some(t0() + Duration::days(1)), ..Default::default() };
    assert_eq!(m.deed_transfers(&later).unwrap().len(), 1);
    assert_eq!(m.audit_transfers().unwrap(), 2);
}
