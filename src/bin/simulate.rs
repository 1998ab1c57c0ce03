//! Seeded random economy over the in-memory ledger.
//!
//! Users claim, buy, upgrade, list and trade homes while store faults are
//! injected at random. After every step the coin supply must equal what was
//! granted minus what was paid to the system, and at the end the transfer
//! chain must verify.
//!
//! Env: SEED (42), STEPS (500), USERS (6), FAULT_RATE (0.05).

use std::env;

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use estatefx::catalog::{HomeTier, UpgradeKind};
use estatefx::ledger::{should_fault, FaultyLedger, LedgerOp, LedgerStore, MemoryLedger};
use estatefx::logging::{self, obj, v_str};
use estatefx::valuation::{compute_system_value, listing_cap};
use estatefx::Marketplace;

const GRANT: i64 = 20_000;

const FAULT_OPS: [LedgerOp; 6] = [
    LedgerOp::CreateProperty,
    LedgerOp::UpsertDeed,
    LedgerOp::Credit,
    LedgerOp::CreditFeePool,
    LedgerOp::AppendTransfer,
    LedgerOp::UpdateProperty,
];

fn lcg(seed: &mut u64) -> u64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    *seed
}

fn pick(seed: &mut u64, n: u64) -> u64 {
    (lcg(seed) >> 33) % n
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Default)]
struct Tally {
    ok: u64,
    rejected: u64,
    faulted: u64,
    sales: u64,
    paid_to_system: i64,
}

fn main() -> Result<()> {
    let mut seed: u64 = env_or("SEED", 42);
    let steps: u64 = env_or("STEPS", 500);
    let user_count: u64 = env_or("USERS", 6).max(2);
    let fault_rate: f64 = env_or("FAULT_RATE", 0.05);

    let users: Vec<String> = (0..user_count).map(|i| format!("user-{}", i)).collect();
    let mut market = Marketplace::new(FaultyLedger::new(MemoryLedger::new()));
    for u in &users {
        market.store_mut().set_balance(u, GRANT)?;
    }
    let granted = GRANT * user_count as i64;
    let start = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("bad start date"))?;
    let mut tally = Tally::default();

    for step in 0..steps {
        let now = start + Duration::days(step as i64);
        let user = &users[pick(&mut seed, user_count) as usize];

        market.store_mut().heal();
        if should_fault(lcg(&mut seed), fault_rate) {
            let op = FAULT_OPS[pick(&mut seed, FAULT_OPS.len() as u64) as usize];
            market.store_mut().failing.push(op);
        }

        let mut paid = 0;
        let result = match pick(&mut seed, 6) {
            0 => market.claim_starter_home(user, now).map(|_| ()),
            1 => {
                let tier = if pick(&mut seed, 2) == 0 { HomeTier::Cottage } else { HomeTier::Bungalow };
                paid = tier.def().price;
                market.buy_tiered_home(user, tier, now).map(|_| ())
            }
            2 => match market.properties_of(user)?.first() {
                Some(p) => {
                    let kind = UpgradeKind::ALL[pick(&mut seed, UpgradeKind::ALL.len() as u64) as usize];
                    paid = kind.def().cost;
                    market.start_upgrade(user, &p.id, kind, now).map(|_| ())
                }
                None => continue,
            },
            3 => {
                let mut result = Ok(());
                for p in market.properties_of(user)? {
                    for inst in market.installations(&p.id)? {
                        if !inst.is_installed() {
                            result = market.complete_task(&inst.id, now).map(|_| ());
                        }
                    }
                }
                result
            }
            4 => match market.properties_of(user)?.into_iter().find(|p| !p.is_listed) {
                Some(p) => {
                    let cap = listing_cap(compute_system_value(&p, now));
                    let ask = cap - pick(&mut seed, (cap / 4).max(1) as u64) as i64;
                    market.list_for_sale(user, &p.id, ask.max(1), now).map(|_| ())
                }
                None => continue,
            },
            _ => {
                let seller = &users[pick(&mut seed, user_count) as usize];
                match market.properties_of(seller)?.into_iter().find(|p| p.is_listed) {
                    Some(listing) => market.buy_listed_property(user, &listing, now).map(|_| tally.sales += 1),
                    None => continue,
                }
            }
        };

        match result {
            Ok(()) => {
                tally.ok += 1;
                tally.paid_to_system += paid;
            }
            Err(e) if e.kind() == "store" => tally.faulted += 1,
            Err(e) if e.is_recoverable() => tally.rejected += 1,
            Err(e) => bail!("step {}: {}", step, e),
        }

        let supply = market.store().inner.total_coins();
        if supply + tally.paid_to_system != granted {
            bail!(
                "step {}: supply {} + paid {} != granted {}",
                step,
                supply,
                tally.paid_to_system,
                granted
            );
        }
    }

    market.store_mut().heal();
    let checked = market.audit_transfers()?;
    let summary = json!({
        "seed": env_or::<u64>("SEED", 42),
        "steps": steps,
        "ok": tally.ok,
        "rejected": tally.rejected,
        "faulted": tally.faulted,
        "sales": tally.sales,
        "transfers_checked": checked,
        "fee_pool": market.fee_pool_balance()?,
        "paid_to_system": tally.paid_to_system,
    });
    logging::log(
        logging::Level::Info,
        logging::Domain::System,
        "simulation_complete",
        obj(&[("msg", v_str(&summary.to_string()))]),
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
