//! Command-line front end over the SQLite ledger.
//!
//! Every command prints one JSON document on stdout. Engine errors go to
//! stderr as JSON with a non-zero exit code (2 for failures that need an
//! operator).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use estatefx::catalog::{estimated_daily_upkeep, HomeTier, UpgradeKind, HOME_TIERS};
use estatefx::config::{self, Config};
use estatefx::error::EngineError;
use estatefx::ledger::{LedgerStore, SqliteLedger};
use estatefx::logging::{self, obj, v_str};
use estatefx::model::TransferFilter;
use estatefx::valuation::{listing_cap, valuation_breakdown};
use estatefx::Marketplace;

fn print_usage() {
    eprintln!("Usage: estatefx <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  claim <user>                     Claim the free starter home");
    eprintln!("  buy-tier <user> <tier>           Buy a new home from the catalog");
    eprintln!("  tiers                            Show the home catalog");
    eprintln!("  upgrade <user> <property> <id>   Pay for and start an upgrade");
    eprintln!("  upgrades <property>              Upgrades still available");
    eprintln!("  task <installation>              Complete one upgrade task");
    eprintln!("  list <user> <property> <price>   List a property for sale");
    eprintln!("  cancel <user> <property>         Withdraw a listing");
    eprintln!("  buy <user> <property> [--expect-price=N]");
    eprintln!("  value <property>                 System value breakdown");
    eprintln!("  properties <user>                Properties owned by a user");
    eprintln!("  transfers [--seller=] [--buyer=] [--min=] [--max=] [--since=] [--until=]");
    eprintln!("  deeds                            Current deeds by owner");
    eprintln!("  pool                             Fee pool balance");
    eprintln!("  balance <user>                   Coin balance");
    eprintln!("  grant <user> [amount]            Set a balance (defaults to STARTING_BALANCE)");
    eprintln!("  audit                            Verify the transfer hash chain");
}

fn arg<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a str> {
    args.get(i).map(|s| s.as_str()).ok_or_else(|| anyhow!("missing <{}>", name))
}

fn parse_i64(s: &str, name: &str) -> Result<i64> {
    s.parse().map_err(|_| anyhow!("{} must be an integer, got {}", name, s))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn transfer_filter(flags: &[String]) -> Result<TransferFilter> {
    let mut filter = TransferFilter::default();
    for flag in flags {
        if let Some(v) = flag.strip_prefix("--seller=") {
            filter.seller_id = Some(v.to_string());
        } else if let Some(v) = flag.strip_prefix("--buyer=") {
            filter.buyer_id = Some(v.to_string());
        } else if let Some(v) = flag.strip_prefix("--min=") {
            filter.min_price = Some(parse_i64(v, "min")?);
        } else if let Some(v) = flag.strip_prefix("--max=") {
            filter.max_price = Some(parse_i64(v, "max")?);
        } else if let Some(v) = flag.strip_prefix("--since=") {
            filter.start = Some(parse_ts(v)?);
        } else if let Some(v) = flag.strip_prefix("--until=") {
            filter.end = Some(parse_ts(v)?);
        } else {
            return Err(anyhow!("unknown flag {}", flag));
        }
    }
    Ok(filter)
}

fn run(cfg: &Config, market: &mut Marketplace<SqliteLedger>, args: &[String]) -> Result<Value> {
    let now = config::now();
    let cmd = arg(args, 1, "command")?;
    let out = match cmd {
        "claim" => json!(market.claim_starter_home(arg(args, 2, "user")?, now)?),
        "buy-tier" => {
            let tier_id = arg(args, 3, "tier")?;
            let tier = HomeTier::from_id(tier_id).ok_or_else(|| anyhow!("unknown tier {}", tier_id))?;
            json!(market.buy_tiered_home(arg(args, 2, "user")?, tier, now)?)
        }
        "tiers" => Value::Array(
            HOME_TIERS
                .iter()
                .map(|t| {
                    json!({
                        "id": t.tier.id(),
                        "level": t.level,
                        "name": t.name,
                        "price": t.price,
                        "estimated_daily_upkeep": estimated_daily_upkeep(t),
                    })
                })
                .collect(),
        ),
        "upgrade" => {
            let upgrade_id = arg(args, 4, "upgrade")?;
            let kind = UpgradeKind::from_id(upgrade_id).ok_or_else(|| anyhow!("unknown upgrade {}", upgrade_id))?;
            json!(market.start_upgrade(arg(args, 2, "user")?, arg(args, 3, "property")?, kind, now)?)
        }
        "upgrades" => Value::Array(
            market
                .available_upgrades(arg(args, 2, "property")?)?
                .into_iter()
                .map(|d| {
                    json!({
                        "id": d.kind.id(),
                        "name": d.name,
                        "category": d.category,
                        "cost": d.cost,
                        "condition_impact_bps": d.condition_impact_bps,
                        "base_tasks_required": d.base_tasks_required,
                        "description": d.description,
                    })
                })
                .collect(),
        ),
        "task" => json!(market.complete_task(arg(args, 2, "installation")?, now)?),
        "list" => {
            let price = parse_i64(arg(args, 4, "price")?, "price")?;
            json!(market.list_for_sale(arg(args, 2, "user")?, arg(args, 3, "property")?, price, now)?)
        }
        "cancel" => json!(market.cancel_listing(arg(args, 2, "user")?, arg(args, 3, "property")?, now)?),
        "buy" => {
            let mut seen = market.property(arg(args, 3, "property")?)?;
            for flag in &args[4..] {
                if let Some(v) = flag.strip_prefix("--expect-price=") {
                    seen.ask_price = Some(parse_i64(v, "expect-price")?);
                }
            }
            json!(market.buy_listed_property(arg(args, 2, "user")?, &seen, now)?)
        }
        "value" => {
            let property = market.property(arg(args, 2, "property")?)?;
            let breakdown = valuation_breakdown(&property, now);
            json!({
                "property": property,
                "valuation": breakdown,
                "listing_cap": listing_cap(breakdown.system_value),
            })
        }
        "properties" => json!(market.properties_of(arg(args, 2, "user")?)?),
        "transfers" => json!(market.deed_transfers(&transfer_filter(&args[2..])?)?),
        "deeds" => json!(market.deeds_by_owner()?),
        "pool" => json!({ "fee_pool": market.fee_pool_balance()? }),
        "balance" => {
            let user = arg(args, 2, "user")?;
            json!({ "user_id": user, "balance": market.balance(user)? })
        }
        "grant" => {
            let user = arg(args, 2, "user")?;
            let amount = match args.get(3) {
                Some(v) => parse_i64(v, "amount")?,
                None => cfg.starting_balance,
            };
            market.store_mut().set_balance(user, amount)?;
            logging::log(
                logging::Level::Info,
                logging::Domain::Audit,
                "balance_granted",
                obj(&[("user_id", v_str(user)), ("amount", json!(amount))]),
            );
            json!({ "user_id": user, "balance": amount })
        }
        "audit" => json!({ "transfers_checked": market.audit_transfers()? }),
        other => return Err(anyhow!("unknown command {}", other)),
    };
    Ok(out)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cfg = Config::from_env();
    let market = SqliteLedger::open(&cfg.sqlite_path)
        .and_then(|store| Marketplace::from_config(store, &cfg));
    let mut market = match market {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{}", json!({ "error": "startup", "message": err.to_string() }));
            std::process::exit(1);
        }
    };

    match run(&cfg, &mut market, &args) {
        Ok(out) => match serde_json::to_string_pretty(&out) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("{}", json!({ "error": "encode", "message": err.to_string() }));
                std::process::exit(1);
            }
        },
        Err(err) => {
            let (kind, code) = match err.downcast_ref::<EngineError>() {
                Some(e) if !e.is_recoverable() => (e.kind(), 2),
                Some(e) => (e.kind(), 1),
                None => ("usage", 1),
            };
            eprintln!("{}", json!({ "error": kind, "message": err.to_string() }));
            std::process::exit(code);
        }
    }
}
