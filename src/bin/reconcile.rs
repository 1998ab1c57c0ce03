//! Operator view of the partial-failure journal.
//!
//! Usage:
//!   reconcile                         List open incidents as JSON lines
//!   reconcile resolve <id> <note...>  Mark an incident handled
//!
//! Reads JOURNAL_PATH (default ./estate.journal).

use anyhow::{anyhow, Result};
use serde_json::json;

use estatefx::config::{self, Config};
use estatefx::logging::{self, obj, v_str};
use estatefx::reliability::journal::Journal;

fn list(path: &str) -> Result<()> {
    let open = Journal::open_incidents(path)?;
    for incident in &open {
        println!(
            "{}",
            json!({
                "ts": incident.ts,
                "incident_id": incident.incident_id,
                "operation": incident.failure.operation,
                "buyer_id": incident.failure.buyer_id,
                "seller_id": incident.failure.seller_id,
                "property_id": incident.failure.property_id,
                "amount": incident.failure.amount,
                "step": incident.failure.step.as_str(),
                "cause": incident.failure.cause,
            })
        );
    }
    eprintln!("{} open incident(s) in {}", open.len(), path);
    Ok(())
}

fn resolve(path: &str, incident_id: &str, note: &str) -> Result<()> {
    let known = Journal::open_incidents(path)?
        .into_iter()
        .any(|i| i.incident_id == incident_id);
    if !known {
        return Err(anyhow!("no open incident {}", incident_id));
    }
    let mut journal = Journal::open(path)?;
    journal.resolve(config::now().timestamp_millis(), incident_id, note)?;
    logging::log(
        logging::Level::Info,
        logging::Domain::Reconcile,
        "incident_resolved",
        obj(&[("incident_id", v_str(incident_id)), ("msg", v_str(note))]),
    );
    Ok(())
}

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        None | Some("list") => list(&cfg.journal_path),
        Some("resolve") => {
            let id = args.get(2).ok_or_else(|| anyhow!("usage: reconcile resolve <incident_id> <note>"))?;
            let note = if args.len() > 3 { args[3..].join(" ") } else { "resolved".to_string() };
            resolve(&cfg.journal_path, id, &note)
        }
        Some(other) => Err(anyhow!("unknown command {}", other)),
    }
}
