//! Structured logging for the property economy engine.
//!
//! Every record is one JSON line carrying a run id, a sequence number, the
//! level, the emitting domain and a `data` object. Lines go to stdout and to
//! `LOG_DIR/<run_id>/events.jsonl` (trace/debug go to `trace.jsonl`) so an
//! operator can replay exactly what the engine decided and why.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Valuation, // System value and listing cap computations
    Upgrade,   // Installation lifecycle
    Market,    // Claims, tier purchases, listings, sales
    Ledger,    // Store transactions
    Reconcile, // Partial failures needing an operator
    System,    // Startup, config
    Audit,     // Deed transfer trail
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Valuation => "valuation",
            Domain::Upgrade => "upgrade",
            Domain::Market => "market",
            Domain::Ledger => "ledger",
            Domain::Reconcile => "reconcile",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        // Without LOG_DIR the records only go to stdout.
        let Ok(base) = std::env::var("LOG_DIR") else {
            return RunContext { run_id, events: None, trace: None };
        };
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["property_id", "user_id", "installation_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(Ok(mut w)) = writer.as_ref().map(|w| w.lock()) {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if level >= Level::Error {
        eprintln!("{}", line);
    } else {
        println!("{}", line);
    }
}

// =============================================================================
// Domain helpers
// =============================================================================

/// Home acquired through a claim or a tier purchase.
pub fn log_acquisition(kind: &str, user_id: &str, property_id: &str, price: i64, balance_after: i64) {
    log(
        Level::Info,
        Domain::Market,
        kind,
        obj(&[
            ("user_id", v_str(user_id)),
            ("property_id", v_str(property_id)),
            ("price", json!(price)),
            ("balance_after", json!(balance_after)),
        ]),
    );
}

pub fn log_listing(property_id: &str, ask_price: Option<i64>, system_value: i64, cap: i64) {
    log(
        Level::Info,
        Domain::Market,
        if ask_price.is_some() { "listed" } else { "listing_cancelled" },
        obj(&[
            ("property_id", v_str(property_id)),
            ("ask_price", ask_price.map(|p| json!(p)).unwrap_or(Value::Null)),
            ("system_value", json!(system_value)),
            ("cap", json!(cap)),
        ]),
    );
}

pub fn log_upgrade(event: &str, installation_id: &str, property_id: &str, done: u32, total: u32) {
    log(
        Level::Info,
        Domain::Upgrade,
        event,
        obj(&[
            ("installation_id", v_str(installation_id)),
            ("property_id", v_str(property_id)),
            ("tasks_completed", json!(done)),
            ("tasks_required", json!(total)),
        ]),
    );
}

/// Completed marketplace sale, written to the audit domain.
pub fn log_sale(
    transfer_id: &str,
    property_id: &str,
    seller_id: &str,
    buyer_id: &str,
    sale_price: i64,
    deed_fee: i64,
    seller_net: i64,
) {
    log(
        Level::Info,
        Domain::Audit,
        "deed_transfer",
        obj(&[
            ("transfer_id", v_str(transfer_id)),
            ("property_id", v_str(property_id)),
            ("seller_id", v_str(seller_id)),
            ("buyer_id", v_str(buyer_id)),
            ("sale_price", json!(sale_price)),
            ("deed_fee", json!(deed_fee)),
            ("seller_net", json!(seller_net)),
        ]),
    );
}

/// Recoverable precondition failure shown to the user.
pub fn log_rejection(operation: &str, kind: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Market,
        "rejected",
        obj(&[
            ("operation", v_str(operation)),
            ("kind", v_str(kind)),
            ("msg", v_str(reason)),
        ]),
    );
}

/// A failure that is not the caller's fault, after its transaction was
/// rolled back cleanly.
pub fn log_rolled_back_failure(operation: &str, kind: &str, reason: &str) {
    log(
        Level::Error,
        Domain::Market,
        "rolled_back",
        obj(&[
            ("operation", v_str(operation)),
            ("kind", v_str(kind)),
            ("msg", v_str(reason)),
        ]),
    );
}

pub fn valuation_fields(
    property_id: &str,
    months: i64,
    base_component: f64,
    upgrade_component: f64,
    system_value: i64,
    cap: i64,
) -> Map<String, Value> {
    obj(&[
        ("property_id", v_str(property_id)),
        ("months", json!(months)),
        ("base_component", v_num(base_component)),
        ("upgrade_component", v_num(upgrade_component)),
        ("system_value", json!(system_value)),
        ("cap", json!(cap)),
    ])
}

pub fn log_valuation(fields: Map<String, Value>) {
    log(Level::Debug, Domain::Valuation, "valued", fields);
}

/// Transaction boundary events (begin, commit, rollback).
pub fn log_ledger(event: &str, operation: &str) {
    log(Level::Trace, Domain::Ledger, event, obj(&[("operation", v_str(operation))]));
}

/// Funds left a buyer without the operation completing. Never filtered.
pub fn log_partial_failure(fields: Map<String, Value>) {
    emit_record(Level::Fatal, Domain::Reconcile.as_str(), "partial_failure_after_debit", fields);
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_lifts_identifiers() {
        let fields = obj(&[("property_id", v_str("p-1")), ("price", json!(10))]);
        let (top, data) = split_fields(fields);
        assert_eq!(top.get("property_id").unwrap(), "p-1");
        assert!(data.contains_key("price"));
        assert!(!data.contains_key("property_id"));
    }

    #[test]
    fn test_valuation_fields_keep_components() {
        let fields = valuation_fields("p-1", 12, 1330.5, 75.25, 1406, 1617);
        assert_eq!(fields.get("base_component").unwrap(), 1330.5);
        assert_eq!(fields.get("upgrade_component").unwrap(), 75.25);
        assert_eq!(fields.get("cap").unwrap(), 1617);
        let (top, data) = split_fields(fields);
        assert_eq!(top.get("property_id").unwrap(), "p-1");
        assert_eq!(data.get("months").unwrap(), 12);
    }

    #[test]
    fn test_domain_names() {
        assert_eq!(Domain::Valuation.as_str(), "valuation");
        assert_eq!(Domain::Ledger.as_str(), "ledger");
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
