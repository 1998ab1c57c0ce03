use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite ledger file used by the binaries.
    pub sqlite_path: String,
    /// Append-only journal of partial failures awaiting reconciliation.
    pub journal_path: String,
    /// Default amount for `grant` when none is given.
    pub starting_balance: i64,
    /// Run conservation and range checks after every committed operation.
    pub check_invariants: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./estate.sqlite".to_string()),
            journal_path: std::env::var("JOURNAL_PATH").unwrap_or_else(|_| "./estate.journal".to_string()),
            starting_balance: std::env::var("STARTING_BALANCE").ok().and_then(|v| v.parse().ok()).unwrap_or(0),
            check_invariants: std::env::var("CHECK_INVARIANTS").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(true),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./estate.sqlite".to_string(),
            journal_path: "./estate.journal".to_string(),
            starting_balance: 0,
            check_invariants: true,
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
