use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::LedgerStore;
use crate::catalog::{HomeTier, UpgradeKind};
use crate::ids::new_id;
use crate::model::{
    Deed, DeedTransfer, InstallStatus, Property, TransferFilter, UpgradeInstallation,
    TRANSFER_QUERY_LIMIT,
};

/// SQLite-backed ledger.
///
/// `begin` issues `BEGIN IMMEDIATE`, so a second connection blocks (up to the
/// busy timeout) until the first commits, then reads the committed rows.
pub struct SqliteLedger {
    conn: Connection,
}

const PROPERTY_COLS: &str = "id, owner_id, name, tier, base_value, condition_bps, upgrade_spend_total, is_starter, is_listed, ask_price, created_at";
const INSTALL_COLS: &str = "id, property_id, upgrade, cost, condition_impact_bps, status, tasks_required_total, tasks_completed, created_at, installed_at";
const TRANSFER_COLS: &str = "id, deed_id, property_id, seller_id, buyer_id, sale_price, deed_fee, seller_net, system_value_at_sale, created_at, prev_hash, record_hash";

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_err(idx, format!("bad timestamp {}", ms)))
}

fn row_to_property(row: &Row) -> rusqlite::Result<Property> {
    let tier: Option<String> = row.get(3)?;
    let tier = match tier {
        Some(id) => Some(HomeTier::from_id(&id).ok_or_else(|| conversion_err(3, format!("unknown tier {}", id)))?),
        None => None,
    };
    Ok(Property {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        tier,
        base_value: row.get(4)?,
        condition_bps: row.get(5)?,
        upgrade_spend_total: row.get(6)?,
        is_starter: row.get(7)?,
        is_listed: row.get(8)?,
        ask_price: row.get(9)?,
        created_at: ts_from_ms(10, row.get(10)?)?,
    })
}

fn row_to_installation(row: &Row) -> rusqlite::Result<UpgradeInstallation> {
    let upgrade: String = row.get(2)?;
    let status: String = row.get(5)?;
    let installed_at: Option<i64> = row.get(9)?;
    Ok(UpgradeInstallation {
        id: row.get(0)?,
        property_id: row.get(1)?,
        upgrade: UpgradeKind::from_id(&upgrade)
            .ok_or_else(|| conversion_err(2, format!("unknown upgrade {}", upgrade)))?,
        cost: row.get(3)?,
        condition_impact_bps: row.get(4)?,
        status: InstallStatus::parse(&status)
            .ok_or_else(|| conversion_err(5, format!("unknown status {}", status)))?,
        tasks_required_total: row.get(6)?,
        tasks_completed: row.get(7)?,
        created_at: ts_from_ms(8, row.get(8)?)?,
        installed_at: installed_at.map(|ms| ts_from_ms(9, ms)).transpose()?,
    })
}

fn row_to_transfer(row: &Row) -> rusqlite::Result<DeedTransfer> {
    Ok(DeedTransfer {
        id: row.get(0)?,
        deed_id: row.get(1)?,
        property_id: row.get(2)?,
        seller_id: row.get(3)?,
        buyer_id: row.get(4)?,
        sale_price: row.get(5)?,
        deed_fee: row.get(6)?,
        seller_net: row.get(7)?,
        system_value_at_sale: row.get(8)?,
        created_at: ts_from_ms(9, row.get(9)?)?,
        prev_hash: row.get(10)?,
        record_hash: row.get(11)?,
    })
}

fn row_to_deed(row: &Row) -> rusqlite::Result<Deed> {
    Ok(Deed {
        id: row.get(0)?,
        property_id: row.get(1)?,
        owner_id: row.get(2)?,
    })
}

impl SqliteLedger {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// Open `path` and create the schema if needed.
    pub fn open(path: &str) -> Result<Self> {
        let mut ledger = Self::new(path)?;
        ledger.init()?;
        Ok(ledger)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                tier TEXT,
                base_value INTEGER NOT NULL,
                condition_bps INTEGER NOT NULL,
                upgrade_spend_total INTEGER NOT NULL,
                is_starter INTEGER NOT NULL,
                is_listed INTEGER NOT NULL,
                ask_price INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS properties_owner ON properties(owner_id);
            CREATE TABLE IF NOT EXISTS upgrade_installations (
                id TEXT PRIMARY KEY,
                property_id TEXT NOT NULL REFERENCES properties(id),
                upgrade TEXT NOT NULL,
                cost INTEGER NOT NULL,
                condition_impact_bps INTEGER NOT NULL,
                status TEXT NOT NULL,
                tasks_required_total INTEGER NOT NULL,
                tasks_completed INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                installed_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS one_installed_per_type
                ON upgrade_installations(property_id, upgrade) WHERE status = 'installed';
            CREATE TABLE IF NOT EXISTS deeds (
                id TEXT PRIMARY KEY,
                property_id TEXT NOT NULL UNIQUE REFERENCES properties(id),
                owner_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deed_transfers (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                deed_id TEXT NOT NULL,
                property_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                sale_price INTEGER NOT NULL,
                deed_fee INTEGER NOT NULL,
                seller_net INTEGER NOT NULL,
                system_value_at_sale INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                prev_hash TEXT NOT NULL,
                record_hash TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL CHECK (balance >= 0)
            );
            CREATE TABLE IF NOT EXISTS fee_pool (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO fee_pool (id, balance) VALUES (1, 0);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Sum of every user balance plus the fee pool.
    pub fn total_coins(&self) -> Result<i64> {
        let users: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(balance), 0) FROM balances", [], |r| r.get(0))?;
        Ok(users + self.fee_pool_balance()?)
    }
}

impl LedgerStore for SqliteLedger {
    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn get_property(&self, id: &str) -> Result<Option<Property>> {
        let sql = format!("SELECT {} FROM properties WHERE id = ?1", PROPERTY_COLS);
        Ok(self.conn.query_row(&sql, params![id], row_to_property).optional()?)
    }

    fn properties_of(&self, owner_id: &str) -> Result<Vec<Property>> {
        let sql = format!(
            "SELECT {} FROM properties WHERE owner_id = ?1 ORDER BY created_at, id",
            PROPERTY_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id], row_to_property)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_property(&mut self, p: &Property) -> Result<()> {
        self.conn.execute(
            "INSERT INTO properties (id, owner_id, name, tier, base_value, condition_bps, upgrade_spend_total, is_starter, is_listed, ask_price, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                p.id,
                p.owner_id,
                p.name,
                p.tier.map(|t| t.id()),
                p.base_value,
                p.condition_bps,
                p.upgrade_spend_total,
                p.is_starter,
                p.is_listed,
                p.ask_price,
                p.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn update_property(&mut self, p: &Property) -> Result<()> {
        // base_value and created_at are immutable and not written here.
        let changed = self.conn.execute(
            "UPDATE properties SET owner_id = ?2, condition_bps = ?3, upgrade_spend_total = ?4,
                 is_starter = ?5, is_listed = ?6, ask_price = ?7
             WHERE id = ?1",
            params![
                p.id,
                p.owner_id,
                p.condition_bps,
                p.upgrade_spend_total,
                p.is_starter,
                p.is_listed,
                p.ask_price
            ],
        )?;
        if changed != 1 {
            bail!("property {} missing", p.id);
        }
        Ok(())
    }

    fn upgrade_installations(&self, property_id: &str) -> Result<Vec<UpgradeInstallation>> {
        let sql = format!(
            "SELECT {} FROM upgrade_installations WHERE property_id = ?1 ORDER BY created_at, id",
            INSTALL_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![property_id], row_to_installation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_installation(&self, id: &str) -> Result<Option<UpgradeInstallation>> {
        let sql = format!("SELECT {} FROM upgrade_installations WHERE id = ?1", INSTALL_COLS);
        Ok(self.conn.query_row(&sql, params![id], row_to_installation).optional()?)
    }

    fn create_installation(&mut self, i: &UpgradeInstallation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO upgrade_installations (id, property_id, upgrade, cost, condition_impact_bps, status, tasks_required_total, tasks_completed, created_at, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                i.id,
                i.property_id,
                i.upgrade.id(),
                i.cost,
                i.condition_impact_bps,
                i.status.as_str(),
                i.tasks_required_total,
                i.tasks_completed,
                i.created_at.timestamp_millis(),
                i.installed_at.map(|t| t.timestamp_millis())
            ],
        )?;
        Ok(())
    }

    fn update_installation(&mut self, i: &UpgradeInstallation) -> Result<()> {
        // Installed rows are frozen.
        let changed = self.conn.execute(
            "UPDATE upgrade_installations SET status = ?2, tasks_completed = ?3, installed_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![
                i.id,
                i.status.as_str(),
                i.tasks_completed,
                i.installed_at.map(|t| t.timestamp_millis())
            ],
        )?;
        if changed != 1 {
            bail!("installation {} missing or already installed", i.id);
        }
        Ok(())
    }

    fn get_deed(&self, property_id: &str) -> Result<Option<Deed>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, property_id, owner_id FROM deeds WHERE property_id = ?1",
                params![property_id],
                row_to_deed,
            )
            .optional()?)
    }

    fn upsert_deed(&mut self, property_id: &str, owner_id: &str) -> Result<Deed> {
        self.conn.execute(
            "INSERT INTO deeds (id, property_id, owner_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(property_id) DO UPDATE SET owner_id = excluded.owner_id",
            params![new_id("deed"), property_id, owner_id],
        )?;
        match self.get_deed(property_id)? {
            Some(deed) => Ok(deed),
            None => bail!("deed for {} vanished after upsert", property_id),
        }
    }

    fn all_deeds(&self) -> Result<Vec<Deed>> {
        let mut stmt = self.conn.prepare("SELECT id, property_id, owner_id FROM deeds ORDER BY id")?;
        let rows = stmt.query_map([], row_to_deed)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_deed_transfer(&mut self, t: &DeedTransfer) -> Result<()> {
        self.conn.execute(
            "INSERT INTO deed_transfers (id, deed_id, property_id, seller_id, buyer_id, sale_price, deed_fee, seller_net, system_value_at_sale, created_at, prev_hash, record_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                t.id,
                t.deed_id,
                t.property_id,
                t.seller_id,
                t.buyer_id,
                t.sale_price,
                t.deed_fee,
                t.seller_net,
                t.system_value_at_sale,
                t.created_at.timestamp_millis(),
                t.prev_hash,
                t.record_hash
            ],
        )?;
        Ok(())
    }

    fn deed_transfers(&self, filter: &TransferFilter) -> Result<Vec<DeedTransfer>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(seller) = &filter.seller_id {
            clauses.push("seller_id = ?");
            values.push(Value::Text(seller.clone()));
        }
        if let Some(buyer) = &filter.buyer_id {
            clauses.push("buyer_id = ?");
            values.push(Value::Text(buyer.clone()));
        }
        if let Some(min) = filter.min_price {
            clauses.push("sale_price >= ?");
            values.push(Value::Integer(min));
        }
        if let Some(max) = filter.max_price {
            clauses.push("sale_price <= ?");
            values.push(Value::Integer(max));
        }
        if let Some(start) = filter.start {
            clauses.push("created_at >= ?");
            values.push(Value::Integer(start.timestamp_millis()));
        }
        if let Some(end) = filter.end {
            clauses.push("created_at <= ?");
            values.push(Value::Integer(end.timestamp_millis()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM deed_transfers {} ORDER BY seq DESC LIMIT {}",
            TRANSFER_COLS, where_sql, TRANSFER_QUERY_LIMIT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_transfer)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn last_transfer_hash(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT record_hash FROM deed_transfers ORDER BY seq DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn balance(&self, user_id: &str) -> Result<i64> {
        let balance: Option<i64> = self
            .conn
            .query_row("SELECT balance FROM balances WHERE user_id = ?1", params![user_id], |r| r.get(0))
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    fn set_balance(&mut self, user_id: &str, amount: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO balances (user_id, balance) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance",
            params![user_id, amount],
        )?;
        Ok(())
    }

    fn debit(&mut self, user_id: &str, amount: i64) -> Result<bool> {
        if amount < 0 {
            bail!("negative debit {}", amount);
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO balances (user_id, balance) VALUES (?1, 0)",
            params![user_id],
        )?;
        let changed = self.conn.execute(
            "UPDATE balances SET balance = balance - ?2 WHERE user_id = ?1 AND balance >= ?2",
            params![user_id, amount],
        )?;
        Ok(changed == 1)
    }

    fn credit(&mut self, user_id: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            bail!("negative credit {}", amount);
        }
        self.conn.execute(
            "INSERT INTO balances (user_id, balance) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance",
            params![user_id, amount],
        )?;
        Ok(())
    }

    fn credit_fee_pool(&mut self, amount: i64) -> Result<()> {
        if amount < 0 {
            bail!("negative fee credit {}", amount);
        }
        self.conn.execute("UPDATE fee_pool SET balance = balance + ?1 WHERE id = 1", params![amount])?;
        Ok(())
    }

    fn fee_pool_balance(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT balance FROM fee_pool WHERE id = 1", [], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger() -> SqliteLedger {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.init().unwrap();
        ledger
    }

    #[test]
    fn test_property_roundtrip_preserves_fields() {
        let mut ledger = ledger();
        let created = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let mut p = Property::new("p-1".to_string(), "u-1".to_string(), 25_000, false, Some(HomeTier::Bungalow), created);
        ledger.create_property(&p).unwrap();
        p.is_listed = true;
        p.ask_price = Some(20_000);
        ledger.update_property(&p).unwrap();
        assert_eq!(ledger.get_property("p-1").unwrap(), Some(p));
    }

    #[test]
    fn test_debit_is_conditional() {
        let mut ledger = ledger();
        assert!(!ledger.debit("nobody", 1).unwrap());
        ledger.set_balance("u-1", 50).unwrap();
        assert!(!ledger.debit("u-1", 51).unwrap());
        assert!(ledger.debit("u-1", 50).unwrap());
        assert_eq!(ledger.balance("u-1").unwrap(), 0);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let mut ledger = ledger();
        ledger.set_balance("u-1", 100).unwrap();
        ledger.begin().unwrap();
        ledger.debit("u-1", 30).unwrap();
        ledger.credit_fee_pool(30).unwrap();
        ledger.rollback().unwrap();
        assert_eq!(ledger.balance("u-1").unwrap(), 100);
        assert_eq!(ledger.total_coins().unwrap(), 100);
    }
}
