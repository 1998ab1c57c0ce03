use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use super::LedgerStore;
use crate::ids::new_id;
use crate::model::{
    Deed, DeedTransfer, Property, TransferFilter, UpgradeInstallation, TRANSFER_QUERY_LIMIT,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    properties: HashMap<String, Property>,
    installations: HashMap<String, UpgradeInstallation>,
    deeds: HashMap<String, Deed>,
    transfers: Vec<DeedTransfer>,
    balances: HashMap<String, i64>,
    fee_pool: i64,
}

/// In-process ledger. A transaction snapshots all tables; rollback restores it.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: Tables,
    saved: Option<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every user balance plus the fee pool.
    pub fn total_coins(&self) -> i64 {
        self.tables.balances.values().sum::<i64>() + self.tables.fee_pool
    }

    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }
}

impl LedgerStore for MemoryLedger {
    fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            bail!("transaction already open");
        }
        self.saved = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.saved.take().ok_or_else(|| anyhow!("no open transaction"))?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.tables = self.saved.take().ok_or_else(|| anyhow!("no open transaction"))?;
        Ok(())
    }

    fn get_property(&self, id: &str) -> Result<Option<Property>> {
        Ok(self.tables.properties.get(id).cloned())
    }

    fn properties_of(&self, owner_id: &str) -> Result<Vec<Property>> {
        let mut out: Vec<Property> = self
            .tables
            .properties
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn create_property(&mut self, property: &Property) -> Result<()> {
        if self.tables.properties.contains_key(&property.id) {
            bail!("property {} already exists", property.id);
        }
        self.tables.properties.insert(property.id.clone(), property.clone());
        Ok(())
    }

    fn update_property(&mut self, property: &Property) -> Result<()> {
        let row = self
            .tables
            .properties
            .get_mut(&property.id)
            .ok_or_else(|| anyhow!("property {} missing", property.id))?;
        *row = property.clone();
        Ok(())
    }

    fn upgrade_installations(&self, property_id: &str) -> Result<Vec<UpgradeInstallation>> {
        let mut out: Vec<UpgradeInstallation> = self
            .tables
            .installations
            .values()
            .filter(|i| i.property_id == property_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn get_installation(&self, id: &str) -> Result<Option<UpgradeInstallation>> {
        Ok(self.tables.installations.get(id).cloned())
    }

    fn create_installation(&mut self, inst: &UpgradeInstallation) -> Result<()> {
        if self.tables.installations.contains_key(&inst.id) {
            bail!("installation {} already exists", inst.id);
        }
        self.tables.installations.insert(inst.id.clone(), inst.clone());
        Ok(())
    }

    fn update_installation(&mut self, inst: &UpgradeInstallation) -> Result<()> {
        let row = self
            .tables
            .installations
            .get_mut(&inst.id)
            .ok_or_else(|| anyhow!("installation {} missing", inst.id))?;
        *row = inst.clone();
        Ok(())
    }

    fn get_deed(&self, property_id: &str) -> Result<Option<Deed>> {
        Ok(self.tables.deeds.get(property_id).cloned())
    }

    fn upsert_deed(&mut self, property_id: &str, owner_id: &str) -> Result<Deed> {
        let deed = self
            .tables
            .deeds
            .entry(property_id.to_string())
            .or_insert_with(|| Deed {
                id: new_id("deed"),
                property_id: property_id.to_string(),
                owner_id: owner_id.to_string(),
            });
        deed.owner_id = owner_id.to_string();
        Ok(deed.clone())
    }

    fn all_deeds(&self) -> Result<Vec<Deed>> {
        let mut out: Vec<Deed> = self.tables.deeds.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn append_deed_transfer(&mut self, transfer: &DeedTransfer) -> Result<()> {
        self.tables.transfers.push(transfer.clone());
        Ok(())
    }

    fn deed_transfers(&self, filter: &TransferFilter) -> Result<Vec<DeedTransfer>> {
        Ok(self
            .tables
            .transfers
            .iter()
            .rev()
            .filter(|t| filter.matches(t))
            .take(TRANSFER_QUERY_LIMIT)
            .cloned()
            .collect())
    }

    fn last_transfer_hash(&self) -> Result<Option<String>> {
        Ok(self.tables.transfers.last().map(|t| t.record_hash.clone()))
    }

    fn balance(&self, user_id: &str) -> Result<i64> {
        Ok(self.tables.balances.get(user_id).copied().unwrap_or(0))
    }

    fn set_balance(&mut self, user_id: &str, amount: i64) -> Result<()> {
        self.tables.balances.insert(user_id.to_string(), amount);
        Ok(())
    }

    fn debit(&mut self, user_id: &str, amount: i64) -> Result<bool> {
        if amount < 0 {
            bail!("negative debit {}", amount);
        }
        let balance = self.tables.balances.entry(user_id.to_string()).or_insert(0);
        if *balance < amount {
            return Ok(false);
        }
        *balance -= amount;
        Ok(true)
    }

    fn credit(&mut self, user_id: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            bail!("negative credit {}", amount);
        }
        *self.tables.balances.entry(user_id.to_string()).or_insert(0) += amount;
        Ok(())
    }

    fn credit_fee_pool(&mut self, amount: i64) -> Result<()> {
        if amount < 0 {
            bail!("negative fee credit {}", amount);
        }
        self.tables.fee_pool += amount;
        Ok(())
    }

    fn fee_pool_balance(&self) -> Result<i64> {
        Ok(self.tables.fee_pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debit_checks_balance() {
        let mut ledger = MemoryLedger::new();
        ledger.set_balance("u-1", 100).unwrap();
        assert!(!ledger.debit("u-1", 101).unwrap());
        assert_eq!(ledger.balance("u-1").unwrap(), 100);
        assert!(ledger.debit("u-1", 100).unwrap());
        assert_eq!(ledger.balance("u-1").unwrap(), 0);
    }

    #[test]
    fn test_rollback_restores_everything() {
        let mut ledger = MemoryLedger::new();
        ledger.set_balance("u-1", 100).unwrap();
        ledger.begin().unwrap();
        assert!(ledger.debit("u-1", 40).unwrap());
        ledger.credit_fee_pool(40).unwrap();
        ledger.rollback().unwrap();
        assert_eq!(ledger.balance("u-1").unwrap(), 100);
        assert_eq!(ledger.fee_pool_balance().unwrap(), 0);
        assert!(!ledger.in_transaction());
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut ledger = MemoryLedger::new();
        ledger.begin().unwrap();
        assert!(ledger.begin().is_err());
        ledger.commit().unwrap();
        assert!(ledger.commit().is_err());
    }

    #[test]
    fn test_upsert_deed_repoints_same_deed() {
        let mut ledger = MemoryLedger::new();
        let first = ledger.upsert_deed("p-1", "u-1").unwrap();
        let second = ledger.upsert_deed("p-1", "u-2").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.owner_id, "u-2");
        assert_eq!(ledger.all_deeds().unwrap().len(), 1);
    }
}
