//! Persistence boundary of the engine.
//!
//! The engine brackets every operation with `begin`/`commit`, and with
//! `rollback` when it fails. Implementations must make `debit` a single
//! check-and-apply step and must serialize writers between `begin` and
//! `commit`.

use anyhow::Result;

use crate::model::{Deed, DeedTransfer, Property, TransferFilter, UpgradeInstallation};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

pub trait LedgerStore {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn get_property(&self, id: &str) -> Result<Option<Property>>;
    fn properties_of(&self, owner_id: &str) -> Result<Vec<Property>>;
    fn create_property(&mut self, property: &Property) -> Result<()>;
    fn update_property(&mut self, property: &Property) -> Result<()>;

    fn upgrade_installations(&self, property_id: &str) -> Result<Vec<UpgradeInstallation>>;
    fn get_installation(&self, id: &str) -> Result<Option<UpgradeInstallation>>;
    fn create_installation(&mut self, inst: &UpgradeInstallation) -> Result<()>;
    fn update_installation(&mut self, inst: &UpgradeInstallation) -> Result<()>;

    fn get_deed(&self, property_id: &str) -> Result<Option<Deed>>;
    /// Point the property's deed at `owner_id`, issuing one if none exists.
    fn upsert_deed(&mut self, property_id: &str, owner_id: &str) -> Result<Deed>;
    fn all_deeds(&self) -> Result<Vec<Deed>>;
    fn append_deed_transfer(&mut self, transfer: &DeedTransfer) -> Result<()>;
    /// Newest first, at most `TRANSFER_QUERY_LIMIT` rows.
    fn deed_transfers(&self, filter: &TransferFilter) -> Result<Vec<DeedTransfer>>;
    fn last_transfer_hash(&self) -> Result<Option<String>>;

    fn balance(&self, user_id: &str) -> Result<i64>;
    fn set_balance(&mut self, user_id: &str, amount: i64) -> Result<()>;
    /// Returns false, changing nothing, when the balance is below `amount`.
    fn debit(&mut self, user_id: &str, amount: i64) -> Result<bool>;
    fn credit(&mut self, user_id: &str, amount: i64) -> Result<()>;
    fn credit_fee_pool(&mut self, amount: i64) -> Result<()>;
    fn fee_pool_balance(&self) -> Result<i64>;
}

/// Store operations that can be made to fail in tests and simulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    CreateProperty,
    UpdateProperty,
    CreateInstallation,
    UpdateInstallation,
    UpsertDeed,
    AppendTransfer,
    Debit,
    Credit,
    CreditFeePool,
    Commit,
    Rollback,
}

/// Wraps a store and fails the operations listed in `failing`.
pub struct FaultyLedger<S> {
    pub inner: S,
    pub failing: Vec<LedgerOp>,
}

impl<S: LedgerStore> FaultyLedger<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, failing: Vec::new() }
    }

    pub fn fail(mut self, op: LedgerOp) -> Self {
        self.failing.push(op);
        self
    }

    pub fn heal(&mut self) {
        self.failing.clear();
    }

    fn check(&self, op: LedgerOp) -> Result<()> {
        if self.failing.contains(&op) {
            anyhow::bail!("injected fault: {:?}", op);
        }
        Ok(())
    }
}

impl<S: LedgerStore> LedgerStore for FaultyLedger<S> {
    fn begin(&mut self) -> Result<()> {
        self.inner.begin()
    }
    fn commit(&mut self) -> Result<()> {
        self.check(LedgerOp::Commit)?;
        self.inner.commit()
    }
    /// An injected rollback fault leaves the partial writes in place.
    fn rollback(&mut self) -> Result<()> {
        if let Err(err) = self.check(LedgerOp::Rollback) {
            self.inner.commit()?;
            return Err(err);
        }
        self.inner.rollback()
    }
    fn get_property(&self, id: &str) -> Result<Option<Property>> {
        self.inner.get_property(id)
    }
    fn properties_of(&self, owner_id: &str) -> Result<Vec<Property>> {
        self.inner.properties_of(owner_id)
    }
    fn create_property(&mut self, property: &Property) -> Result<()> {
        self.check(LedgerOp::CreateProperty)?;
        self.inner.create_property(property)
    }
    fn update_property(&mut self, property: &Property) -> Result<()> {
        self.check(LedgerOp::UpdateProperty)?;
        self.inner.update_property(property)
    }
    fn upgrade_installations(&self, property_id: &str) -> Result<Vec<UpgradeInstallation>> {
        self.inner.upgrade_installations(property_id)
    }
    fn get_installation(&self, id: &str) -> Result<Option<UpgradeInstallation>> {
        self.inner.get_installation(id)
    }
    fn create_installation(&mut self, inst: &UpgradeInstallation) -> Result<()> {
        self.check(LedgerOp::CreateInstallation)?;
        self.inner.create_installation(inst)
    }
    fn update_installation(&mut self, inst: &UpgradeInstallation) -> Result<()> {
        self.check(LedgerOp::UpdateInstallation)?;
        self.inner.update_installation(inst)
    }
    fn get_deed(&self, property_id: &str) -> Result<Option<Deed>> {
        self.inner.get_deed(property_id)
    }
    fn upsert_deed(&mut self, property_id: &str, owner_id: &str) -> Result<Deed> {
        self.check(LedgerOp::UpsertDeed)?;
        self.inner.upsert_deed(property_id, owner_id)
    }
    fn all_deeds(&self) -> Result<Vec<Deed>> {
        self.inner.all_deeds()
    }
    fn append_deed_transfer(&mut self, transfer: &DeedTransfer) -> Result<()> {
        self.check(LedgerOp::AppendTransfer)?;
        self.inner.append_deed_transfer(transfer)
    }
    fn deed_transfers(&self, filter: &TransferFilter) -> Result<Vec<DeedTransfer>> {
        self.inner.deed_transfers(filter)
    }
    fn last_transfer_hash(&self) -> Result<Option<String>> {
        self.inner.last_transfer_hash()
    }
    fn balance(&self, user_id: &str) -> Result<i64> {
        self.inner.balance(user_id)
    }
    fn set_balance(&mut self, user_id: &str, amount: i64) -> Result<()> {
        self.inner.set_balance(user_id, amount)
    }
    fn debit(&mut self, user_id: &str, amount: i64) -> Result<bool> {
        self.check(LedgerOp::Debit)?;
        self.inner.debit(user_id, amount)
    }
    fn credit(&mut self, user_id: &str, amount: i64) -> Result<()> {
        self.check(LedgerOp::Credit)?;
        self.inner.credit(user_id, amount)
    }
    fn credit_fee_pool(&mut self, amount: i64) -> Result<()> {
        self.check(LedgerOp::CreditFeePool)?;
        self.inner.credit_fee_pool(amount)
    }
    fn fee_pool_balance(&self) -> Result<i64> {
        self.inner.fee_pool_balance()
    }
}

/// Deterministic fault decision for seeded simulations.
pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}
