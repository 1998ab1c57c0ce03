//! Marketplace engine: every user action that moves coins or ownership.
//!
//! Each operation runs inside one ledger transaction. Preconditions are
//! re-read from the store after `begin`, so a stale view held by the caller
//! cannot push a sale through. When a step after a debit fails the
//! transaction is rolled back; if even the rollback fails the buyer may have
//! paid for nothing, and the engine returns `PartialFailureAfterDebit`, logs
//! it at fatal level and writes it to the reconciliation journal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::catalog::{tasks_required_for, HomeTier, UpgradeDef, UpgradeKind};
use crate::config::Config;
use crate::error::{EngineError, FailedStep, PartialFailure};
use crate::ids::new_id;
use crate::ledger::LedgerStore;
use crate::logging::{self, obj, v_str};
use crate::model::{
    Deed, DeedTransfer, OwnerDeeds, Property, TransferFilter, UpgradeInstallation,
};
use crate::reliability::journal::Journal;
use crate::upgrade::{self, TaskOutcome};
use crate::valuation::{compute_system_value, listing_cap, valuation_breakdown};
use crate::verify::invariants;

/// Base value of the free home every user may claim once.
pub const STARTER_BASE_VALUE: i64 = 1500;

/// Platform cut of each sale, in percent.
pub const DEED_FEE_PCT: i64 = 10;

pub fn deed_fee(sale_price: i64) -> i64 {
    let fee = (sale_price as i128 * DEED_FEE_PCT as i128 + 50) / 100;
    i64::try_from(fee).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
struct DebitContext {
    payer_id: String,
    seller_id: Option<String>,
    property_id: Option<String>,
    amount: i64,
}

/// Progress of the running transaction, for failure reports.
#[derive(Debug, Default)]
struct TxState {
    debit: Option<DebitContext>,
    step: Option<FailedStep>,
}

impl TxState {
    fn debited(&mut self, ctx: DebitContext) {
        self.debit = Some(ctx);
    }

    fn at(&mut self, step: FailedStep) {
        self.step = Some(step);
    }
}

fn store_err(err: anyhow::Error) -> EngineError {
    EngineError::store(err)
}

pub struct Marketplace<S: LedgerStore> {
    store: S,
    journal: Option<Journal>,
    check_invariants: bool,
}

impl<S: LedgerStore> Marketplace<S> {
    pub fn new(store: S) -> Self {
        Self { store, journal: None, check_invariants: true }
    }

    /// Engine with the journal and checks configured by `cfg`.
    pub fn from_config(store: S, cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            journal: Some(Journal::open(&cfg.journal_path)?),
            check_invariants: cfg.check_invariants,
        })
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    // =========================================================================
    // Transaction boundary
    // =========================================================================

    fn transact<T>(
        &mut self,
        operation: &'static str,
        now: DateTime<Utc>,
        body: impl FnOnce(&mut S, &mut TxState, bool) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.store.begin().map_err(store_err)?;
        logging::log_ledger("begin", operation);
        let mut tx = TxState::default();
        let check = self.check_invariants;

        let failure = match body(&mut self.store, &mut tx, check) {
            Ok(value) => match self.store.commit() {
                Ok(()) => {
                    logging::log_ledger("commit", operation);
                    return Ok(value);
                }
                Err(err) => {
                    tx.at(FailedStep::Commit);
                    EngineError::store(err)
                }
            },
            Err(err) => err,
        };

        match self.store.rollback() {
            Ok(()) => {
                logging::log_ledger("rollback", operation);
                if failure.is_recoverable() {
                    logging::log_rejection(operation, failure.kind(), &failure.to_string());
                } else {
                    logging::log_rolled_back_failure(operation, failure.kind(), &failure.to_string());
                }
                Err(failure)
            }
            Err(rollback_err) => match tx.debit {
                Some(ctx) => Err(self.report_partial_failure(
                    operation,
                    now,
                    ctx,
                    tx.step.unwrap_or(FailedStep::Commit),
                    format!("{}; rollback failed: {}", failure, rollback_err),
                )),
                None => Err(EngineError::Store {
                    msg: format!("{}; rollback failed: {}", failure, rollback_err),
                }),
            },
        }
    }

    fn report_partial_failure(
        &mut self,
        operation: &str,
        now: DateTime<Utc>,
        ctx: DebitContext,
        step: FailedStep,
        cause: String,
    ) -> EngineError {
        let failure = PartialFailure {
            operation: operation.to_string(),
            buyer_id: ctx.payer_id,
            seller_id: ctx.seller_id,
            property_id: ctx.property_id,
            amount: ctx.amount,
            step,
            cause,
        };
        let incident_id = new_id("inc");
        logging::log_partial_failure(obj(&[
            ("incident_id", v_str(&incident_id)),
            ("operation", v_str(&failure.operation)),
            ("user_id", v_str(&failure.buyer_id)),
            ("seller_id", json!(failure.seller_id)),
            ("property_id", json!(failure.property_id)),
            ("amount", json!(failure.amount)),
            ("step", v_str(failure.step.as_str())),
            ("msg", v_str(&failure.cause)),
        ]));
        if let Some(journal) = self.journal.as_mut() {
            if let Err(err) = journal.record_failure(now.timestamp_millis(), &incident_id, &failure) {
                logging::log(
                    logging::Level::Fatal,
                    logging::Domain::Reconcile,
                    "journal_write_failed",
                    obj(&[("incident_id", v_str(&incident_id)), ("msg", v_str(&err.to_string()))]),
                );
            }
        }
        EngineError::PartialFailureAfterDebit(Box::new(failure))
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    pub fn claim_starter_home(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<Property, EngineError> {
        let property = self.transact("claim_starter_home", now, |store, _tx, check| {
            let owned = store.properties_of(user_id).map_err(store_err)?;
            if owned.iter().any(|p| p.is_starter) {
                return Err(EngineError::AlreadyHasStarter { user_id: user_id.to_string() });
            }
            let property = Property::new(
                new_id("prop"),
                user_id.to_string(),
                STARTER_BASE_VALUE,
                true,
                None,
                now,
            );
            store.create_property(&property).map_err(store_err)?;
            store.upsert_deed(&property.id, user_id).map_err(store_err)?;
            if check {
                invariants::assert_property_invariants(&property)?;
            }
            Ok(property)
        })?;
        let balance = self.store.balance(user_id).unwrap_or(0);
        logging::log_acquisition("starter_claimed", user_id, &property.id, 0, balance);
        Ok(property)
    }

    pub fn buy_tiered_home(
        &mut self,
        user_id: &str,
        tier: HomeTier,
        now: DateTime<Utc>,
    ) -> Result<Property, EngineError> {
        let def = tier.def();
        let property = self.transact("buy_tiered_home", now, |store, tx, check| {
            let available = store.balance(user_id).map_err(store_err)?;
            if !store.debit(user_id, def.price).map_err(store_err)? {
                return Err(EngineError::InsufficientFunds {
                    user_id: user_id.to_string(),
                    needed: def.price,
                    available,
                });
            }
            let property = Property::new(new_id("prop"), user_id.to_string(), def.price, false, Some(tier), now);
            tx.debited(DebitContext {
                payer_id: user_id.to_string(),
                seller_id: None,
                property_id: Some(property.id.clone()),
                amount: def.price,
            });

            tx.at(FailedStep::CreateProperty);
            store.create_property(&property).map_err(store_err)?;
            tx.at(FailedStep::IssueDeed);
            store.upsert_deed(&property.id, user_id).map_err(store_err)?;
            if check {
                invariants::assert_property_invariants(&property)?;
            }
            Ok(property)
        })?;
        let balance = self.store.balance(user_id).unwrap_or(0);
        logging::log_acquisition("tier_purchased", user_id, &property.id, def.price, balance);
        Ok(property)
    }

    // =========================================================================
    // Upgrades
    // =========================================================================

    /// Pay for an upgrade and open its installation in the pending state.
    pub fn start_upgrade(
        &mut self,
        user_id: &str,
        property_id: &str,
        kind: UpgradeKind,
        now: DateTime<Utc>,
    ) -> Result<UpgradeInstallation, EngineError> {
        let def: &UpgradeDef = kind.def();
        let inst = self.transact("start_upgrade", now, |store, tx, check| {
            let property = load_property(store, property_id)?;
            if property.owner_id != user_id {
                return Err(EngineError::NotOwner {
                    property_id: property_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            let existing = store.upgrade_installations(property_id).map_err(store_err)?;
            upgrade::check_can_start(property_id, kind, &existing)?;

            let available = store.balance(user_id).map_err(store_err)?;
            if !store.debit(user_id, def.cost).map_err(store_err)? {
                return Err(EngineError::InsufficientFunds {
                    user_id: user_id.to_string(),
                    needed: def.cost,
                    available,
                });
            }
            tx.debited(DebitContext {
                payer_id: user_id.to_string(),
                seller_id: None,
                property_id: Some(property_id.to_string()),
                amount: def.cost,
            });

            let inst = UpgradeInstallation::pending(
                new_id("inst"),
                property_id.to_string(),
                def,
                tasks_required_for(def, &property),
                now,
            );
            tx.at(FailedStep::CreateInstallation);
            store.create_installation(&inst).map_err(store_err)?;
            if check {
                invariants::assert_installation_invariants(&inst)?;
            }
            Ok(inst)
        })?;
        logging::log_upgrade("upgrade_started", &inst.id, property_id, 0, inst.tasks_required_total);
        Ok(inst)
    }

    /// Record one finished task; the last one installs the upgrade.
    pub fn complete_task(
        &mut self,
        installation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpgradeInstallation, EngineError> {
        let (inst, outcome) = self.transact("complete_task", now, |store, _tx, check| {
            let mut inst = store
                .get_installation(installation_id)
                .map_err(store_err)?
                .ok_or_else(|| EngineError::NotFound { what: "installation", id: installation_id.to_string() })?;
            let mut property = load_property(store, &inst.property_id)?;

            let outcome = upgrade::apply_task(&mut inst, &mut property, now)?;
            store.update_installation(&inst).map_err(store_err)?;
            if outcome == TaskOutcome::Installed {
                store.update_property(&property).map_err(store_err)?;
            }
            if check {
                invariants::assert_installation_invariants(&inst)?;
                invariants::assert_property_invariants(&property)?;
            }
            Ok((inst, outcome))
        })?;
        let event = match outcome {
            TaskOutcome::Installed => "upgrade_installed",
            TaskOutcome::Progressed { .. } => "task_completed",
        };
        logging::log_upgrade(event, &inst.id, &inst.property_id, inst.tasks_completed, inst.tasks_required_total);
        Ok(inst)
    }

    // =========================================================================
    // Listings
    // =========================================================================

    pub fn list_for_sale(
        &mut self,
        user_id: &str,
        property_id: &str,
        ask_price: i64,
        now: DateTime<Utc>,
    ) -> Result<Property, EngineError> {
        if ask_price <= 0 {
            return Err(EngineError::InvalidAmount { amount: ask_price });
        }
        let (property, value, cap) = self.transact("list_for_sale", now, |store, _tx, check| {
            let mut property = load_owned(store, user_id, property_id)?;
            let (value, cap) = value_and_cap(&property, now);
            if ask_price > cap {
                return Err(EngineError::ExceedsListingCap { ask_price, cap });
            }
            property.is_listed = true;
            property.ask_price = Some(ask_price);
            store.update_property(&property).map_err(store_err)?;
            if check {
                invariants::assert_listing_within_cap(ask_price, cap)?;
                invariants::assert_property_invariants(&property)?;
            }
            Ok((property, value, cap))
        })?;
        logging::log_listing(&property.id, property.ask_price, value, cap);
        Ok(property)
    }

    /// Withdraw a listing. Cancelling an unlisted property is a no-op.
    pub fn cancel_listing(
        &mut self,
        user_id: &str,
        property_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Property, EngineError> {
        let property = self.transact("cancel_listing", now, |store, _tx, _check| {
            let mut property = load_owned(store, user_id, property_id)?;
            if property.is_listed {
                property.clear_listing();
                store.update_property(&property).map_err(store_err)?;
            }
            Ok(property)
        })?;
        let value = compute_system_value(&property, now);
        logging::log_listing(&property.id, None, value, listing_cap(value));
        Ok(property)
    }

    /// Buy `listing` as the buyer saw it.
    ///
    /// If the stored row no longer matches that view (sold, repriced or
    /// withdrawn) the purchase fails with `NoLongerListed` and no coins move.
    pub fn buy_listed_property(
        &mut self,
        buyer_id: &str,
        listing: &Property,
        now: DateTime<Utc>,
    ) -> Result<DeedTransfer, EngineError> {
        if !listing.is_listed || listing.ask_price.is_none() {
            return Err(EngineError::NotListed { property_id: listing.id.clone() });
        }
        let transfer = self.transact("buy_listed_property", now, |store, tx, check| {
            let current = load_property(store, &listing.id)?;
            if current.owner_id == buyer_id {
                return Err(EngineError::AlreadyOwned { property_id: current.id.clone() });
            }
            let ask_price = match current.ask_price {
                Some(price)
                    if current.is_listed
                        && current.owner_id == listing.owner_id
                        && current.ask_price == listing.ask_price =>
                {
                    price
                }
                _ => return Err(EngineError::NoLongerListed { property_id: current.id.clone() }),
            };

            let (system_value, cap) = value_and_cap(&current, now);
            if ask_price > cap {
                return Err(EngineError::ExceedsListingCap { ask_price, cap });
            }

            let seller_id = current.owner_id.clone();
            let before = touched_total(store, buyer_id, &seller_id)?;

            let available = store.balance(buyer_id).map_err(store_err)?;
            if !store.debit(buyer_id, ask_price).map_err(store_err)? {
                return Err(EngineError::InsufficientFunds {
                    user_id: buyer_id.to_string(),
                    needed: ask_price,
                    available,
                });
            }
            tx.debited(DebitContext {
                payer_id: buyer_id.to_string(),
                seller_id: Some(seller_id.clone()),
                property_id: Some(current.id.clone()),
                amount: ask_price,
            });

            let fee = deed_fee(ask_price);
            let seller_net = ask_price - fee;
            invariants::assert_fee_split(ask_price, fee, seller_net)?;

            tx.at(FailedStep::CreditSeller);
            store.credit(&seller_id, seller_net).map_err(store_err)?;
            tx.at(FailedStep::CreditFeePool);
            store.credit_fee_pool(fee).map_err(store_err)?;

            tx.at(FailedStep::TransferOwnership);
            let mut sold = current.clone();
            sold.owner_id = buyer_id.to_string();
            sold.clear_listing();
            sold.is_starter = false;
            store.update_property(&sold).map_err(store_err)?;

            tx.at(FailedStep::RepointDeed);
            let deed = store.upsert_deed(&sold.id, buyer_id).map_err(store_err)?;

            tx.at(FailedStep::AppendTransfer);
            let prev_hash = store.last_transfer_hash().map_err(store_err)?.unwrap_or_default();
            let mut transfer = DeedTransfer {
                id: new_id("xfer"),
                deed_id: deed.id,
                property_id: sold.id.clone(),
                seller_id: seller_id.clone(),
                buyer_id: buyer_id.to_string(),
                sale_price: ask_price,
                deed_fee: fee,
                seller_net,
                system_value_at_sale: system_value,
                created_at: now,
                prev_hash,
                record_hash: String::new(),
            };
            transfer.record_hash = transfer.compute_hash();
            store.append_deed_transfer(&transfer).map_err(store_err)?;

            if check {
                let after = touched_total(store, buyer_id, &seller_id)?;
                invariants::assert_conservation(before, after)?;
                invariants::assert_property_invariants(&sold)?;
            }
            Ok(transfer)
        })?;
        logging::log_sale(
            &transfer.id,
            &transfer.property_id,
            &transfer.seller_id,
            &transfer.buyer_id,
            transfer.sale_price,
            transfer.deed_fee,
            transfer.seller_net,
        );
        Ok(transfer)
    }

    // =========================================================================
    // Read-only queries
    // =========================================================================

    pub fn property(&self, property_id: &str) -> Result<Property, EngineError> {
        load_property(&self.store, property_id)
    }

    pub fn properties_of(&self, owner_id: &str) -> Result<Vec<Property>, EngineError> {
        self.store.properties_of(owner_id).map_err(store_err)
    }

    pub fn system_value(&self, property_id: &str, now: DateTime<Utc>) -> Result<i64, EngineError> {
        Ok(compute_system_value(&self.property(property_id)?, now))
    }

    pub fn installations(&self, property_id: &str) -> Result<Vec<UpgradeInstallation>, EngineError> {
        self.store.upgrade_installations(property_id).map_err(store_err)
    }

    /// Upgrades the owner can still buy for this property.
    pub fn available_upgrades(&self, property_id: &str) -> Result<Vec<&'static UpgradeDef>, EngineError> {
        load_property(&self.store, property_id)?;
        Ok(upgrade::available_upgrades(&self.installations(property_id)?))
    }

    pub fn deed(&self, property_id: &str) -> Result<Deed, EngineError> {
        self.store
            .get_deed(property_id)
            .map_err(store_err)?
            .ok_or_else(|| EngineError::NotFound { what: "deed", id: property_id.to_string() })
    }

    pub fn deed_transfers(&self, filter: &TransferFilter) -> Result<Vec<DeedTransfer>, EngineError> {
        self.store.deed_transfers(filter).map_err(store_err)
    }

    /// Current deeds grouped by owner, ordered by owner id.
    pub fn deeds_by_owner(&self) -> Result<Vec<OwnerDeeds>, EngineError> {
        let mut groups: BTreeMap<String, Vec<Deed>> = BTreeMap::new();
        for deed in self.store.all_deeds().map_err(store_err)? {
            groups.entry(deed.owner_id.clone()).or_default().push(deed);
        }
        Ok(groups
            .into_iter()
            .map(|(owner_id, deeds)| OwnerDeeds { owner_id, deeds })
            .collect())
    }

    pub fn fee_pool_balance(&self) -> Result<i64, EngineError> {
        self.store.fee_pool_balance().map_err(store_err)
    }

    pub fn balance(&self, user_id: &str) -> Result<i64, EngineError> {
        self.store.balance(user_id).map_err(store_err)
    }

    /// Verify the hash chain over the most recent transfers.
    pub fn audit_transfers(&self) -> Result<usize, EngineError> {
        let mut recent = self.deed_transfers(&TransferFilter::default())?;
        recent.reverse();
        invariants::verify_transfer_chain(&recent)?;
        Ok(recent.len())
    }
}

fn load_property<S: LedgerStore>(store: &S, property_id: &str) -> Result<Property, EngineError> {
    store
        .get_property(property_id)
        .map_err(store_err)?
        .ok_or_else(|| EngineError::NotFound { what: "property", id: property_id.to_string() })
}

fn load_owned<S: LedgerStore>(store: &S, user_id: &str, property_id: &str) -> Result<Property, EngineError> {
    let property = load_property(store, property_id)?;
    if property.owner_id != user_id {
        return Err(EngineError::NotOwner {
            property_id: property_id.to_string(),
            user_id: user_id.to_string(),
        });
    }
    Ok(property)
}

/// Buyer + seller + fee pool.
/// Value and listing cap at `now`, logged with their components.
fn value_and_cap(property: &Property, now: DateTime<Utc>) -> (i64, i64) {
    let b = valuation_breakdown(property, now);
    let cap = listing_cap(b.system_value);
    logging::log_valuation(logging::valuation_fields(
        &property.id,
        b.months,
        b.base_component,
        b.upgrade_component,
        b.system_value,
        cap,
    ));
    (b.system_value, cap)
}

fn touched_total<S: LedgerStore>(store: &S, buyer_id: &str, seller_id: &str) -> Result<i64, EngineError> {
    let buyer = store.balance(buyer_id).map_err(store_err)?;
    let seller = store.balance(seller_id).map_err(store_err)?;
    let pool = store.fee_pool_balance().map_err(store_err)?;
    Ok(buyer + seller + pool)
}
