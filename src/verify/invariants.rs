use crate::error::EngineError;
use crate::model::{
    DeedTransfer, InstallStatus, Property, UpgradeInstallation, CONDITION_MAX_BPS,
    CONDITION_MIN_BPS,
};

#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub msg: String,
}

impl From<InvariantViolation> for EngineError {
    fn from(v: InvariantViolation) -> Self {
        EngineError::InvariantViolation { msg: v.msg }
    }
}

fn violation(msg: String) -> InvariantViolation {
    InvariantViolation { msg }
}

pub fn assert_fee_split(sale_price: i64, deed_fee: i64, seller_net: i64) -> Result<(), InvariantViolation> {
    if deed_fee < 0 || seller_net < 0 {
        return Err(violation(format!("negative split fee={} net={}", deed_fee, seller_net)));
    }
    if deed_fee + seller_net != sale_price {
        return Err(violation(format!(
            "fee {} + net {} != sale price {}",
            deed_fee, seller_net, sale_price
        )));
    }
    Ok(())
}

/// Coins held by the accounts an operation touched must not change in total.
pub fn assert_conservation(before: i64, after: i64) -> Result<(), InvariantViolation> {
    if before != after {
        return Err(violation(format!("coin total moved from {} to {}", before, after)));
    }
    Ok(())
}

pub fn assert_listing_within_cap(ask_price: i64, cap: i64) -> Result<(), InvariantViolation> {
    if ask_price > cap {
        return Err(violation(format!("ask {} above cap {}", ask_price, cap)));
    }
    Ok(())
}

pub fn assert_property_invariants(p: &Property) -> Result<(), InvariantViolation> {
    if !(CONDITION_MIN_BPS..=CONDITION_MAX_BPS).contains(&p.condition_bps) {
        return Err(violation(format!("condition {} out of range on {}", p.condition_bps, p.id)));
    }
    if p.upgrade_spend_total < 0 {
        return Err(violation(format!("negative upgrade spend on {}", p.id)));
    }
    if p.is_listed != p.ask_price.is_some() {
        return Err(violation(format!("listing flag and ask price disagree on {}", p.id)));
    }
    Ok(())
}

pub fn assert_installation_invariants(i: &UpgradeInstallation) -> Result<(), InvariantViolation> {
    if i.tasks_completed > i.tasks_required_total {
        return Err(violation(format!("installation {} over-completed", i.id)));
    }
    match i.status {
        InstallStatus::Installed if i.tasks_completed != i.tasks_required_total => {
            Err(violation(format!("installation {} installed with tasks outstanding", i.id)))
        }
        InstallStatus::Pending if i.installed_at.is_some() => {
            Err(violation(format!("pending installation {} has an install time", i.id)))
        }
        _ => Ok(()),
    }
}

/// Check the hash chain of transfers given oldest first.
///
/// The first record's link is taken on trust so a window of recent history
/// can be checked on its own.
pub fn verify_transfer_chain(transfers: &[DeedTransfer]) -> Result<(), InvariantViolation> {
    let mut prev = transfers.first().map(|t| t.prev_hash.clone()).unwrap_or_default();
    for t in transfers {
        if t.prev_hash != prev {
            return Err(violation(format!("transfer {} does not link to its predecessor", t.id)));
        }
        if t.compute_hash() != t.record_hash {
            return Err(violation(format!("transfer {} was altered", t.id)));
        }
        assert_fee_split(t.sale_price, t.deed_fee, t.seller_net)?;
        prev = t.record_hash.clone();
    }
    Ok(())
}
