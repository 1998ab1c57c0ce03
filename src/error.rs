use std::fmt;

use serde::{Deserialize, Serialize};

/// Which step of a multi-step operation failed after coins were debited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStep {
    CreditSeller,
    CreditFeePool,
    TransferOwnership,
    RepointDeed,
    AppendTransfer,
    CreateProperty,
    IssueDeed,
    CreateInstallation,
    Commit,
}

impl FailedStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedStep::CreditSeller => "credit_seller",
            FailedStep::CreditFeePool => "credit_fee_pool",
            FailedStep::TransferOwnership => "transfer_ownership",
            FailedStep::RepointDeed => "repoint_deed",
            FailedStep::AppendTransfer => "append_transfer",
            FailedStep::CreateProperty => "create_property",
            FailedStep::IssueDeed => "issue_deed",
            FailedStep::CreateInstallation => "create_installation",
            FailedStep::Commit => "commit",
        }
    }
}

/// Context an operator needs to reconcile a debit that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub operation: String,
    pub buyer_id: String,
    pub seller_id: Option<String>,
    pub property_id: Option<String>,
    pub amount: i64,
    pub step: FailedStep,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InsufficientFunds { user_id: String, needed: i64, available: i64 },
    AlreadyHasStarter { user_id: String },
    AlreadyInstalled { property_id: String, upgrade: String },
    UpgradeInProgress { property_id: String, upgrade: String },
    ExceedsListingCap { ask_price: i64, cap: i64 },
    NotListed { property_id: String },
    AlreadyOwned { property_id: String },
    NoLongerListed { property_id: String },
    NotOwner { property_id: String, user_id: String },
    NotFound { what: &'static str, id: String },
    InvalidAmount { amount: i64 },
    /// Storage failed and the transaction was rolled back; nothing changed.
    Store { msg: String },
    InvariantViolation { msg: String },
    PartialFailureAfterDebit(Box<PartialFailure>),
}

impl EngineError {
    /// Stable identifier callers can match on.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::AlreadyHasStarter { .. } => "already_has_starter",
            EngineError::AlreadyInstalled { .. } => "already_installed",
            EngineError::UpgradeInProgress { .. } => "upgrade_in_progress",
            EngineError::ExceedsListingCap { .. } => "exceeds_listing_cap",
            EngineError::NotListed { .. } => "not_listed",
            EngineError::AlreadyOwned { .. } => "already_owned",
            EngineError::NoLongerListed { .. } => "no_longer_listed",
            EngineError::NotOwner { .. } => "not_owner",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidAmount { .. } => "invalid_amount",
            EngineError::Store { .. } => "store",
            EngineError::InvariantViolation { .. } => "invariant_violation",
            EngineError::PartialFailureAfterDebit(_) => "partial_failure_after_debit",
        }
    }

    /// False for failures that must go to an operator instead of a retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::PartialFailureAfterDebit(_) | EngineError::InvariantViolation { .. }
        )
    }

    pub fn store(err: impl fmt::Display) -> Self {
        EngineError::Store { msg: err.to_string() }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InsufficientFunds { user_id, needed, available } => write!(
                f,
                "user {} needs {} coins but has {}",
                user_id, needed, available
            ),
            EngineError::AlreadyHasStarter { user_id } => {
                write!(f, "user {} already owns a starter home", user_id)
            }
            EngineError::AlreadyInstalled { property_id, upgrade } => {
                write!(f, "{} is already installed on property {}", upgrade, property_id)
            }
            EngineError::UpgradeInProgress { property_id, upgrade } => {
                write!(f, "{} is already being installed on property {}", upgrade, property_id)
            }
            EngineError::ExceedsListingCap { ask_price, cap } => {
                write!(f, "ask price {} exceeds the listing cap of {}", ask_price, cap)
            }
            EngineError::NotListed { property_id } => {
                write!(f, "property {} is not listed for sale", property_id)
            }
            EngineError::AlreadyOwned { property_id } => {
                write!(f, "you already own property {}", property_id)
            }
            EngineError::NoLongerListed { property_id } => {
                write!(f, "the listing for property {} changed or was sold", property_id)
            }
            EngineError::NotOwner { property_id, user_id } => {
                write!(f, "user {} does not own property {}", user_id, property_id)
            }
            EngineError::NotFound { what, id } => write!(f, "{} {} not found", what, id),
            EngineError::InvalidAmount { amount } => {
                write!(f, "amount {} must be positive", amount)
            }
            EngineError::Store { msg } => write!(f, "ledger error (rolled back): {}", msg),
            EngineError::InvariantViolation { msg } => write!(f, "invariant violated: {}", msg),
            EngineError::PartialFailureAfterDebit(p) => write!(
                f,
                "FATAL: {} debited {} coins from {} but failed at {}: {}; manual reconciliation required",
                p.operation,
                p.amount,
                p.buyer_id,
                p.step.as_str(),
                p.cause
            ),
        }
    }
}

impl std::error::Error for EngineError {}
