use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{HomeTier, UpgradeDef, UpgradeKind, STARTER_HOME_NAME};

/// Condition factor bounds and starting point, in basis points.
pub const CONDITION_MIN_BPS: i64 = 8_500;
pub const CONDITION_MAX_BPS: i64 = 11_000;
pub const CONDITION_START_BPS: i64 = 10_000;

pub fn clamp_condition(bps: i64) -> i64 {
    bps.clamp(CONDITION_MIN_BPS, CONDITION_MAX_BPS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub tier: Option<HomeTier>,
    /// Set once at creation.
    pub base_value: i64,
    pub condition_bps: i64,
    /// Sum of installed upgrade costs only.
    pub upgrade_spend_total: i64,
    pub is_starter: bool,
    pub is_listed: bool,
    pub ask_price: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn new(
        id: String,
        owner_id: String,
        base_value: i64,
        is_starter: bool,
        tier: Option<HomeTier>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let name = match tier {
            Some(t) => t.def().name.to_string(),
            None => STARTER_HOME_NAME.to_string(),
        };
        Self {
            id,
            owner_id,
            name,
            tier,
            base_value,
            condition_bps: CONDITION_START_BPS,
            upgrade_spend_total: 0,
            is_starter,
            is_listed: false,
            ask_price: None,
            created_at,
        }
    }

    pub fn condition_factor(&self) -> f64 {
        clamp_condition(self.condition_bps) as f64 / 10_000.0
    }

    pub fn clear_listing(&mut self) {
        self.is_listed = false;
        self.ask_price = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Installed,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStatus::Pending => "pending",
            InstallStatus::Installed => "installed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstallStatus::Pending),
            "installed" => Some(InstallStatus::Installed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeInstallation {
    pub id: String,
    pub property_id: String,
    pub upgrade: UpgradeKind,
    /// Catalog cost at purchase time.
    pub cost: i64,
    /// Catalog impact at purchase time, in basis points.
    pub condition_impact_bps: i64,
    pub status: InstallStatus,
    pub tasks_required_total: u32,
    pub tasks_completed: u32,
    pub created_at: DateTime<Utc>,
    pub installed_at: Option<DateTime<Utc>>,
}

impl UpgradeInstallation {
    pub fn pending(
        id: String,
        property_id: String,
        def: &UpgradeDef,
        tasks_required_total: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            property_id,
            upgrade: def.kind,
            cost: def.cost,
            condition_impact_bps: def.condition_impact_bps,
            status: InstallStatus::Pending,
            tasks_required_total,
            tasks_completed: 0,
            created_at,
            installed_at: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.status == InstallStatus::Installed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deed {
    pub id: String,
    pub property_id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeedTransfer {
    pub id: String,
    pub deed_id: String,
    pub property_id: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub sale_price: i64,
    pub deed_fee: i64,
    pub seller_net: i64,
    pub system_value_at_sale: i64,
    pub created_at: DateTime<Utc>,
    /// `record_hash` of the previous transfer, empty for the first one.
    pub prev_hash: String,
    pub record_hash: String,
}

impl DeedTransfer {
    pub fn compute_hash(&self) -> String {
        crate::ids::chain_hash(&[
            &self.prev_hash,
            &self.id,
            &self.deed_id,
            &self.property_id,
            &self.seller_id,
            &self.buyer_id,
            &self.sale_price.to_string(),
            &self.deed_fee.to_string(),
            &self.seller_net.to_string(),
            &self.system_value_at_sale.to_string(),
            &self.created_at.timestamp_millis().to_string(),
        ])
    }
}

/// Filters for the deed transfer history; all are optional and combine.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub seller_id: Option<String>,
    pub buyer_id: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Maximum rows returned from a history query.
pub const TRANSFER_QUERY_LIMIT: usize = 500;

impl TransferFilter {
    pub fn matches(&self, t: &DeedTransfer) -> bool {
        self.seller_id.as_ref().map_or(true, |s| *s == t.seller_id)
            && self.buyer_id.as_ref().map_or(true, |b| *b == t.buyer_id)
            && self.min_price.map_or(true, |p| t.sale_price >= p)
            && self.max_price.map_or(true, |p| t.sale_price <= p)
            && self.start.map_or(true, |s| t.created_at >= s)
            && self.end.map_or(true, |e| t.created_at <= e)
    }
}

/// Current deeds held by one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerDeeds {
    pub owner_id: String,
    pub deeds: Vec<Deed>,
}
