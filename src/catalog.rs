//! Static catalogs: property upgrades and purchasable home tiers.
//!
//! Both are closed enumerations keyed by a stable string id so stored rows
//! survive reordering of the tables below.

use serde::{Deserialize, Serialize};

use crate::model::Property;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeCategory {
    Structure,
    Utilities,
    Exterior,
    Interior,
    Security,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeKind {
    FreshPaint,
    Landscaping,
    RoofRepair,
    SecuritySystem,
    PlumbingOverhaul,
    ElectricalRewire,
    KitchenRemodel,
    SolarPanels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeDef {
    pub kind: UpgradeKind,
    pub name: &'static str,
    pub category: UpgradeCategory,
    pub cost: i64,
    /// Added to the condition factor on install, in basis points.
    pub condition_impact_bps: i64,
    pub base_tasks_required: u32,
    pub description: &'static str,
}

const FRESH_PAINT: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::FreshPaint,
    name: "Fresh Paint",
    category: UpgradeCategory::Exterior,
    cost: 300,
    condition_impact_bps: 50,
    base_tasks_required: 1,
    description: "Full exterior repaint in the owner's colors.",
};

const LANDSCAPING: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::Landscaping,
    name: "Landscaping",
    category: UpgradeCategory::Exterior,
    cost: 500,
    condition_impact_bps: 100,
    base_tasks_required: 2,
    description: "Lawn, hedges and a proper front walk.",
};

const ROOF_REPAIR: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::RoofRepair,
    name: "Roof Repair",
    category: UpgradeCategory::Structure,
    cost: 800,
    condition_impact_bps: 200,
    base_tasks_required: 3,
    description: "Replace damaged shingles and flashing.",
};

const SECURITY_SYSTEM: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::SecuritySystem,
    name: "Security System",
    category: UpgradeCategory::Security,
    cost: 900,
    condition_impact_bps: 150,
    base_tasks_required: 3,
    description: "Cameras, door sensors and a monitored alarm.",
};

const PLUMBING_OVERHAUL: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::PlumbingOverhaul,
    name: "Plumbing Overhaul",
    category: UpgradeCategory::Utilities,
    cost: 1200,
    condition_impact_bps: 250,
    base_tasks_required: 4,
    description: "New supply lines, fixtures and water heater.",
};

const ELECTRICAL_REWIRE: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::ElectricalRewire,
    name: "Electrical Rewire",
    category: UpgradeCategory::Utilities,
    cost: 1500,
    condition_impact_bps: 300,
    base_tasks_required: 4,
    description: "Modern panel and rewired circuits throughout.",
};

const KITCHEN_REMODEL: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::KitchenRemodel,
    name: "Kitchen Remodel",
    category: UpgradeCategory::Interior,
    cost: 2500,
    condition_impact_bps: 400,
    base_tasks_required: 5,
    description: "Cabinets, counters and appliances.",
};

const SOLAR_PANELS: UpgradeDef = UpgradeDef {
    kind: UpgradeKind::SolarPanels,
    name: "Solar Panels",
    category: UpgradeCategory::Energy,
    cost: 3000,
    condition_impact_bps: 300,
    base_tasks_required: 6,
    description: "Rooftop array with battery storage.",
};

pub const UPGRADE_CATALOG: &[UpgradeDef] = &[
    FRESH_PAINT,
    LANDSCAPING,
    ROOF_REPAIR,
    SECURITY_SYSTEM,
    PLUMBING_OVERHAUL,
    ELECTRICAL_REWIRE,
    KITCHEN_REMODEL,
    SOLAR_PANELS,
];

impl UpgradeKind {
    pub const ALL: [UpgradeKind; 8] = [
        UpgradeKind::FreshPaint,
        UpgradeKind::Landscaping,
        UpgradeKind::RoofRepair,
        UpgradeKind::SecuritySystem,
        UpgradeKind::PlumbingOverhaul,
        UpgradeKind::ElectricalRewire,
        UpgradeKind::KitchenRemodel,
        UpgradeKind::SolarPanels,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            UpgradeKind::FreshPaint => "fresh_paint",
            UpgradeKind::Landscaping => "landscaping",
            UpgradeKind::RoofRepair => "roof_repair",
            UpgradeKind::SecuritySystem => "security_system",
            UpgradeKind::PlumbingOverhaul => "plumbing_overhaul",
            UpgradeKind::ElectricalRewire => "electrical_rewire",
            UpgradeKind::KitchenRemodel => "kitchen_remodel",
            UpgradeKind::SolarPanels => "solar_panels",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.id() == id)
    }

    pub fn def(&self) -> &'static UpgradeDef {
        match self {
            UpgradeKind::FreshPaint => &FRESH_PAINT,
            UpgradeKind::Landscaping => &LANDSCAPING,
            UpgradeKind::RoofRepair => &ROOF_REPAIR,
            UpgradeKind::SecuritySystem => &SECURITY_SYSTEM,
            UpgradeKind::PlumbingOverhaul => &PLUMBING_OVERHAUL,
            UpgradeKind::ElectricalRewire => &ELECTRICAL_REWIRE,
            UpgradeKind::KitchenRemodel => &KITCHEN_REMODEL,
            UpgradeKind::SolarPanels => &SOLAR_PANELS,
        }
    }
}

// =============================================================================
// Task scaling
// =============================================================================

/// (exclusive upper bound on base value, multiplier in tenths)
pub const TASK_SCALE: &[(i64, u32)] = &[
    (5_000, 10),
    (50_000, 15),
    (250_000, 20),
    (1_000_000, 25),
    (10_000_000, 30),
    (100_000_000, 35),
];

/// Multiplier applied at or above the last breakpoint.
pub const TASK_SCALE_TOP: u32 = 40;

pub fn task_multiplier_tenths(base_value: i64) -> u32 {
    TASK_SCALE
        .iter()
        .find(|(bound, _)| base_value < *bound)
        .map(|(_, m)| *m)
        .unwrap_or(TASK_SCALE_TOP)
}

/// Tasks a new installation of `upgrade` needs on `property`.
///
/// Expensive homes take longer to upgrade. The result is rounded half-up and
/// never below the catalog's base count.
pub fn tasks_required_for(upgrade: &UpgradeDef, property: &Property) -> u32 {
    let base = upgrade.base_tasks_required;
    let tenths = task_multiplier_tenths(property.base_value);
    let scaled = (base * tenths + 5) / 10;
    scaled.max(base)
}

// =============================================================================
// Home tiers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeTier {
    Cottage,
    Bungalow,
    Townhouse,
    Villa,
    Mansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDef {
    pub tier: HomeTier,
    pub level: u8,
    pub name: &'static str,
    pub price: i64,
    pub daily_tax_rate_bps: i64,
    pub maintenance_rate_bps: i64,
}

const COTTAGE_TIER: TierDef = TierDef { tier: HomeTier::Cottage, level: 1, name: "Cottage", price: 5_000, daily_tax_rate_bps: 5, maintenance_rate_bps: 5 };
const BUNGALOW_TIER: TierDef = TierDef { tier: HomeTier::Bungalow, level: 2, name: "Bungalow", price: 25_000, daily_tax_rate_bps: 5, maintenance_rate_bps: 8 };
const TOWNHOUSE_TIER: TierDef = TierDef { tier: HomeTier::Townhouse, level: 3, name: "Townhouse", price: 120_000, daily_tax_rate_bps: 8, maintenance_rate_bps: 10 };
const VILLA_TIER: TierDef = TierDef { tier: HomeTier::Villa, level: 4, name: "Villa", price: 750_000, daily_tax_rate_bps: 10, maintenance_rate_bps: 12 };
const MANSION_TIER: TierDef = TierDef { tier: HomeTier::Mansion, level: 5, name: "Mansion", price: 5_000_000, daily_tax_rate_bps: 12, maintenance_rate_bps: 15 };

pub const HOME_TIERS: &[TierDef] = &[COTTAGE_TIER, BUNGALOW_TIER, TOWNHOUSE_TIER, VILLA_TIER, MANSION_TIER];

pub const STARTER_HOME_NAME: &str = "Starter Home";

impl HomeTier {
    pub const ALL: [HomeTier; 5] = [
        HomeTier::Cottage,
        HomeTier::Bungalow,
        HomeTier::Townhouse,
        HomeTier::Villa,
        HomeTier::Mansion,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            HomeTier::Cottage => "cottage",
            HomeTier::Bungalow => "bungalow",
            HomeTier::Townhouse => "townhouse",
            HomeTier::Villa => "villa",
            HomeTier::Mansion => "mansion",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }

    pub fn def(&self) -> &'static TierDef {
        match self {
            HomeTier::Cottage => &COTTAGE_TIER,
            HomeTier::Bungalow => &BUNGALOW_TIER,
            HomeTier::Townhouse => &TOWNHOUSE_TIER,
            HomeTier::Villa => &VILLA_TIER,
            HomeTier::Mansion => &MANSION_TIER,
        }
    }
}

/// Display estimate of daily tax plus maintenance; the engine never charges it.
pub fn estimated_daily_upkeep(tier: &TierDef) -> i64 {
    tier.price * (tier.daily_tax_rate_bps + tier.maintenance_rate_bps) / 10_000
}
