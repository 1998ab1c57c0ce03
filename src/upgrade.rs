//! Upgrade installation lifecycle: pending → installed.

use chrono::{DateTime, Utc};

use crate::catalog::{UpgradeDef, UpgradeKind, UPGRADE_CATALOG};
use crate::error::EngineError;
use crate::model::{clamp_condition, InstallStatus, Property, UpgradeInstallation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Progressed { completed: u32, required: u32 },
    Installed,
}

/// Reject a new purchase of `kind` when one is installed or still pending.
pub fn check_can_start(
    property_id: &str,
    kind: UpgradeKind,
    existing: &[UpgradeInstallation],
) -> Result<(), EngineError> {
    for inst in existing.iter().filter(|i| i.upgrade == kind) {
        match inst.status {
            InstallStatus::Installed => {
                return Err(EngineError::AlreadyInstalled {
                    property_id: property_id.to_string(),
                    upgrade: kind.id().to_string(),
                })
            }
            InstallStatus::Pending => {
                return Err(EngineError::UpgradeInProgress {
                    property_id: property_id.to_string(),
                    upgrade: kind.id().to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Catalog entries that can still be started on a property.
pub fn available_upgrades(existing: &[UpgradeInstallation]) -> Vec<&'static UpgradeDef> {
    UPGRADE_CATALOG
        .iter()
        .filter(|def| !existing.iter().any(|i| i.upgrade == def.kind))
        .collect()
}

/// Record one finished task.
///
/// The final task flips the installation to installed and applies its cost
/// and condition impact to `property`. Both values are mutated in place; the
/// caller persists them together or not at all.
pub fn apply_task(
    inst: &mut UpgradeInstallation,
    property: &mut Property,
    now: DateTime<Utc>,
) -> Result<TaskOutcome, EngineError> {
    if inst.is_installed() {
        return Err(EngineError::AlreadyInstalled {
            property_id: inst.property_id.clone(),
            upgrade: inst.upgrade.id().to_string(),
        });
    }
    if inst.property_id != property.id {
        return Err(EngineError::InvariantViolation {
            msg: format!("installation {} does not belong to property {}", inst.id, property.id),
        });
    }

    inst.tasks_completed = inst.tasks_completed.saturating_add(1).min(inst.tasks_required_total);
    if inst.tasks_completed < inst.tasks_required_total {
        return Ok(TaskOutcome::Progressed {
            completed: inst.tasks_completed,
            required: inst.tasks_required_total,
        });
    }

    inst.status = InstallStatus::Installed;
    inst.installed_at = Some(now);
    property.upgrade_spend_total = property.upgrade_spend_total.saturating_add(inst.cost);
    property.condition_bps = clamp_condition(property.condition_bps + inst.condition_impact_bps);
    Ok(TaskOutcome::Installed)
}
