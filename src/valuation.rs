//! System value of a property.
//!
//! Base value decays 0.5% per 30-day month while the value carried by
//! installed upgrades appreciates 0.2% per month at a 75% resale rate. The
//! condition factor scales only the base component. Everything here is pure:
//! the caller supplies `now`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Property;

pub const BASE_MONTHLY_RATE: f64 = -0.005;
pub const UPGRADE_MONTHLY_RATE: f64 = 0.002;
pub const UPGRADE_RETURN: f64 = 0.75;
pub const DAYS_PER_MONTH: i64 = 30;

/// Listing cap as a percentage of system value.
pub const LISTING_CAP_PCT: i64 = 115;

/// Whole 30-day months between creation and `now`, never negative.
pub fn months_elapsed(created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let days = (now - created_at).num_days();
    if days <= 0 {
        return 0;
    }
    days / DAYS_PER_MONTH
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValuationBreakdown {
    pub months: i64,
    pub condition_factor: f64,
    pub base_inflation: f64,
    pub upgrade_inflation: f64,
    pub base_component: f64,
    pub upgrade_component: f64,
    pub system_value: i64,
}

pub fn valuation_breakdown(property: &Property, now: DateTime<Utc>) -> ValuationBreakdown {
    let months = months_elapsed(property.created_at, now);
    let exponent = months.min(i32::MAX as i64) as i32;
    let condition_factor = property.condition_factor();
    let base_inflation = (1.0 + BASE_MONTHLY_RATE).powi(exponent);
    let upgrade_inflation = (1.0 + UPGRADE_MONTHLY_RATE).powi(exponent);

    let base_component = property.base_value as f64 * base_inflation * condition_factor;
    let upgrade_component = property.upgrade_spend_total as f64 * UPGRADE_RETURN * upgrade_inflation;

    let total = base_component + upgrade_component;
    let system_value = if total.is_finite() && total > 0.0 {
        total.round().min(i64::MAX as f64) as i64
    } else {
        0
    };

    ValuationBreakdown {
        months,
        condition_factor,
        base_inflation,
        upgrade_inflation,
        base_component,
        upgrade_component,
        system_value,
    }
}

pub fn compute_system_value(property: &Property, now: DateTime<Utc>) -> i64 {
    valuation_breakdown(property, now).system_value
}

/// Highest ask price allowed for a property with this system value.
pub fn listing_cap(system_value: i64) -> i64 {
    let v = system_value.max(0) as i128;
    i64::try_from((v * LISTING_CAP_PCT as i128 + 50) / 100).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn starter() -> Property {
        Property::new("p-1".to_string(), "u-1".to_string(), 1500, true, None, created())
    }

    #[test]
    fn test_months_floor_and_clamp() {
        let c = created();
        assert_eq!(months_elapsed(c, c), 0);
        assert_eq!(months_elapsed(c, c + Duration::days(29)), 0);
        assert_eq!(months_elapsed(c, c + Duration::days(30)), 1);
        assert_eq!(months_elapsed(c, c + Duration::days(89)), 2);
        assert_eq!(months_elapsed(c, c - Duration::days(400)), 0);
    }

    #[test]
    fn test_listing_cap_saturates() {
        assert_eq!(listing_cap(i64::MAX), i64::MAX);
        assert_eq!(listing_cap(i64::MAX / 115 * 100), (i64::MAX / 115 * 100) / 100 * 115);
        assert_eq!(listing_cap(-5), 0);
    }

    #[test]
    fn test_fresh_starter_is_worth_base() {
        assert_eq!(compute_system_value(&starter(), created()), 1500);
    }

    #[test]
    fn test_ten_months_of_decay() {
        let now = created() + Duration::days(300);
        let b = valuation_breakdown(&starter(), now);
        assert_eq!(b.months, 10);
        assert!((b.base_component - 1426.67).abs() < 0.01);
        assert_eq!(b.system_value, 1427);
    }

    #[test]
    fn test_upgrade_component_appreciates() {
        let mut p = starter();
        p.upgrade_spend_total = 1000;
        assert_eq!(compute_system_value(&p, created()), 1500 + 750);
        let later = valuation_breakdown(&p, created() + Duration::days(360));
        assert!(later.upgrade_component > 750.0);
    }

    #[test]
    fn test_condition_clamped_at_read() {
        let mut p = starter();
        p.condition_bps = 20_000;
        assert_eq!(compute_system_value(&p, created()), 1650);
        p.condition_bps = 0;
        assert_eq!(compute_system_value(&p, created()), 1275);
    }

    #[test]
    fn test_negative_inputs_floor_at_zero() {
        let mut p = starter();
        p.base_value = -10_000;
        assert_eq!(compute_system_value(&p, created()), 0);
    }

    #[test]
    fn test_deterministic() {
        let now = created() + Duration::days(1234);
        let p = starter();
        assert_eq!(compute_system_value(&p, now), compute_system_value(&p, now));
    }

    #[test]
    fn test_listing_cap_rounding() {
        assert_eq!(listing_cap(1000), 1150);
        assert_eq!(listing_cap(1500), 1725);
        assert_eq!(listing_cap(1), 1); // 1.15 rounds down
        assert_eq!(listing_cap(10), 12); // 11.5 rounds up
        assert_eq!(listing_cap(0), 0);
    }
}
