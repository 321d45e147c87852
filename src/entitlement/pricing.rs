//! Price calculation (supplemental): turns a usage total into a cost in
//! integer cents via a tiered or packaged waterfall, following the
//! `ProrationCalculation` idiom used elsewhere (credit/due split, cents
//! as `i64`, no floating-point money).

use crate::entitlement::grants::{PricePackage, PriceTier, PricingConfig};

/// Pure pricing functions over a `PricingConfig`.
pub struct PriceCalculator;

impl PriceCalculator {
    /// Compute the cost in integer cents for `usage` units against
    /// `config`. Tiers take priority over packages, which take priority
    /// over a flat unit price; a config with none of the three prices at
    /// zero.
    pub fn waterfall(usage: f64, config: &PricingConfig) -> i64 {
        if !config.tiers.is_empty() {
            return Self::tiered(usage, &config.tiers);
        }
        if !config.packages.is_empty() {
            return Self::packaged(usage, &config.packages);
        }
        if let Some(flat) = config.flat_unit_price_cents {
            return Self::flat(usage, flat);
        }
        0
    }

    fn tiered(usage: f64, tiers: &[PriceTier]) -> i64 {
        let whole_units = usage.max(0.0).ceil() as u64;
        let mut sorted: Vec<&PriceTier> = tiers.iter().collect();
        sorted.sort_by_key(|t| t.first_unit);
        let mut cost: i64 = 0;
        for tier in sorted {
            if whole_units < tier.first_unit {
                continue;
            }
            let tier_last = tier.last_unit.unwrap_or(whole_units);
            let units_in_tier = tier_last.min(whole_units) - tier.first_unit + 1;
            cost += units_in_tier as i64 * tier.unit_price_cents;
        }
        cost
    }

    fn packaged(usage: f64, packages: &[PricePackage]) -> i64 {
        let whole_units = usage.max(0.0).ceil() as u64;
        let smallest = packages.iter().min_by_key(|p| p.units_per_package);
        let Some(pkg) = smallest else { return 0 };
        if pkg.units_per_package == 0 {
            return 0;
        }
        let packages_needed = whole_units.div_ceil(pkg.units_per_package);
        packages_needed as i64 * pkg.package_price_cents
    }

    fn flat(usage: f64, flat_unit_price_cents: i64) -> i64 {
        (usage.max(0.0).ceil() as i64) * flat_unit_price_cents
    }
}
