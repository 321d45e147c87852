//! Aggregation Config (component A): a compile-time table mapping an
//! aggregation method to its `(behavior, scope, resets)` semantics.

use serde::{Deserialize, Serialize};

/// How successive usage deltas combine into the running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationBehavior {
    /// No accumulation; flat features never consume.
    None,
    /// Additive: `usage += delta` (`count` adds 1 per event instead of `delta`).
    Sum,
    /// Ceiling: `usage = max(usage, delta)`.
    Max,
    /// Replacement: `usage = delta`.
    Last,
}

/// Whether the meter resets at cycle boundaries or accumulates for the
/// entitlement's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationScope {
    /// Bounded by `[cycleStart, cycleEnd)`.
    Period,
    /// Bounded by the merged grant's `[effectiveAt, expiresAt)`.
    Lifetime,
}

/// One of the eight aggregation methods a `FeaturePlanVersion` can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Flat features: no accumulation, resets with the cycle.
    None,
    /// Sum within the current cycle.
    Sum,
    /// Count of events (each worth 1) within the current cycle.
    Count,
    /// Ceiling within the current cycle.
    Max,
    /// Last value observed within the current cycle.
    LastDuringPeriod,
    /// Sum across the entitlement's whole lifetime.
    SumAll,
    /// Count across the entitlement's whole lifetime.
    CountAll,
    /// Ceiling across the entitlement's whole lifetime.
    MaxAll,
}

/// The resolved `(behavior, scope, resets)` triple for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationConfig {
    /// How deltas combine.
    pub behavior: AggregationBehavior,
    /// Period- or lifetime-scoped.
    pub scope: AggregationScope,
    /// Whether the meter re-initializes at cycle boundaries.
    pub resets: bool,
}

impl AggregationMethod {
    /// Look up this method's `(behavior, scope, resets)` triple. Pure,
    /// no I/O — the table lives entirely in code.
    pub const fn config(self) -> AggregationConfig {
        use AggregationBehavior::*;
        use AggregationScope::*;
        match self {
            Self::None => AggregationConfig { behavior: None, scope: Period, resets: true },
            Self::Sum => AggregationConfig { behavior: Sum, scope: Period, resets: true },
            Self::Count => AggregationConfig { behavior: Sum, scope: Period, resets: true },
            Self::Max => AggregationConfig { behavior: Max, scope: Period, resets: true },
            Self::LastDuringPeriod => {
                AggregationConfig { behavior: Last, scope: Period, resets: true }
            }
            Self::SumAll => AggregationConfig { behavior: Sum, scope: Lifetime, resets: false },
            Self::CountAll => AggregationConfig { behavior: Sum, scope: Lifetime, resets: false },
            Self::MaxAll => AggregationConfig { behavior: Max, scope: Lifetime, resets: false },
        }
    }

    /// `true` for `count`/`count_all`, where every event contributes exactly 1
    /// to the running total regardless of the caller-supplied `usage` value.
    pub const fn counts_events(self) -> bool {
        matches!(self, Self::Count | Self::CountAll)
    }
}
