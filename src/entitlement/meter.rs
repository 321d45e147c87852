//! Usage Meter (component E): an in-memory counter with `verify`/`consume`
//! and a persistable [`MeterState`].

use chrono::{DateTime, Utc};

use crate::entitlement::aggregation::AggregationBehavior;
use crate::entitlement::error::DeniedReason;
use crate::entitlement::grants::{FeatureType, OverageStrategy};
use crate::entitlement::model::{Entitlement, MeterState};

/// Outcome of a `verify`/`consume` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterOutcome {
    /// Whether the call is allowed.
    pub allowed: bool,
    /// Headroom remaining after this call, or `f64::INFINITY` if unlimited.
    pub remaining: f64,
    /// Stable deny reason, if `allowed == false`.
    pub denied_reason: Option<DeniedReason>,
    /// Free-form human message.
    pub message: String,
    /// Whether usage has crossed the notify threshold under `always` overage.
    pub over_threshold: bool,
}

/// Wraps an [`Entitlement`] and its [`MeterState`] to answer `verify`/`consume`.
pub struct UsageMeter {
    entitlement: Entitlement,
    state: MeterState,
}

impl UsageMeter {
    /// Construct from a validated entitlement and its current meter state.
    pub fn new(entitlement: Entitlement, state: MeterState) -> Self {
        Self { entitlement, state }
    }

    /// Read-only verification: does NOT mutate the meter. `proposed`
    /// defaults to 1 unit when checking a prospective consumption rather
    /// than a flat on/off feature.
    pub fn verify(&self, now: DateTime<Utc>, proposed: Option<f64>) -> MeterOutcome {
        if matches!(self.entitlement.feature_type, FeatureType::Flat) {
            return self.verify_flat(now);
        }
        let delta = self.effective_delta(proposed.unwrap_or(1.0));
        self.evaluate(delta, self.state.usage, false)
    }

    /// Mutating consumption: advances the meter and returns the same
    /// outcome shape `verify` would have returned for this delta.
    pub fn consume(&mut self, delta: f64, now: DateTime<Utc>) -> MeterOutcome {
        if matches!(self.entitlement.feature_type, FeatureType::Flat) {
            return self.verify_flat(now);
        }
        let delta = self.effective_delta(delta);
        let behavior = self.entitlement.aggregation_method.config().behavior;
        let new_usage = Self::apply_behavior(behavior, self.state.usage, delta);
        let outcome = self.evaluate(delta, self.state.usage, true);
        if outcome.allowed {
            self.state.usage = new_usage;
            self.state.last_updated = now;
        }
        outcome
    }

    /// `count`/`count_all` contribute exactly 1 per event, regardless of
    /// the caller-supplied delta.
    fn effective_delta(&self, delta: f64) -> f64 {
        if self.entitlement.aggregation_method.counts_events() {
            1.0
        } else {
            delta
        }
    }

    fn verify_flat(&self, now: DateTime<Utc>) -> MeterOutcome {
        let limit_positive = self.entitlement.limit.unwrap_or(0.0) > 0.0;
        let in_window = now >= self.entitlement.effective_at
            && self.entitlement.expires_at.map_or(true, |e| now < e);
        let allowed = limit_positive && in_window;
        MeterOutcome {
            allowed,
            remaining: if allowed { f64::INFINITY } else { 0.0 },
            denied_reason: if allowed {
                None
            } else if !in_window {
                Some(DeniedReason::NotActive)
            } else {
                Some(DeniedReason::LimitExceeded)
            },
            message: if allowed { "flat feature enabled".into() } else { "flat feature not enabled".into() },
            over_threshold: false,
        }
    }

    fn apply_behavior(behavior: AggregationBehavior, usage: f64, delta: f64) -> f64 {
        match behavior {
            AggregationBehavior::None => usage,
            AggregationBehavior::Sum => usage + delta,
            AggregationBehavior::Max => usage.max(delta),
            AggregationBehavior::Last => delta,
        }
    }

    /// Core allow/deny + remaining computation, shared between `verify`
    /// (read-only) and `consume` (mutating) so both paths agree.
    fn evaluate(&self, delta: f64, current_usage: f64, _mutating: bool) -> MeterOutcome {
        let behavior = self.entitlement.aggregation_method.config().behavior;
        let new_usage = Self::apply_behavior(behavior, current_usage, delta);
        let limit = self.entitlement.limit;
        let remaining = match limit {
            Some(l) => l - new_usage,
            None => f64::INFINITY,
        };

        let Some(limit) = limit else {
            return MeterOutcome {
                allowed: true,
                remaining,
                denied_reason: None,
                message: "unlimited".into(),
                over_threshold: false,
            };
        };

        if new_usage <= limit {
            let threshold = self.entitlement.metadata_overage_threshold();
            let over_threshold = matches!(self.entitlement.overage_strategy, OverageStrategy::Always)
                && limit > 0.0
                && new_usage / limit >= threshold;
            return MeterOutcome {
                allowed: true,
                remaining,
                denied_reason: None,
                message: "within limit".into(),
                over_threshold,
            };
        }

        // new_usage > limit: dispatch on overage strategy.
        match self.entitlement.overage_strategy {
            OverageStrategy::None => MeterOutcome {
                allowed: false,
                remaining,
                denied_reason: Some(DeniedReason::LimitExceeded),
                message: "limit exceeded".into(),
                over_threshold: false,
            },
            OverageStrategy::LastCall => {
                // Allow the call that crosses the limit; deny once we were
                // already at/over it before this call.
                if current_usage < limit {
                    MeterOutcome {
                        allowed: true,
                        remaining,
                        denied_reason: None,
                        message: "allowed: crosses limit on this call".into(),
                        over_threshold: false,
                    }
                } else {
                    MeterOutcome {
                        allowed: false,
                        remaining,
                        denied_reason: Some(DeniedReason::LimitExceeded),
                        message: "limit already crossed".into(),
                        over_threshold: false,
                    }
                }
            }
            OverageStrategy::Always => MeterOutcome {
                allowed: true,
                remaining,
                denied_reason: None,
                message: "allowed over limit".into(),
                over_threshold: true,
            },
        }
    }

    /// Reconciliation-driven write: updates `usage`, `snapshotUsage`, and
    /// `lastReconciledId` atomically, bypassing the allow/deny decision
    /// path entirely.
    pub fn apply_reconciliation(&mut self, usage: f64, snapshot_usage: f64, last_reconciled_id: String, now: DateTime<Utc>) {
        self.state.usage = usage;
        self.state.snapshot_usage = snapshot_usage;
        self.state.last_reconciled_id = last_reconciled_id;
        self.state.last_updated = now;
    }

    /// Extract the persistable meter state.
    pub fn to_persist(&self) -> MeterState {
        self.state.clone()
    }

    /// Current usage value.
    pub fn usage(&self) -> f64 {
        self.state.usage
    }
}

impl Entitlement {
    fn metadata_overage_threshold(&self) -> f64 {
        self.metadata
            .get("overage_notify_threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.95)
    }
}
