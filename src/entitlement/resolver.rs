//! Grant Resolver (component D): composes a set of active grants into a
//! single effective [`Entitlement`] using the deterministic merging
//! policy derived from the highest-priority grant's feature type.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::entitlement::error::CoreError;
use crate::entitlement::grants::{FeatureType, Grant, OverageStrategy, UsageMode};
use crate::entitlement::model::{Entitlement, GrantSnapshot, MergingPolicy};

/// Derive the merging policy from a feature type / usage mode pair.
pub fn derive_merging_policy(feature_type: FeatureType, usage_mode: UsageMode) -> MergingPolicy {
    match (feature_type, usage_mode) {
        (FeatureType::Usage, UsageMode::Tier) => MergingPolicy::Max,
        (FeatureType::Usage, _) => MergingPolicy::Sum,
        (FeatureType::Tier, _) | (FeatureType::Package, _) => MergingPolicy::Max,
        (FeatureType::Flat, _) => MergingPolicy::Replace,
    }
}

/// Promote/demote the overage strategy across contributing grants using
/// the cross-grant overage merge table.
pub fn merge_overage_strategy(
    policy: MergingPolicy,
    winner: OverageStrategy,
    contributing: &[OverageStrategy],
) -> OverageStrategy {
    let has = |s: OverageStrategy| contributing.iter().any(|c| *c == s);
    match policy {
        MergingPolicy::Sum | MergingPolicy::Max => {
            if has(OverageStrategy::Always) {
                OverageStrategy::Always
            } else if has(OverageStrategy::LastCall) {
                OverageStrategy::LastCall
            } else {
                winner
            }
        }
        MergingPolicy::Min => {
            if has(OverageStrategy::None) {
                OverageStrategy::None
            } else if has(OverageStrategy::LastCall) {
                OverageStrategy::LastCall
            } else {
                OverageStrategy::Always
            }
        }
        MergingPolicy::Replace => winner,
    }
}

/// Canonical JSON-serializable shape the version hash is computed over.
/// Field order is fixed by this struct's declaration, and the grants
/// vector is sorted by `(priority desc, id)` before hashing so that the
/// hash is stable regardless of input ordering.
#[derive(serde::Serialize)]
struct VersionedSnapshot<'a> {
    grants: Vec<&'a GrantSnapshot>,
}

/// SHA-256 hex digest over the canonical grants snapshot. Any grant
/// mutation (limit, window, priority, config) changes this hash.
pub fn version_hash(grants: &[GrantSnapshot]) -> String {
    let mut sorted: Vec<&GrantSnapshot> = grants.iter().collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    let snapshot = VersionedSnapshot { grants: sorted };
    let bytes = serde_json::to_vec(&snapshot).expect("snapshot is always serializable");
    let digest = Sha256::digest(&bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn to_snapshot(g: &Grant) -> GrantSnapshot {
    GrantSnapshot {
        id: g.id.clone(),
        grant_type: g.grant_type,
        name: None,
        effective_at: g.effective_at,
        expires_at: g.expires_at,
        limit: g.limit,
        priority: g.priority(),
        config: g.feature.config.clone(),
    }
}

/// Compose `grants` (already filtered to "live at now") into a single
/// `Entitlement`. Grants must all target the same `feature_slug`.
pub fn resolve(
    grants: &[Grant],
    now: DateTime<Utc>,
    next_revalidate_at: DateTime<Utc>,
) -> Result<Entitlement, CoreError> {
    if grants.is_empty() {
        return Err(CoreError::NoGrants);
    }
    let feature_slug = &grants[0].feature.feature_slug;
    if grants.iter().any(|g| &g.feature.feature_slug != feature_slug) {
        return Err(CoreError::FeatureMismatch);
    }

    let mut sorted: Vec<&Grant> = grants.iter().collect();
    sorted.sort_by(|a, b| b.priority().cmp(&a.priority()));

    let winner = sorted[0];
    let policy = derive_merging_policy(winner.feature.feature_type, winner.feature.usage_mode);

    let retained: Vec<&Grant> = match policy {
        MergingPolicy::Sum => sorted.clone(),
        MergingPolicy::Max => {
            let best = sorted
                .iter()
                .filter(|g| g.limit.is_some())
                .max_by(|a, b| {
                    a.limit
                        .partial_cmp(&b.limit)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.priority().cmp(&b.priority()))
                })
                .copied()
                .unwrap_or(winner);
            vec![best]
        }
        MergingPolicy::Min => {
            let best = sorted
                .iter()
                .filter(|g| g.limit.is_some())
                .min_by(|a, b| {
                    a.limit
                        .partial_cmp(&b.limit)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.priority().cmp(&a.priority()))
                })
                .copied()
                .unwrap_or(winner);
            vec![best]
        }
        MergingPolicy::Replace => vec![winner],
    };

    let limit = match policy {
        MergingPolicy::Sum => {
            let total: f64 = retained.iter().map(|g| g.limit.unwrap_or(0.0)).sum();
            Some(total)
        }
        MergingPolicy::Max | MergingPolicy::Min | MergingPolicy::Replace => retained[0].limit,
    };

    let effective_at = retained.iter().map(|g| g.effective_at).min().unwrap();
    let expires_at = if matches!(policy, MergingPolicy::Sum) {
        if retained.iter().all(|g| g.expires_at.is_some()) {
            retained.iter().map(|g| g.expires_at.unwrap()).max()
        } else {
            None
        }
    } else {
        retained[0].expires_at
    };

    let grant_snapshots: Vec<GrantSnapshot> = retained.iter().map(|g| to_snapshot(g)).collect();
    let version = version_hash(&grant_snapshots);

    // Pricing config source is the winning grant among the retained set:
    // for `sum` that's the highest-priority contributor, for the
    // single-grant policies it's simply the retained grant.
    let pricing_source = retained
        .iter()
        .max_by_key(|g| g.priority())
        .unwrap_or(&retained[0]);

    let contributing_strategies: Vec<OverageStrategy> =
        retained.iter().map(|g| g.feature.metadata.overage_strategy).collect();
    let overage_strategy = merge_overage_strategy(
        policy,
        winner.feature.metadata.overage_strategy,
        &contributing_strategies,
    );

    Ok(Entitlement {
        id: format!("ent_{}_{}_{}", winner.project_id, winner.subject_id, feature_slug),
        project_id: winner.project_id.clone(),
        customer_id: winner.subject_id.clone(),
        feature_slug: feature_slug.clone(),
        feature_type: winner.feature.feature_type,
        limit,
        aggregation_method: winner.feature.aggregation_method,
        reset_config: winner.feature.reset_config.clone(),
        merging_policy: policy,
        overage_strategy,
        grants: grant_snapshots,
        version,
        effective_at,
        expires_at,
        next_revalidate_at,
        computed_at: now,
        updated_at: now,
        metadata: {
            let mut m = std::collections::HashMap::new();
            m.insert(
                "pricing_source_grant_id".to_string(),
                serde_json::Value::String(pricing_source.id.clone()),
            );
            m
        },
    })
}
