//! Computed and runtime data model: `Entitlement`, `MeterState`,
//! `EntitlementState`, `UsageRecord`, `Verification` — the types that
//! sit between the Grant Resolver (component D) and the Usage Meter
//! (component E).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entitlement::aggregation::AggregationMethod;
use crate::entitlement::cycle::ResetConfig;
use crate::entitlement::error::DeniedReason;
use crate::entitlement::grants::{FeatureType, GrantType, OverageStrategy, PricingConfig};

/// How a set of grants collapses into one effective value, derived from
/// the winning grant's feature type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergingPolicy {
    /// Limits add; earliest start, latest end; all grants retained.
    Sum,
    /// The single grant with the highest non-null limit wins (ties by priority).
    Max,
    /// Dual of `Max`: the single grant with the lowest non-null limit wins.
    Min,
    /// Only the highest-priority grant is retained.
    Replace,
}

/// Immutable snapshot of one grant as captured into an `Entitlement`.
/// Only the fields that feed the version hash and client-facing display
/// are retained — not the full `Grant` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSnapshot {
    /// Source grant id.
    pub id: String,
    /// Source grant type.
    pub grant_type: GrantType,
    /// Display name, if any (plan/addon name).
    pub name: Option<String>,
    /// Effective start carried from the source grant.
    pub effective_at: DateTime<Utc>,
    /// Effective end carried from the source grant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Limit carried from the source grant.
    pub limit: Option<f64>,
    /// Priority carried from the source grant.
    pub priority: i32,
    /// Pricing config carried from the source grant (only meaningful on the winner).
    pub config: PricingConfig,
}

/// The computed, per-(customer, project, featureSlug) merged view of
/// active grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    /// Entitlement id (stable across recomputation for the same key).
    pub id: String,
    /// Project scope.
    pub project_id: String,
    /// Customer scope.
    pub customer_id: String,
    /// Feature this entitlement governs.
    pub feature_slug: String,
    /// Feature type of the winning grant.
    pub feature_type: FeatureType,
    /// Effective merged limit, or `None` for unlimited.
    pub limit: Option<f64>,
    /// Aggregation method (from the winning grant's feature config).
    pub aggregation_method: AggregationMethod,
    /// Reset cadence, if period-scoped.
    pub reset_config: Option<ResetConfig>,
    /// Merge policy used to compute this entitlement.
    pub merging_policy: MergingPolicy,
    /// Overage strategy after cross-grant merge.
    pub overage_strategy: OverageStrategy,
    /// Immutable snapshot of the grants that contributed to this entitlement.
    pub grants: Vec<GrantSnapshot>,
    /// SHA-256 hash over the canonical JSON of `grants`; changes on any
    /// contributing grant mutation.
    pub version: String,
    /// Merged effective start.
    pub effective_at: DateTime<Utc>,
    /// Merged effective end, or `None` for open-ended.
    pub expires_at: Option<DateTime<Utc>>,
    /// Next time this entitlement should be revalidated against storage.
    pub next_revalidate_at: DateTime<Utc>,
    /// When this entitlement was computed.
    pub computed_at: DateTime<Utc>,
    /// Last-updated timestamp.
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata passthrough.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-entitlement runtime counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterState {
    /// Current usage value.
    pub usage: f64,
    /// Usage value as of the last reconciliation.
    pub snapshot_usage: f64,
    /// ULID cursor of the last analytics record folded into the meter.
    /// Empty string means "never initialized".
    pub last_reconciled_id: String,
    /// When the meter was last updated (ms since epoch).
    pub last_updated: DateTime<Utc>,
    /// Start of the cycle this meter is scoped to, if period-scoped.
    pub last_cycle_start: Option<DateTime<Utc>>,
}

impl MeterState {
    /// A freshly initialized, empty meter.
    pub fn fresh(now: DateTime<Utc>, cycle_start: Option<DateTime<Utc>>) -> Self {
        Self {
            usage: 0.0,
            snapshot_usage: 0.0,
            last_reconciled_id: String::new(),
            last_updated: now,
            last_cycle_start: cycle_start,
        }
    }
}

/// The live state held by the actor: an `Entitlement` plus its `MeterState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementState {
    /// The merged entitlement.
    pub entitlement: Entitlement,
    /// The live meter, if one has been initialized for this entitlement.
    pub meter: Option<MeterState>,
}

impl EntitlementState {
    /// Storage/cache key: `proj:cust:feat`.
    pub fn key(&self) -> String {
        make_key(&self.entitlement.project_id, &self.entitlement.customer_id, &self.entitlement.feature_slug)
    }
}

/// Build the canonical `proj:cust:feat` storage/cache key.
pub fn make_key(project_id: &str, customer_id: &str, feature_slug: &str) -> String {
    format!("{project_id}:{customer_id}:{feature_slug}")
}

/// Append-only usage event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    /// ULID, lexicographically sortable by creation time.
    pub id: String,
    /// Customer scope.
    pub customer_id: String,
    /// Project scope.
    pub project_id: String,
    /// Feature scope.
    pub feature_slug: String,
    /// Signed usage delta (negative = refund).
    pub usage: f64,
    /// Event timestamp (caller-supplied, may lag ingestion).
    pub timestamp: DateTime<Utc>,
    /// Client-supplied dedupe token.
    pub idempotence_key: Option<String>,
    /// Request id that produced this record.
    pub request_id: String,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Cost/rate metadata attached at write time.
    #[sqlx(json)]
    pub metadata: UsageRecordMetadata,
    /// Soft-delete flag (0/1 to match the source schema's integer boolean).
    pub deleted: i16,
}

/// Cost/rate metadata embedded on a `UsageRecord`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecordMetadata {
    /// Computed cost delta for this record, in integer cents.
    pub cost: Option<i64>,
    /// Unit price of the tier this usage landed in, in integer cents.
    pub rate: Option<i64>,
    /// Rate amount, if priced as a flat rate rather than per-unit.
    pub rate_amount: Option<f64>,
    /// Currency code for `rate`/`rate_amount`.
    pub rate_currency: Option<String>,
}

/// Append-only verification event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Verification {
    /// Customer scope.
    pub customer_id: String,
    /// Project scope.
    pub project_id: String,
    /// Feature scope.
    pub feature_slug: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Whether the verify call was allowed (0/1 to match the source schema).
    pub allowed: i16,
    /// Deny reason, as its stable wire string, if denied.
    pub denied_reason: Option<String>,
    /// Usage/remaining snapshot metadata.
    #[sqlx(json)]
    pub metadata: VerificationMetadata,
    /// Observed latency in milliseconds.
    pub latency: f64,
    /// Request id.
    pub request_id: String,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Usage/remaining snapshot embedded on a `Verification`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationMetadata {
    /// Usage value observed at verification time.
    pub usage: Option<f64>,
    /// Remaining headroom observed at verification time.
    pub remaining: Option<f64>,
}

impl Verification {
    /// Construct from a deny/allow outcome.
    pub fn new(
        customer_id: String,
        project_id: String,
        feature_slug: String,
        timestamp: DateTime<Utc>,
        allowed: bool,
        denied_reason: Option<DeniedReason>,
        usage: Option<f64>,
        remaining: Option<f64>,
        latency: f64,
        request_id: String,
    ) -> Self {
        Self {
            customer_id,
            project_id,
            feature_slug,
            timestamp,
            allowed: i16::from(allowed),
            denied_reason: denied_reason.map(|r| r.as_str().to_string()),
            metadata: VerificationMetadata { usage, remaining },
            latency,
            request_id,
            created_at: Utc::now(),
        }
    }
}
