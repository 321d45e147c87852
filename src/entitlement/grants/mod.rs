//! Grant model and Grant Store (component C).

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entitlement::aggregation::AggregationMethod;
use crate::entitlement::cycle::ResetConfig;

/// What kind of entity a grant was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SubjectKind {
    /// Issued directly to a customer.
    Customer,
    /// Issued to a project.
    Project,
    /// Issued to a plan.
    Plan,
    /// Issued to a specific plan version.
    PlanVersion,
}

/// Why the grant exists; determines its merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum GrantType {
    /// Standing subscription entitlement.
    Subscription,
    /// Purchased add-on.
    Addon,
    /// Time-boxed trial.
    Trial,
    /// Marketing promotion.
    Promotion,
    /// Manually issued (support, ops override).
    Manual,
}

impl GrantType {
    /// Derived priority — higher wins ties in `replace`/`max`/`min` merges:
    /// subscription=10, addon=20, trial=60, promotion=70, manual=80.
    pub const fn priority(self) -> i32 {
        match self {
            Self::Subscription => 10,
            Self::Addon => 20,
            Self::Trial => 60,
            Self::Promotion => 70,
            Self::Manual => 80,
        }
    }
}

/// Which merging policy a feature type selects when grants are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    /// On/off feature, never consumes.
    Flat,
    /// Tiered pricing, max-merged.
    Tier,
    /// Packaged pricing, max-merged.
    Package,
    /// Usage-metered; merge policy depends on `usage_mode`.
    Usage,
}

/// Sub-mode of a `usage` feature, only meaningful when `feature_type == Usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    /// Tiered usage pricing — merges like `tier`/`package` (max).
    Tier,
    /// Per-unit usage pricing — merges additively (sum).
    Unit,
    /// Packaged usage pricing — merges additively (sum).
    Package,
}

/// What happens once usage crosses the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverageStrategy {
    /// Deny once the limit is reached.
    None,
    /// Allow the call that crosses the limit, deny the next.
    LastCall,
    /// Always allow; flag when usage crosses the notify threshold.
    Always,
}

/// One tier in a tiered-pricing waterfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    /// First unit (inclusive) this tier covers.
    pub first_unit: u64,
    /// Last unit (inclusive) this tier covers, or `None` for unbounded.
    pub last_unit: Option<u64>,
    /// Price per unit within this tier, in integer cents.
    pub unit_price_cents: i64,
}

/// One package in packaged pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePackage {
    /// Units included per package.
    pub units_per_package: u64,
    /// Price per package, in integer cents.
    pub package_price_cents: i64,
}

/// Pricing configuration carried by a `FeaturePlanVersion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PricingConfig {
    /// Tiered pricing waterfall, if this feature bills by tier.
    pub tiers: Vec<PriceTier>,
    /// Packaged pricing, if this feature bills by package.
    pub packages: Vec<PricePackage>,
    /// Flat unit price, for simple per-unit billing.
    pub flat_unit_price_cents: Option<i64>,
}

/// Operational metadata carried by a `FeaturePlanVersion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    /// Overage handling strategy.
    pub overage_strategy: OverageStrategy,
    /// Percentage (0.0-1.0) at which `always`-strategy features flag `overThreshold`.
    pub notify_usage_threshold: f64,
    /// Whether exceeding the limit should block the customer at the ACL level.
    pub block_customer: bool,
    /// Whether this feature is hidden from customer-facing usage summaries.
    pub hidden: bool,
    /// Whether usage should be reflected in real time vs. batched.
    pub realtime: bool,
}

impl Default for FeatureMetadata {
    fn default() -> Self {
        Self {
            overage_strategy: OverageStrategy::None,
            notify_usage_threshold: 0.95,
            block_customer: false,
            hidden: false,
            realtime: true,
        }
    }
}

/// Billing cadence configuration, shares the reset-config shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Cadence label.
    pub name: String,
    /// Calendar unit of the billing interval.
    pub billing_interval: crate::entitlement::cycle::IntervalUnit,
    /// Number of units per billing interval.
    pub billing_interval_count: u32,
    /// Recurring vs. one-time.
    pub plan_type: crate::entitlement::cycle::PlanType,
    /// Anchor timestamp for billing-period alignment.
    pub billing_anchor: DateTime<Utc>,
}

/// Per-grant configuration embedded on the grant, describing the feature
/// it entitles and how it is priced/reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturePlanVersion {
    /// The feature this grant entitles.
    pub feature_slug: String,
    /// Feature type, drives merge-policy derivation.
    pub feature_type: FeatureType,
    /// Aggregation method, drives meter behavior.
    pub aggregation_method: AggregationMethod,
    /// Usage sub-mode, only meaningful for `feature_type == Usage`.
    pub usage_mode: UsageMode,
    /// Billing cadence.
    pub billing_config: BillingConfig,
    /// Reset cadence, if the feature is period-scoped.
    pub reset_config: Option<ResetConfig>,
    /// Operational metadata.
    pub metadata: FeatureMetadata,
    /// Pricing configuration.
    pub config: PricingConfig,
}

/// A unit of entitlement issued to a subject, with its own lifecycle
/// (effective/expiry window, soft-delete) and embedded feature config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Unique grant id.
    pub id: String,
    /// What kind of subject this grant targets.
    pub subject_kind: SubjectKind,
    /// The subject's id (customer id, project id, plan id, or plan-version id).
    pub subject_id: String,
    /// Project this grant is scoped within.
    pub project_id: String,
    /// The feature-plan-version this grant entitles.
    pub feature_plan_version_id: String,
    /// Embedded feature configuration (denormalized for merge/meter use).
    pub feature: FeaturePlanVersion,
    /// Why this grant exists.
    pub grant_type: GrantType,
    /// Maximum usage allowed under this grant, or `None` for unlimited.
    pub limit: Option<f64>,
    /// Anchor used for this grant's own cycle alignment.
    pub anchor: DateTime<Utc>,
    /// When this grant becomes live.
    pub effective_at: DateTime<Utc>,
    /// When this grant stops being live, or `None` for open-ended.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether this grant renews automatically at cycle boundaries.
    pub auto_renew: bool,
    /// Soft-delete flag.
    pub deleted: bool,
    /// Soft-delete timestamp.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    /// Derived priority for merge ordering.
    pub fn priority(&self) -> i32 {
        self.grant_type.priority()
    }

    /// Whether this grant is live at `now`: `effectiveAt <= now < (expiresAt|inf) && !deleted`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.deleted
            && self.effective_at <= now
            && self.expires_at.map_or(true, |exp| now < exp)
    }

    /// Whether this grant is eligible for auto-renewal: `autoRenew` set
    /// and the type is neither `subscription` nor `trial` (those renew
    /// through their own billing lifecycle, not the grant resolver).
    pub fn renews_automatically(&self) -> bool {
        self.auto_renew && !matches!(self.grant_type, GrantType::Subscription | GrantType::Trial)
    }
}

/// Persistent append-only set of grants keyed by subject (component C).
/// Grants are never mutated in place; "deletion" is a soft-delete.
#[async_trait::async_trait]
pub trait GrantStore: Send + Sync {
    /// List grants active for any of `subjects` in `project_id`, live
    /// at `now` (or overlapping `[start, end)` when a range is given).
    async fn list_active_for_subjects(
        &self,
        project_id: &str,
        subjects: &[(SubjectKind, String)],
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>, crate::entitlement::storage::StorageError>;

    /// Insert a grant; no-op on a uniqueness-key conflict.
    async fn insert(&self, grant: Grant) -> Result<(), crate::entitlement::storage::StorageError>;

    /// Soft-delete grants by id for a given subject.
    async fn soft_delete(
        &self,
        ids: &[String],
        project_id: &str,
        subject_kind: SubjectKind,
        subject_id: &str,
    ) -> Result<(), crate::entitlement::storage::StorageError>;
}
