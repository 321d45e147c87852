//! Error types for the entitlement core.
//!
//! Two enums exist because the *deny* path (a valid request that the
//! meter refuses) is distinct from the *fault* path (something in the
//! plumbing broke). Only the latter is a [`CoreError`]; a deny is a
//! normal, successful return value carrying a [`DeniedReason`].

use thiserror::Error;

/// Why a `verify`/`reportUsage` call was denied. Always stable and
/// machine-readable; the accompanying human message is free-form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeniedReason {
    /// No entitlement exists for `(customer, project, feature)`.
    EntitlementNotFound,
    /// The entitlement exists but failed validation for an unspecified reason.
    EntitlementError,
    /// The meter's limit was exceeded under a non-`always` overage strategy.
    LimitExceeded,
    /// The feature is disabled at the project/workspace level.
    FeatureDisabled,
    /// `now` falls before the entitlement's `effectiveAt`.
    NotActive,
    /// `now` falls at or after the entitlement's `expiresAt`.
    Expired,
    /// The grant backing the entitlement was revoked.
    Revoked,
}

impl DeniedReason {
    /// Stable wire string for this denial reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntitlementNotFound => "ENTITLEMENT_NOT_FOUND",
            Self::EntitlementError => "ENTITLEMENT_ERROR",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::NotActive => "NOT_ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
        }
    }
}

/// Fault-path error surfaced by the core. Every fallible entrypoint
/// returns `Result<T, CoreError>`; the actor never panics on a request
/// fault.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No row / no grant / no customer.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input failed validation before it reached storage.
    #[error("invalid input: {0}")]
    SchemaInvalid(String),

    /// Downstream I/O exhausted its retry budget.
    #[error("fetch failed after retries: {0}")]
    FetchFailed(String),

    /// The reconciler observed drift beyond `MAX_DRIFT` and refused to apply it.
    #[error("drift too large: {drift}")]
    DriftTooLarge {
        /// The computed `analyticsUsage - snapshotUsage` delta that was rejected.
        drift: f64,
    },

    /// The merge/resolve step was asked to operate on an empty grant set.
    #[error("no active grants for subject")]
    NoGrants,

    /// The merge/resolve step was handed grants for more than one feature slug.
    #[error("grants span multiple feature slugs")]
    FeatureMismatch,

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(#[from] crate::entitlement::storage::StorageError),

    /// Cache-layer failure.
    #[error("cache error: {0}")]
    Cache(#[from] crate::entitlement::cache::CacheError),

    /// Catch-all guard; logged at ERROR and surfaced as a generic deny.
    #[error("unhandled: {0}")]
    Unhandled(String),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;
