//! Reconciler (component G): folds settled analytics usage back into a
//! live meter, correcting for drift accrued between report-time writes
//! and the analytics pipeline's own settlement lag. Runs at most once
//! per watermark, in the background after any verify/report.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::Config;
use crate::entitlement::aggregation::AggregationBehavior;
use crate::entitlement::analytics::AnalyticsClient;
use crate::entitlement::cycle::cycle_window;
use crate::entitlement::error::CoreError;
use crate::entitlement::grants::FeatureType;
use crate::entitlement::model::EntitlementState;
use crate::entitlement::storage::EntitlementStorage;
use crate::entitlement::ulid;

/// Why a reconciliation pass did nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Flat features and non-`sum` behaviors never drift.
    NotApplicable,
    /// The watermark and current instant fall in different cycles; the
    /// cycle-reset path will re-baseline the meter instead.
    CycleBoundaryCrossed,
    /// The meter is already caught up to (or past) the watermark cursor.
    AlreadyReconciled,
    /// The cycle started after the watermark; nothing to settle yet.
    CycleTooFresh,
    /// The meter has never been initialized (`lastReconciledId == ""`).
    /// Distinct from the other skips: this is unexpected enough to log.
    NeverInitialized,
    /// No persisted state exists for this key at all.
    NoState,
}

/// Outcome of one reconciliation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing needed doing.
    Skipped(SkipReason),
    /// Drift exceeded `|analyticsUsage - snapshotUsage| > MAX_DRIFT`
    /// and was rejected rather than applied.
    Aborted { drift: f64 },
    /// Drift was within tolerance (`<= EPSILON`); cursor not advanced.
    WithinTolerance { drift: f64 },
    /// Drift was applied and the cursor advanced.
    Reconciled { drift: f64, new_usage: f64, advanced_to: String },
}

/// Coordinates to reconcile: one (customer, project, feature) meter.
pub struct ReconcileContext {
    /// Customer scope.
    pub customer_id: String,
    /// Project scope.
    pub project_id: String,
    /// Feature scope.
    pub feature_slug: String,
}

/// Run the 8-step protocol for `ctx` against `storage`/`analytics`, using
/// `now` as the reconciliation instant (the watermark is derived from it).
pub async fn reconcile(
    ctx: &ReconcileContext,
    storage: &Arc<dyn EntitlementStorage>,
    analytics: &Arc<dyn AnalyticsClient>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, CoreError> {
    let key = storage.make_key(&ctx.project_id, &ctx.customer_id, &ctx.feature_slug);
    let Some(state) = storage.get(&key).await? else {
        return Ok(ReconcileOutcome::Skipped(SkipReason::NoState));
    };
    let Some(meter) = &state.meter else {
        return Ok(ReconcileOutcome::Skipped(SkipReason::NoState));
    };

    // Step 1: flat features and non-sum behaviors never drift.
    let behavior = state.entitlement.aggregation_method.config().behavior;
    if matches!(state.entitlement.feature_type, FeatureType::Flat) || !matches!(behavior, AggregationBehavior::Sum) {
        return Ok(ReconcileOutcome::Skipped(SkipReason::NotApplicable));
    }

    let watermark = now - chrono::Duration::from_std(config.reconcile_watermark).unwrap_or(chrono::Duration::minutes(5));

    // Step 2: skip if the watermark and current instant fall in different cycles.
    let watermark_cycle = cycle_window(
        state.entitlement.effective_at,
        state.entitlement.expires_at,
        watermark,
        state.entitlement.reset_config.as_ref(),
        None,
    );
    let current_cycle = cycle_window(
        state.entitlement.effective_at,
        state.entitlement.expires_at,
        now,
        state.entitlement.reset_config.as_ref(),
        None,
    );
    match (watermark_cycle, current_cycle) {
        (Some(w), Some(c)) if w.start == c.start => {}
        _ => return Ok(ReconcileOutcome::Skipped(SkipReason::CycleBoundaryCrossed)),
    }
    let watermark_cycle = watermark_cycle.unwrap();

    // Step 3.
    let effective_at = watermark_cycle.start;

    // Step 4.
    let last_reconciled_id = meter.last_reconciled_id.clone();
    let before_record_id = ulid::ulid(watermark);

    // Step 5.
    if !last_reconciled_id.is_empty() && last_reconciled_id >= before_record_id {
        return Ok(ReconcileOutcome::Skipped(SkipReason::AlreadyReconciled));
    }
    if watermark < effective_at {
        return Ok(ReconcileOutcome::Skipped(SkipReason::CycleTooFresh));
    }
    if last_reconciled_id.is_empty() {
        warn!(customer_id = %ctx.customer_id, feature_slug = %ctx.feature_slug, "reconciler: meter never initialized, skipping");
        return Ok(ReconcileOutcome::Skipped(SkipReason::NeverInitialized));
    }

    // Step 6: pull settled analytics events and the freshest live state in parallel.
    let (events_result, refreshed_result) = tokio::join!(
        analytics.get_features_usage_cursor(&ctx.customer_id, &ctx.project_id, &ctx.feature_slug, &last_reconciled_id, watermark),
        storage.get(&key),
    );
    let events = events_result.map_err(|e| CoreError::FetchFailed(e.to_string()))?;
    let refreshed = refreshed_result?.unwrap_or(state);

    let analytics_delta: f64 = events.iter().map(|e| e.usage).sum();
    let analytics_last_id = events.iter().map(|e| e.id.clone()).max().unwrap_or_else(|| before_record_id.clone());
    let analytics_usage = refreshed.meter.as_ref().map_or(0.0, |m| m.snapshot_usage) + analytics_delta;
    let snapshot_last_reconciled_usage = refreshed.meter.as_ref().map_or(0.0, |m| m.snapshot_usage);
    let snapshot_current_usage = refreshed.meter.as_ref().map_or(0.0, |m| m.usage);

    // Step 7.
    let drift = analytics_usage - snapshot_last_reconciled_usage;
    if drift.abs() > config.max_drift {
        error!(customer_id = %ctx.customer_id, feature_slug = %ctx.feature_slug, drift, "reconciler: drift exceeds MAX_DRIFT, aborting");
        return Ok(ReconcileOutcome::Aborted { drift });
    }
    if drift.abs() <= config.reconcile_epsilon {
        return Ok(ReconcileOutcome::WithinTolerance { drift });
    }

    // Absorb out-of-band writes, then overwrite with the live snapshot,
    // then advance the cursor — order matters: the live value always wins.
    let applied = snapshot_current_usage + drift;
    let new_usage = snapshot_current_usage;
    let mut new_state = refreshed;
    if let Some(meter) = new_state.meter.as_mut() {
        meter.usage = applied;
        meter.usage = new_usage;
        meter.snapshot_usage = new_usage;
        meter.last_reconciled_id = analytics_last_id.clone();
        meter.last_updated = now;
    }

    // Step 8.
    storage.set(new_state).await?;

    Ok(ReconcileOutcome::Reconciled { drift, new_usage, advanced_to: analytics_last_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::aggregation::AggregationMethod;
    use crate::entitlement::analytics::{FakeAnalyticsClient, UsageEvent};
    use crate::entitlement::grants::OverageStrategy;
    use crate::entitlement::model::{Entitlement, MergingPolicy, MeterState};
    use crate::entitlement::storage::MemoryEntitlementStorage;

    fn base_state(now: DateTime<Utc>, last_reconciled_id: String) -> EntitlementState {
        let entitlement = Entitlement {
            id: "ent_1".into(),
            project_id: "proj_1".into(),
            customer_id: "cust_1".into(),
            feature_slug: "api_calls".into(),
            feature_type: FeatureType::Usage,
            limit: Some(1000.0),
            aggregation_method: AggregationMethod::Sum,
            reset_config: None,
            merging_policy: MergingPolicy::Sum,
            overage_strategy: OverageStrategy::None,
            grants: vec![],
            version: "v1".into(),
            effective_at: now - chrono::Duration::days(1),
            expires_at: None,
            next_revalidate_at: now + chrono::Duration::hours(1),
            computed_at: now,
            updated_at: now,
            metadata: Default::default(),
        };
        let mut meter = MeterState::fresh(now - chrono::Duration::minutes(10), None);
        meter.usage = 10.0;
        meter.snapshot_usage = 10.0;
        meter.last_reconciled_id = last_reconciled_id;
        EntitlementState { entitlement, meter: Some(meter) }
    }

    async fn setup(
        now: DateTime<Utc>,
        last_reconciled_id: String,
    ) -> (Arc<dyn EntitlementStorage>, Arc<dyn AnalyticsClient>, ReconcileContext) {
        let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::default());
        let analytics: Arc<dyn AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
        let state = base_state(now, last_reconciled_id);
        let key = storage.make_key("proj_1", "cust_1", "api_calls");
        storage.set(state).await.unwrap();
        let _ = key;
        let ctx = ReconcileContext { customer_id: "cust_1".into(), project_id: "proj_1".into(), feature_slug: "api_calls".into() };
        (storage, analytics, ctx)
    }

    #[tokio::test]
    async fn never_initialized_meter_is_skipped_with_warning() {
        let now = Utc::now();
        let (storage, analytics, ctx) = setup(now, String::new()).await;
        let config = Config::default();
        let outcome = reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::NeverInitialized));
    }

    #[tokio::test]
    async fn small_drift_is_ignored_without_advancing_cursor() {
        let now = Utc::now();
        let watermark = now - chrono::Duration::minutes(5);
        let seed_id = ulid::ulid(watermark - chrono::Duration::minutes(1));
        let (storage, analytics, ctx) = setup(now, seed_id.clone()).await;
        let config = Config::default();
        let outcome = reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::WithinTolerance { drift: 0.0 });
    }

    #[tokio::test]
    async fn drift_beyond_epsilon_is_applied_and_cursor_advances() {
        let now = Utc::now();
        let watermark = now - chrono::Duration::minutes(5);
        let seed_id = ulid::ulid(watermark - chrono::Duration::minutes(1));
        let (storage, analytics, ctx) = setup(now, seed_id.clone()).await;
        let event_id = ulid::ulid(watermark - chrono::Duration::seconds(30));
        analytics
            .ingest(UsageEvent {
                id: event_id.clone(),
                customer_id: "cust_1".into(),
                project_id: "proj_1".into(),
                feature_slug: "api_calls".into(),
                usage: 5.0,
                timestamp: watermark - chrono::Duration::seconds(30),
            })
            .await
            .unwrap();
        let config = Config::default();
        let outcome = reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
        match outcome {
            ReconcileOutcome::Reconciled { drift, advanced_to, .. } => {
                assert_eq!(drift, 5.0);
                assert_eq!(advanced_to, event_id);
            }
            other => panic!("expected Reconciled, got {other:?}"),
        }
        let state = storage.get(&storage.make_key("proj_1", "cust_1", "api_calls")).await.unwrap().unwrap();
        assert_eq!(state.meter.unwrap().last_reconciled_id, event_id);
    }

    #[tokio::test]
    async fn drift_beyond_max_drift_is_aborted() {
        let now = Utc::now();
        let watermark = now - chrono::Duration::minutes(5);
        let seed_id = ulid::ulid(watermark - chrono::Duration::minutes(1));
        let (storage, analytics, ctx) = setup(now, seed_id.clone()).await;
        analytics
            .ingest(UsageEvent {
                id: ulid::ulid(watermark - chrono::Duration::seconds(30)),
                customer_id: "cust_1".into(),
                project_id: "proj_1".into(),
                feature_slug: "api_calls".into(),
                usage: 5000.0,
                timestamp: watermark - chrono::Duration::seconds(30),
            })
            .await
            .unwrap();
        let config = Config::default();
        let outcome = reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Aborted { drift: 5000.0 });
    }

    #[tokio::test]
    async fn flat_feature_is_not_applicable() {
        let now = Utc::now();
        let (storage, analytics, ctx) = setup(now, "seed".into()).await;
        let mut state = storage.get(&storage.make_key("proj_1", "cust_1", "api_calls")).await.unwrap().unwrap();
        state.entitlement.feature_type = FeatureType::Flat;
        storage.set(state).await.unwrap();
        let config = Config::default();
        let outcome = reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::NotApplicable));
    }
}
