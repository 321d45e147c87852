//! End-to-end scenarios exercising the composed entitlement stack
//! (grants -> resolver -> meter -> storage -> cache) against in-memory
//! doubles, one integration test per numbered scenario.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use entitlement_core::config::Config;
use entitlement_core::entitlement::aggregation::AggregationMethod;
use entitlement_core::entitlement::analytics::{AnalyticsClient, FakeAnalyticsClient, UsageEvent};
use entitlement_core::entitlement::cache::CacheLayer;
use entitlement_core::entitlement::context::RequestContext;
use entitlement_core::entitlement::cycle::{IntervalUnit, PlanType, ResetConfig};
use entitlement_core::entitlement::error::DeniedReason;
use entitlement_core::entitlement::grants::store::MemoryGrantStore;
use entitlement_core::entitlement::grants::{
    BillingConfig, FeatureMetadata, FeaturePlanVersion, FeatureType, Grant, GrantStore, GrantType,
    OverageStrategy, PricingConfig, SubjectKind, UsageMode,
};
use entitlement_core::entitlement::model::{Entitlement, EntitlementState, MergingPolicy, MeterState};
use entitlement_core::entitlement::reconciler::{self, ReconcileContext, ReconcileOutcome};
use entitlement_core::entitlement::service::{EntitlementService, ReportUsageRequest, VerifyRequest};
use entitlement_core::entitlement::storage::{EntitlementStorage, MemoryEntitlementStorage};
use entitlement_core::entitlement::ulid;

/// A freshly wired service plus the grant store handle backing it, so
/// tests can seed grants directly without the service exposing one.
fn build_service() -> (EntitlementService, Arc<dyn GrantStore>) {
    let grants: Arc<dyn GrantStore> = Arc::new(MemoryGrantStore::new());
    let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::default());
    let analytics: Arc<dyn AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
    let cache = Arc::new(CacheLayer::new(1000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let negative_cache = Arc::new(CacheLayer::new(1000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let acl_cache = Arc::new(CacheLayer::new(1000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let entitlements_cache = Arc::new(CacheLayer::new(1000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let current_usage_cache = Arc::new(CacheLayer::new(1000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let service = EntitlementService::new(
        grants.clone(),
        storage,
        analytics,
        cache,
        negative_cache,
        acl_cache,
        entitlements_cache,
        current_usage_cache,
        Config::default(),
    );
    (service, grants)
}

fn feature(
    overage: OverageStrategy,
    feature_type: FeatureType,
    usage_mode: UsageMode,
    reset: Option<ResetConfig>,
    anchor: chrono::DateTime<Utc>,
) -> FeaturePlanVersion {
    FeaturePlanVersion {
        feature_slug: "api_calls".into(),
        feature_type,
        aggregation_method: AggregationMethod::Sum,
        usage_mode,
        billing_config: BillingConfig {
            name: "monthly".into(),
            billing_interval: IntervalUnit::Month,
            billing_interval_count: 1,
            plan_type: PlanType::Recurring,
            billing_anchor: anchor,
        },
        reset_config: reset,
        metadata: FeatureMetadata { overage_strategy: overage, ..Default::default() },
        config: PricingConfig::default(),
    }
}

fn grant(id: &str, grant_type: GrantType, limit: Option<f64>, feature: FeaturePlanVersion, effective_at: chrono::DateTime<Utc>) -> Grant {
    let now = Utc::now();
    Grant {
        id: id.into(),
        subject_kind: SubjectKind::Customer,
        subject_id: "cust_1".into(),
        project_id: "proj_1".into(),
        feature_plan_version_id: format!("fpv_{id}"),
        feature,
        grant_type,
        limit,
        anchor: effective_at,
        effective_at,
        expires_at: None,
        auto_renew: false,
        deleted: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Scenario 1: basic sum usage under limit.
#[tokio::test]
async fn scenario_basic_sum_usage_under_limit() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let f = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    grants.insert(grant("g1", GrantType::Subscription, Some(100.0), f, now - chrono::Duration::days(1))).await.unwrap();

    let ctx = RequestContext::new("cust_1", "proj_1", now, None);
    service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 10.0, idempotence_key: "r1".into() }).await.unwrap();
    service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "r2".into() }).await.unwrap();

    let verify = service.verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: Default::default() }).await.unwrap();
    assert!(verify.allowed);
    assert_eq!(verify.usage, 15.0);
    assert_eq!(verify.remaining, Some(85.0));
}

/// Scenario 2: limit crossed, overage=none.
#[tokio::test]
async fn scenario_limit_crossed_overage_none() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let f = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    grants.insert(grant("g1", GrantType::Subscription, Some(10.0), f, now - chrono::Duration::days(1))).await.unwrap();
    let ctx = RequestContext::new("cust_1", "proj_1", now, None);

    let first = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 7.0, idempotence_key: "r1".into() }).await.unwrap();
    assert!(first.allowed);

    let second = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "r2".into() }).await.unwrap();
    assert!(!second.allowed);
    assert_eq!(second.denied_reason, Some(DeniedReason::LimitExceeded));
    assert_eq!(second.usage, 7.0);
}

/// Scenario 3: last-call overage.
#[tokio::test]
async fn scenario_last_call_overage() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let f = feature(OverageStrategy::LastCall, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    grants.insert(grant("g1", GrantType::Subscription, Some(10.0), f, now - chrono::Duration::days(1))).await.unwrap();
    let ctx = RequestContext::new("cust_1", "proj_1", now, None);

    assert!(service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 6.0, idempotence_key: "r1".into() }).await.unwrap().allowed);
    let crossing = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 6.0, idempotence_key: "r2".into() }).await.unwrap();
    assert!(crossing.allowed, "the call that crosses the limit is still allowed");
    let denied = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 1.0, idempotence_key: "r3".into() }).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.usage, 12.0);
}

/// Scenario 4: idempotency.
#[tokio::test]
async fn scenario_idempotent_report_replay() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let f = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    grants.insert(grant("g1", GrantType::Subscription, Some(100.0), f, now - chrono::Duration::days(1))).await.unwrap();
    let ctx = RequestContext::new("cust_1", "proj_1", now, None);

    let first = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "k".into() }).await.unwrap();
    assert!(first.allowed);
    assert!(!first.already_recorded);

    let replay = service.report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "k".into() }).await.unwrap();
    assert!(replay.allowed);
    assert!(replay.already_recorded);
    assert_eq!(replay.usage, 5.0);
}

/// Scenario 5: cycle reset. A monthly meter re-initializes from
/// analytics at the new cycle's start rather than carrying the prior
/// cycle's total forward.
#[tokio::test]
async fn scenario_cycle_reset_reinitializes_from_analytics() {
    let (service, grants) = build_service();
    let jan_1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let jan_31 = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
    let feb_1 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 1).unwrap();

    let reset = ResetConfig {
        name: "monthly".into(),
        reset_interval: IntervalUnit::Month,
        reset_interval_count: 1,
        plan_type: PlanType::Recurring,
        reset_anchor: jan_1,
    };
    let f = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, Some(reset), jan_1);
    grants.insert(grant("g1", GrantType::Subscription, Some(100.0), f, jan_1)).await.unwrap();

    let jan_ctx = RequestContext::new("cust_1", "proj_1", jan_31, None);
    let report = service.report_usage(&jan_ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 80.0, idempotence_key: "jan".into() }).await.unwrap();
    assert!(report.allowed);
    assert_eq!(report.usage, 80.0);

    let feb_ctx = RequestContext::new("cust_1", "proj_1", feb_1, None);
    let verify = service.verify(&feb_ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: Default::default() }).await.unwrap();
    assert!(verify.allowed);
    assert_eq!(verify.usage, 0.0, "new cycle's meter starts from settled analytics, not the prior cycle's total");
    assert_eq!(verify.remaining, Some(100.0));
}

/// Scenario 6: grant merge, sum policy.
#[tokio::test]
async fn scenario_grant_merge_sum_policy() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let fa = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    let fb = feature(OverageStrategy::None, FeatureType::Usage, UsageMode::Unit, None, now - chrono::Duration::days(1));
    grants.insert(grant("a", GrantType::Subscription, Some(1000.0), fa, now - chrono::Duration::days(1))).await.unwrap();
    grants.insert(grant("b", GrantType::Promotion, Some(500.0), fb, now - chrono::Duration::days(1))).await.unwrap();

    let ctx = RequestContext::new("cust_1", "proj_1", now, None);
    let verify = service.verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: Default::default() }).await.unwrap();
    assert!(verify.allowed);
    assert_eq!(verify.limit, Some(1500.0));
}

/// Scenario 7: grant merge, max policy.
#[tokio::test]
async fn scenario_grant_merge_max_policy() {
    let (service, grants) = build_service();
    let now = Utc::now();
    let fa = feature(OverageStrategy::None, FeatureType::Tier, UsageMode::Tier, None, now - chrono::Duration::days(1));
    let fb = feature(OverageStrategy::None, FeatureType::Tier, UsageMode::Tier, None, now - chrono::Duration::days(1));
    grants.insert(grant("a", GrantType::Subscription, Some(10.0), fa, now - chrono::Duration::days(1))).await.unwrap();
    grants.insert(grant("b", GrantType::Promotion, Some(50.0), fb, now - chrono::Duration::days(1))).await.unwrap();

    let ctx = RequestContext::new("cust_1", "proj_1", now, None);
    let verify = service.verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: Default::default() }).await.unwrap();
    assert!(verify.allowed);
    assert_eq!(verify.limit, Some(50.0));
}

/// Scenario 8: drift rejection — a reconcile pass that would apply a
/// drift beyond `MAX_DRIFT` leaves the meter unchanged and aborts.
#[tokio::test]
async fn scenario_drift_rejection_leaves_meter_unchanged() {
    let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::default());
    let analytics: Arc<dyn AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
    let config = Config::default();
    let now = Utc::now();
    let watermark = now - chrono::Duration::from_std(config.reconcile_watermark).unwrap();

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
    let seed_id = ulid::ulid(watermark - chrono::Duration::minutes(1));
    let mut meter = MeterState::fresh(now, None);
    meter.usage = 5.0;
    meter.snapshot_usage = 5.0;
    meter.last_reconciled_id = seed_id;
    let key = storage.make_key("proj_1", "cust_1", "api_calls");
    storage.set(EntitlementState { entitlement, meter: Some(meter) }).await.unwrap();

    analytics
        .ingest(UsageEvent {
            id: ulid::ulid(watermark - chrono::Duration::seconds(10)),
            customer_id: "cust_1".into(),
            project_id: "proj_1".into(),
            feature_slug: "api_calls".into(),
            usage: 2000.0,
            timestamp: watermark - chrono::Duration::seconds(10),
        })
        .await
        .unwrap();

    let ctx = ReconcileContext { customer_id: "cust_1".into(), project_id: "proj_1".into(), feature_slug: "api_calls".into() };
    let outcome = reconciler::reconcile(&ctx, &storage, &analytics, &config, now).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Aborted { drift } if drift == 2000.0));

    let unchanged = storage.get(&key).await.unwrap().unwrap();
    assert_eq!(unchanged.meter.unwrap().usage, 5.0, "rejected drift must not mutate the meter");
}

/// Idempotency-key TTL: a replayed key outside the TTL window is treated
/// as new (the TTL cache has already evicted it).
#[tokio::test]
async fn idempotency_key_expires_after_ttl() {
    let storage = MemoryEntitlementStorage::new(Duration::from_millis(50));
    assert!(!storage.has_idempotence_key("cust_1", "api_calls", "k").await.unwrap());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!storage.has_idempotence_key("cust_1", "api_calls", "k").await.unwrap(), "expired key must be re-evaluated, not treated as a replay");
}
