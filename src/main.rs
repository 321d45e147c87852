//! entitlement-core demo binary: wires the in-memory doubles together,
//! spins up a customer actor, and drives one verify/report/verify cycle
//! so the wiring can be exercised without a Postgres/Redis deployment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use entitlement_core::config::Config;
use entitlement_core::entitlement::actor::{spawn_customer_actor, StaticColoProvider};
use entitlement_core::entitlement::analytics::{AnalyticsClient, FakeAnalyticsClient};
use entitlement_core::entitlement::cache::CacheLayer;
use entitlement_core::entitlement::context::RequestContext;
use entitlement_core::entitlement::grants::store::MemoryGrantStore;
use entitlement_core::entitlement::grants::GrantStore;
use entitlement_core::entitlement::service::{EntitlementService, ReportUsageRequest, VerifyRequest};
use entitlement_core::entitlement::storage::{EntitlementStorage, MemoryEntitlementStorage};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    tracing::info!(version = entitlement_core::VERSION, "entitlement-core starting");

    let config = Config::from_env();
    let grants: Arc<dyn GrantStore> = Arc::new(MemoryGrantStore::new());
    let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::new(config.idempotency_ttl));
    let analytics: Arc<dyn AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
    let cache = Arc::new(CacheLayer::new(10_000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let negative_cache = Arc::new(CacheLayer::new(10_000, Duration::from_secs(30), None, Duration::from_secs(30)));
    let acl_cache = Arc::new(CacheLayer::new(10_000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let entitlements_cache = Arc::new(CacheLayer::new(10_000, Duration::from_secs(60), None, Duration::from_secs(60)));
    let current_usage_cache = Arc::new(CacheLayer::new(10_000, Duration::from_secs(30), None, Duration::from_secs(30)));

    let service = Arc::new(EntitlementService::new(
        grants,
        storage,
        analytics,
        cache,
        negative_cache,
        acl_cache,
        entitlements_cache,
        current_usage_cache,
        config.clone(),
    ));
    let actor = spawn_customer_actor(service, config, Arc::new(StaticColoProvider("local".into())));

    let ctx = RequestContext::new("demo-customer", "demo-project", Utc::now(), None);
    let verify = actor
        .verify(ctx.clone(), VerifyRequest { feature_slug: "api_calls".into(), usage: Some(1.0), metadata: Default::default() })
        .await?;
    tracing::info!(?verify, "initial verify (expected: denied, no grants)");

    let report = actor
        .report_usage(ctx.clone(), ReportUsageRequest { feature_slug: "api_calls".into(), usage: 1.0, idempotence_key: "demo-1".into() })
        .await?;
    tracing::info!(?report, "report_usage against an ungranted feature");

    tracing::info!("entitlement-core demo run complete");
    Ok(())
}
