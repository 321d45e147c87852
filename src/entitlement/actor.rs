//! Meter Actor (component J): a single-threaded, per-customer task that
//! serializes requests through an mpsc channel and runs an alarm-driven
//! flush/broadcast loop, built on the `scheduling::scheduler::run` poll
//! loop (`tokio::spawn` per ready job, sleep, repeat) used elsewhere —
//! here the sleep becomes a `tokio::time::interval` raced against the
//! command channel in a single `select!`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::OnceCell;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::entitlement::context::RequestContext;
use crate::entitlement::error::CoreError;
use crate::entitlement::service::{
    AccessControlList, CurrentUsage, EntitlementService, MinimalEntitlement, ReportUsageRequest, ReportUsageResult, VerifyRequest,
    VerifyResult,
};

/// Data-center/region label the actor reports once at construction,
/// fetched from the hosting runtime. A process-local singleton:
/// initialized on first use, never cleared.
#[async_trait::async_trait]
pub trait ColoProvider: Send + Sync {
    /// Fetch the colo label for this process.
    async fn colo(&self) -> String;
}

/// Test/dev double returning a fixed label.
pub struct StaticColoProvider(pub String);

#[async_trait::async_trait]
impl ColoProvider for StaticColoProvider {
    async fn colo(&self) -> String {
        self.0.clone()
    }
}

/// Process-wide colo label, resolved once and reused by every actor
/// spawned in this process — mirrors the `once_cell::sync::Lazy`
/// process registry pattern used for `enterprise::tenant::context`.
static COLO_LABEL: OnceCell<String> = OnceCell::new();

async fn resolve_colo_label(colo: &Arc<dyn ColoProvider>) -> String {
    if let Some(label) = COLO_LABEL.get() {
        return label.clone();
    }
    let label = colo.colo().await;
    let _ = COLO_LABEL.set(label.clone());
    label
}

/// Debug-UI broadcast event, debounced to at most one per second per actor.
#[derive(Debug, Clone)]
pub enum ActorEvent {
    /// A `verify` call completed.
    Verified { feature_slug: String, allowed: bool },
    /// A `reportUsage` call completed.
    Reported { feature_slug: String, usage: f64 },
    /// The alarm fired and flushed pending batches.
    Flushed,
}

enum Command {
    Verify { req: VerifyRequest, ctx: RequestContext, reply: oneshot::Sender<Result<VerifyResult, CoreError>> },
    ReportUsage { req: ReportUsageRequest, ctx: RequestContext, reply: oneshot::Sender<Result<ReportUsageResult, CoreError>> },
    GetCurrentUsage { feature_slugs: Vec<String>, ctx: RequestContext, reply: oneshot::Sender<Result<CurrentUsage, CoreError>> },
    GetAccessControlList { ctx: RequestContext, reply: oneshot::Sender<Result<AccessControlList, CoreError>> },
    GetActiveEntitlements { ctx: RequestContext, reply: oneshot::Sender<Result<Vec<MinimalEntitlement>, CoreError>> },
    ResetEntitlements { feature_slugs: Vec<String>, ctx: RequestContext, reply: oneshot::Sender<Result<(), CoreError>> },
}

/// A handle to a running customer actor: cloneable, cheap, and the only
/// way callers reach the actor's serialized request queue.
#[derive(Clone)]
pub struct CustomerActorHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ActorEvent>,
}

impl CustomerActorHandle {
    /// Serialized `verify` through the actor's single-threaded turn.
    pub async fn verify(&self, ctx: RequestContext, req: VerifyRequest) -> Result<VerifyResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Verify { req, ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Serialized `reportUsage` through the actor's single-threaded turn.
    pub async fn report_usage(&self, ctx: RequestContext, req: ReportUsageRequest) -> Result<ReportUsageResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ReportUsage { req, ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Serialized `getCurrentUsage`.
    pub async fn get_current_usage(&self, ctx: RequestContext, feature_slugs: Vec<String>) -> Result<CurrentUsage, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetCurrentUsage { feature_slugs, ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Serialized ACL read.
    pub async fn get_access_control_list(&self, ctx: RequestContext) -> Result<AccessControlList, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetAccessControlList { ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Serialized `getActiveEntitlements`.
    pub async fn get_active_entitlements(&self, ctx: RequestContext) -> Result<Vec<MinimalEntitlement>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetActiveEntitlements { ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Serialized `resetEntitlements`.
    pub async fn reset_entitlements(&self, ctx: RequestContext, feature_slugs: Vec<String>) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ResetEntitlements { feature_slugs, ctx, reply })
            .await
            .map_err(|_| CoreError::Unhandled("actor channel closed".into()))?;
        rx.await.map_err(|_| CoreError::Unhandled("actor dropped reply".into()))?
    }

    /// Subscribe to debug-UI broadcast events (debounced, best-effort).
    pub fn subscribe(&self) -> broadcast::Receiver<ActorEvent> {
        self.events.subscribe()
    }
}

/// Spawn a single-threaded actor for one customer, serializing all
/// requests through an mpsc queue and running the alarm loop
/// (flush on `min(alarm_max, max(alarm_min, flush_time))`) until the
/// handle is dropped.
pub fn spawn_customer_actor(service: Arc<EntitlementService>, config: Config, colo: Arc<dyn ColoProvider>) -> CustomerActorHandle {
    let (tx, mut rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel(64);
    let events_tx_task = events_tx.clone();

    tokio::spawn(async move {
        let colo_label = resolve_colo_label(&colo).await;
        info!(colo = %colo_label, "customer actor started");
        let mut last_broadcast = tokio::time::Instant::now() - Duration::from_secs(2);
        let mut alarm = tokio::time::interval(config.clamp_alarm(None));

        loop {
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    handle_command(&service, cmd, &events_tx_task, &mut last_broadcast).await;
                }
                _ = alarm.tick() => {
                    if let Err(e) = service_flush(&service).await {
                        warn!(error = %e, "actor alarm flush failed");
                    } else {
                        debug!("actor alarm flush completed");
                    }
                    broadcast_debounced(&events_tx_task, &mut last_broadcast, ActorEvent::Flushed);
                }
            }
        }
        info!("customer actor stopped");
    });

    CustomerActorHandle { tx, events: events_tx }
}

async fn service_flush(service: &Arc<EntitlementService>) -> Result<(), CoreError> {
    service.flush_storage().await
}

async fn handle_command(
    service: &Arc<EntitlementService>,
    cmd: Command,
    events: &broadcast::Sender<ActorEvent>,
    last_broadcast: &mut tokio::time::Instant,
) {
    match cmd {
        Command::Verify { req, ctx, reply } => {
            let feature_slug = req.feature_slug.clone();
            let result = service.verify(&ctx, req).await;
            if let Ok(r) = &result {
                broadcast_debounced(events, last_broadcast, ActorEvent::Verified { feature_slug, allowed: r.allowed });
            }
            let _ = reply.send(result);
        }
        Command::ReportUsage { req, ctx, reply } => {
            let feature_slug = req.feature_slug.clone();
            let result = service.report_usage(&ctx, req).await;
            if let Ok(r) = &result {
                broadcast_debounced(events, last_broadcast, ActorEvent::Reported { feature_slug, usage: r.usage });
            }
            let _ = reply.send(result);
        }
        Command::GetCurrentUsage { feature_slugs, ctx, reply } => {
            let result = service.get_current_usage(&ctx, &feature_slugs).await;
            let _ = reply.send(result);
        }
        Command::GetAccessControlList { ctx, reply } => {
            let result = service.get_access_control_list(&ctx).await;
            let _ = reply.send(result);
        }
        Command::GetActiveEntitlements { ctx, reply } => {
            let result = service.get_active_entitlements(&ctx).await;
            let _ = reply.send(result);
        }
        Command::ResetEntitlements { feature_slugs, ctx, reply } => {
            let result = service.reset_entitlements(&ctx, &feature_slugs).await;
            let _ = reply.send(result);
        }
    }
}

fn broadcast_debounced(events: &broadcast::Sender<ActorEvent>, last_broadcast: &mut tokio::time::Instant, event: ActorEvent) {
    let now = tokio::time::Instant::now();
    if now.duration_since(*last_broadcast) < Duration::from_secs(1) {
        return;
    }
    *last_broadcast = now;
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::analytics::FakeAnalyticsClient;
    use crate::entitlement::cache::CacheLayer;
    use crate::entitlement::grants::store::MemoryGrantStore;
    use crate::entitlement::grants::GrantStore;
    use crate::entitlement::storage::{EntitlementStorage, MemoryEntitlementStorage};
    use std::time::Duration as StdDuration;

    fn build_service() -> Arc<EntitlementService> {
        let grants: Arc<dyn GrantStore> = Arc::new(MemoryGrantStore::new());
        let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::default());
        let analytics: Arc<dyn crate::entitlement::analytics::AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
        let cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let negative_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let acl_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let entitlements_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let current_usage_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        Arc::new(EntitlementService::new(
            grants,
            storage,
            analytics,
            cache,
            negative_cache,
            acl_cache,
            entitlements_cache,
            current_usage_cache,
            Config::default(),
        ))
    }

    #[tokio::test]
    async fn actor_serializes_verify_requests() {
        let service = build_service();
        let colo: Arc<dyn ColoProvider> = Arc::new(StaticColoProvider("iad1".into()));
        let handle = spawn_customer_actor(service, Config::default(), colo);

        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);
        let result = handle
            .verify(ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: None, metadata: Default::default() })
            .await
            .unwrap();
        assert!(!result.allowed); // no grants seeded
    }

    #[tokio::test]
    async fn subscribers_receive_debounced_events() {
        let service = build_service();
        let colo: Arc<dyn ColoProvider> = Arc::new(StaticColoProvider("iad1".into()));
        let handle = spawn_customer_actor(service, Config::default(), colo);
        let mut sub = handle.subscribe();

        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);
        handle
            .verify(ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: None, metadata: Default::default() })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert!(event.is_ok());
    }
}
