//! Entitlement Service (component I): the orchestrator tying the Grant
//! Resolver, Usage Meter, Storage, Cache, and Analytics together behind
//! the five entrypoints a transport layer calls into.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::entitlement::analytics::AnalyticsClient;
use crate::entitlement::cache::{CacheLayer, CacheNamespace};
use crate::entitlement::context::RequestContext;
use crate::entitlement::cycle::cycle_window;
use crate::entitlement::error::{CoreError, DeniedReason};
use crate::entitlement::grants::{FeatureType, GrantStore, SubjectKind};
use crate::entitlement::meter::UsageMeter;
use crate::entitlement::model::{EntitlementState, MeterState, Verification};
use crate::entitlement::pricing::PriceCalculator;
use crate::entitlement::reconciler::{self, ReconcileContext};
use crate::entitlement::resolver;
use crate::entitlement::storage::EntitlementStorage;
use crate::entitlement::ulid;

/// `verify` request payload.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Feature being checked.
    pub feature_slug: String,
    /// Proposed consumption; defaults to 1 unit when absent.
    pub usage: Option<f64>,
    /// Free-form passthrough metadata, recorded on the verification.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// `verify` result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    /// Whether the call is allowed.
    pub allowed: bool,
    /// Free-form human message.
    pub message: String,
    /// Stable deny reason, if denied.
    pub denied_reason: Option<DeniedReason>,
    /// Usage observed at verification time.
    pub usage: f64,
    /// Effective limit, if any.
    pub limit: Option<f64>,
    /// Remaining headroom, if computed.
    pub remaining: Option<f64>,
    /// Observed latency in milliseconds.
    pub latency: f64,
    /// Feature type of the resolved entitlement, if one was found.
    pub feature_type: Option<FeatureType>,
}

/// `reportUsage` request payload.
#[derive(Debug, Clone)]
pub struct ReportUsageRequest {
    /// Feature being reported against.
    pub feature_slug: String,
    /// Signed usage delta.
    pub usage: f64,
    /// Client-supplied dedupe token.
    pub idempotence_key: String,
}

/// `reportUsage` result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportUsageResult {
    /// Whether the report was accepted.
    pub allowed: bool,
    /// Remaining headroom after this report, if computed.
    pub remaining: Option<f64>,
    /// Free-form human message.
    pub message: Option<String>,
    /// Stable deny reason, if denied.
    pub denied_reason: Option<DeniedReason>,
    /// Usage after this report.
    pub usage: f64,
    /// Effective limit, if any.
    pub limit: Option<f64>,
    /// Computed cost delta for this report, in integer cents.
    pub cost: Option<i64>,
    /// Whether this call crossed the notify threshold under `always` overage.
    pub notified_over_limit: Option<bool>,
    /// Whether this call was a replay of an already-seen idempotence key.
    pub already_recorded: bool,
}

/// Access-control summary for a customer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControlList {
    /// Whether any blocking feature's usage limit has been reached.
    pub usage_limit_reached: bool,
    /// Whether the customer is administratively disabled.
    pub disabled: bool,
    /// Subscription status label, passed through from the billing system.
    pub subscription_status: String,
}

/// Per-feature usage line in a `CurrentUsage` summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureUsage {
    /// Feature scope.
    pub feature_slug: String,
    /// Current usage value.
    pub usage: f64,
    /// Effective limit, if any.
    pub limit: Option<f64>,
}

/// Human-facing current-usage summary. Deliberately omits plan-name,
/// billing-period, and price-summary fields — those belong to the
/// billing/subscription surface this core does not own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUsage {
    /// Per-feature usage lines.
    pub features: Vec<FeatureUsage>,
}

/// Lightweight per-feature projection returned by `getActiveEntitlements`
/// — the full `Entitlement` minus its grant snapshots and version hash,
/// for callers that just need "what features is this customer entitled
/// to right now".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalEntitlement {
    /// Feature this entitlement governs.
    pub feature_slug: String,
    /// Feature type of the winning grant.
    pub feature_type: FeatureType,
    /// Effective merged limit, or `None` for unlimited.
    pub limit: Option<f64>,
    /// Merged effective start.
    pub effective_at: DateTime<Utc>,
    /// Merged effective end, or `None` for open-ended.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Orchestrates the Grant Resolver, Usage Meter, Storage, Cache, and
/// Analytics client behind the five service entrypoints.
pub struct EntitlementService {
    grants: Arc<dyn GrantStore>,
    storage: Arc<dyn EntitlementStorage>,
    analytics: Arc<dyn AnalyticsClient>,
    cache: Arc<CacheLayer<EntitlementState>>,
    negative_cache: Arc<CacheLayer<crate::entitlement::cache::NegativeMarker>>,
    acl_cache: Arc<CacheLayer<AccessControlList>>,
    entitlements_cache: Arc<CacheLayer<Vec<MinimalEntitlement>>>,
    current_usage_cache: Arc<CacheLayer<CurrentUsage>>,
    config: Config,
}

impl EntitlementService {
    /// Wire up an orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grants: Arc<dyn GrantStore>,
        storage: Arc<dyn EntitlementStorage>,
        analytics: Arc<dyn AnalyticsClient>,
        cache: Arc<CacheLayer<EntitlementState>>,
        negative_cache: Arc<CacheLayer<crate::entitlement::cache::NegativeMarker>>,
        acl_cache: Arc<CacheLayer<AccessControlList>>,
        entitlements_cache: Arc<CacheLayer<Vec<MinimalEntitlement>>>,
        current_usage_cache: Arc<CacheLayer<CurrentUsage>>,
        config: Config,
    ) -> Self {
        Self { grants, storage, analytics, cache, negative_cache, acl_cache, entitlements_cache, current_usage_cache, config }
    }

    fn customer_key(ctx: &RequestContext) -> String {
        format!("{}:{}", ctx.project_id, ctx.customer_id)
    }

    fn cache_key(ctx: &RequestContext, feature_slug: &str) -> String {
        format!("{}:{}:{}", ctx.project_id, ctx.customer_id, feature_slug)
    }

    /// Produce a fresh `MeterState` by replaying settled analytics from
    /// the entitlement's current cycle start (or `effective_at`) up to
    /// `watermark`.
    pub async fn initialize_usage_meter(
        &self,
        ctx: &RequestContext,
        entitlement: &crate::entitlement::model::Entitlement,
        watermark: DateTime<Utc>,
    ) -> Result<MeterState, CoreError> {
        let cycle = cycle_window(entitlement.effective_at, entitlement.expires_at, watermark, entitlement.reset_config.as_ref(), None);
        let cycle_start = cycle.map(|c| c.start);
        let after_anchor = cycle_start.unwrap_or(entitlement.effective_at);
        let after_record_id = ulid::ulid(after_anchor);
        let before_record_id = ulid::ulid(watermark);

        let events = self
            .analytics
            .get_features_usage_cursor(&ctx.customer_id, &ctx.project_id, &entitlement.feature_slug, &after_record_id, watermark)
            .await
            .map_err(|e| CoreError::FetchFailed(e.to_string()))?;

        let behavior = entitlement.aggregation_method.config().behavior;
        let usage = match behavior {
            crate::entitlement::aggregation::AggregationBehavior::None => 0.0,
            crate::entitlement::aggregation::AggregationBehavior::Sum => events.iter().map(|e| e.usage).sum(),
            crate::entitlement::aggregation::AggregationBehavior::Max => {
                events.iter().map(|e| e.usage).fold(0.0, f64::max)
            }
            crate::entitlement::aggregation::AggregationBehavior::Last => {
                events.last().map(|e| e.usage).unwrap_or(0.0)
            }
        };
        let analytics_last_id = events.iter().map(|e| e.id.clone()).max();
        let last_reconciled_id = ulid::non_empty(analytics_last_id.as_deref().unwrap_or("")).map(str::to_string).unwrap_or(before_record_id);

        Ok(MeterState { usage, snapshot_usage: usage, last_reconciled_id, last_updated: watermark, last_cycle_start: cycle_start })
    }

    /// Resolve the live `(entitlement, meter)` for `feature_slug`,
    /// applying the `EntitlementState` state machine: lazily compute on
    /// miss, negative-cache on no-grants, recompute on expiry, and
    /// revalidate-or-reconcile on staleness.
    pub async fn get_state_with_revalidation(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
    ) -> Result<Option<EntitlementState>, CoreError> {
        let cache_key = Self::cache_key(ctx, feature_slug);
        let storage_key = self.storage.make_key(&ctx.project_id, &ctx.customer_id, feature_slug);

        let cached = self.cache.get(CacheNamespace::CustomerEntitlement, &cache_key).await;
        let existing = match cached {
            Some(s) => Some(s),
            None => self.storage.get(&storage_key).await?,
        };

        let Some(mut state) = existing else {
            return self.compute_initial_state(ctx, feature_slug, &cache_key).await;
        };

        // Expiring: now >= expiresAt -> recompute grants from scratch.
        if state.entitlement.expires_at.is_some_and(|e| ctx.now >= e) {
            return self.compute_initial_state(ctx, feature_slug, &cache_key).await;
        }

        // Cycle reset: a period-scoped meter that has rolled into a new
        // cycle window is re-initialized from analytics rather than
        // carrying the previous cycle's total forward.
        if state.entitlement.aggregation_method.config().resets {
            let current_cycle = cycle_window(
                state.entitlement.effective_at,
                state.entitlement.expires_at,
                ctx.now,
                state.entitlement.reset_config.as_ref(),
                None,
            );
            if let Some(cycle) = current_cycle {
                let meter_cycle_start = state.meter.as_ref().and_then(|m| m.last_cycle_start);
                if meter_cycle_start != Some(cycle.start) {
                    let meter = self.initialize_usage_meter(ctx, &state.entitlement, ctx.now).await?;
                    state.meter = Some(meter);
                    self.storage.set(state.clone()).await?;
                    self.cache.set(CacheNamespace::CustomerEntitlement, &cache_key, state.clone()).await.ok();
                }
            }
        }

        // Stale: revalidation due, or meter never initialized.
        if ctx.now >= state.entitlement.next_revalidate_at || state.meter.is_none() {
            let grants = self
                .grants
                .list_active_for_subjects(&ctx.project_id, &[(SubjectKind::Customer, ctx.customer_id.clone())], ctx.now)
                .await?
                .into_iter()
                .filter(|g| g.feature.feature_slug == feature_slug)
                .collect::<Vec<_>>();
            if grants.is_empty() {
                self.storage.delete(&storage_key).await?;
                self.cache.remove(CacheNamespace::CustomerEntitlement, &cache_key).await.ok();
                return Ok(None);
            }
            let recomputed = resolver::resolve(&grants, ctx.now, ctx.now + chrono::Duration::minutes(5))?;
            if recomputed.version != state.entitlement.version {
                let meter = self.initialize_usage_meter(ctx, &recomputed, ctx.now - chrono::Duration::from_std(self.config.reconcile_watermark).unwrap_or(chrono::Duration::minutes(5))).await?;
                state = EntitlementState { entitlement: recomputed, meter: Some(meter) };
            } else {
                state.entitlement.next_revalidate_at = ctx.now + chrono::Duration::minutes(5);
            }
            self.storage.set(state.clone()).await?;
            self.cache.set(CacheNamespace::CustomerEntitlement, &cache_key, state.clone()).await.ok();
            self.spawn_background_reconcile(ctx, feature_slug);
        }

        Ok(Some(state))
    }

    async fn compute_initial_state(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
        cache_key: &str,
    ) -> Result<Option<EntitlementState>, CoreError> {
        if self.negative_cache.get(CacheNamespace::NegativeEntitlements, cache_key).await.is_some() {
            return Ok(None);
        }
        let grants = self
            .grants
            .list_active_for_subjects(&ctx.project_id, &[(SubjectKind::Customer, ctx.customer_id.clone())], ctx.now)
            .await?
            .into_iter()
            .filter(|g| g.feature.feature_slug == feature_slug)
            .collect::<Vec<_>>();
        if grants.is_empty() {
            self.negative_cache
                .set(CacheNamespace::NegativeEntitlements, cache_key, crate::entitlement::cache::NegativeMarker::now())
                .await
                .ok();
            return Ok(None);
        }
        let entitlement = resolver::resolve(&grants, ctx.now, ctx.now + chrono::Duration::minutes(5))?;
        let meter = self.initialize_usage_meter(ctx, &entitlement, ctx.now).await?;
        let state = EntitlementState { entitlement, meter: Some(meter) };
        let storage_key = self.storage.make_key(&ctx.project_id, &ctx.customer_id, feature_slug);
        self.storage.set(state.clone()).await?;
        self.cache.set(CacheNamespace::CustomerEntitlement, cache_key, state.clone()).await.ok();
        let _ = storage_key;
        Ok(Some(state))
    }

    fn spawn_background_reconcile(&self, ctx: &RequestContext, feature_slug: &str) {
        let storage = self.storage.clone();
        let analytics = self.analytics.clone();
        let config = self.config.clone();
        let reconcile_ctx = ReconcileContext {
            customer_id: ctx.customer_id.clone(),
            project_id: ctx.project_id.clone(),
            feature_slug: feature_slug.to_string(),
        };
        let now = ctx.now;
        tokio::spawn(async move {
            match reconciler::reconcile(&reconcile_ctx, &storage, &analytics, &config, now).await {
                Ok(outcome) => info!(?outcome, "background reconcile completed"),
                Err(e) => warn!(error = %e, "background reconcile failed"),
            }
        });
    }

    /// Check whether a proposed (or default 1-unit) consumption would be
    /// allowed, and record a verification event either way.
    pub async fn verify(&self, ctx: &RequestContext, req: VerifyRequest) -> Result<VerifyResult, CoreError> {
        let state = self.get_state_with_revalidation(ctx, &req.feature_slug).await?;

        let Some(mut state) = state else {
            self.record_verification(ctx, &req.feature_slug, false, Some(DeniedReason::EntitlementNotFound), None, None).await;
            return Ok(VerifyResult {
                allowed: false,
                message: "no entitlement found".into(),
                denied_reason: Some(DeniedReason::EntitlementNotFound),
                usage: 0.0,
                limit: None,
                remaining: None,
                latency: ctx.latency_ms(),
                feature_type: None,
            });
        };

        // Grants may expire between when `state` was computed/revalidated
        // and now — re-merge the currently-live grants on every call
        // rather than trusting the cached union of bounds, which can
        // still look valid under `sum` while one contributing grant has
        // already lapsed.
        let live_grants = self
            .grants
            .list_active_for_subjects(&ctx.project_id, &[(SubjectKind::Customer, ctx.customer_id.clone())], ctx.now)
            .await?
            .into_iter()
            .filter(|g| g.feature.feature_slug == req.feature_slug)
            .collect::<Vec<_>>();

        if live_grants.is_empty() {
            self.record_verification(ctx, &req.feature_slug, false, Some(DeniedReason::EntitlementNotFound), None, None).await;
            let storage_key = self.storage.make_key(&ctx.project_id, &ctx.customer_id, &req.feature_slug);
            let cache_key = Self::cache_key(ctx, &req.feature_slug);
            self.storage.delete(&storage_key).await?;
            self.cache.remove(CacheNamespace::CustomerEntitlement, &cache_key).await.ok();
            return Ok(VerifyResult {
                allowed: false,
                message: "no grant currently active".into(),
                denied_reason: Some(DeniedReason::EntitlementNotFound),
                usage: 0.0,
                limit: None,
                remaining: None,
                latency: ctx.latency_ms(),
                feature_type: None,
            });
        }

        let remerged = resolver::resolve(&live_grants, ctx.now, state.entitlement.next_revalidate_at)?;
        if remerged.version != state.entitlement.version {
            state.entitlement = remerged;
            let cache_key = Self::cache_key(ctx, &req.feature_slug);
            self.storage.set(state.clone()).await?;
            self.cache.set(CacheNamespace::CustomerEntitlement, &cache_key, state.clone()).await.ok();
        }

        if ctx.now < state.entitlement.effective_at {
            self.record_verification(ctx, &req.feature_slug, false, Some(DeniedReason::NotActive), None, None).await;
            return Ok(VerifyResult {
                allowed: false,
                message: "entitlement not yet active".into(),
                denied_reason: Some(DeniedReason::NotActive),
                usage: 0.0,
                limit: state.entitlement.limit,
                remaining: None,
                latency: ctx.latency_ms(),
                feature_type: Some(state.entitlement.feature_type),
            });
        }
        if state.entitlement.expires_at.is_some_and(|e| ctx.now >= e) {
            self.record_verification(ctx, &req.feature_slug, false, Some(DeniedReason::Expired), None, None).await;
            return Ok(VerifyResult {
                allowed: false,
                message: "entitlement expired".into(),
                denied_reason: Some(DeniedReason::Expired),
                usage: 0.0,
                limit: state.entitlement.limit,
                remaining: None,
                latency: ctx.latency_ms(),
                feature_type: Some(state.entitlement.feature_type),
            });
        }

        let meter_state = state.meter.clone().unwrap_or_else(|| MeterState::fresh(ctx.now, None));
        let meter = UsageMeter::new(state.entitlement.clone(), meter_state);
        let outcome = meter.verify(ctx.now, req.usage);

        self.record_verification(ctx, &req.feature_slug, outcome.allowed, outcome.denied_reason, Some(meter.usage()), Some(outcome.remaining))
            .await;

        if !outcome.allowed && outcome.denied_reason == Some(DeniedReason::LimitExceeded) {
            self.flip_acl_limit_reached(ctx, true).await;
        }

        Ok(VerifyResult {
            allowed: outcome.allowed,
            message: outcome.message,
            denied_reason: outcome.denied_reason,
            usage: meter.usage(),
            limit: state.entitlement.limit,
            remaining: Some(outcome.remaining),
            latency: ctx.latency_ms(),
            feature_type: Some(state.entitlement.feature_type),
        })
    }

    async fn record_verification(
        &self,
        ctx: &RequestContext,
        feature_slug: &str,
        allowed: bool,
        denied_reason: Option<DeniedReason>,
        usage: Option<f64>,
        remaining: Option<f64>,
    ) {
        let record = Verification::new(
            ctx.customer_id.clone(),
            ctx.project_id.clone(),
            feature_slug.to_string(),
            ctx.now,
            allowed,
            denied_reason,
            usage,
            remaining,
            ctx.latency_ms(),
            ctx.request_id.clone(),
        );
        if let Err(e) = self.storage.insert_verification(record).await {
            warn!(error = %e, "failed to append verification record");
        }
    }

    async fn flip_acl_limit_reached(&self, ctx: &RequestContext, reached: bool) {
        let key = Self::customer_key(ctx);
        let mut acl = self.acl_cache.get(CacheNamespace::AccessControlList, &key).await.unwrap_or_default();
        acl.usage_limit_reached = reached;
        self.acl_cache.set(CacheNamespace::AccessControlList, &key, acl).await.ok();
    }

    /// Report actual consumption against a feature's meter, idempotent on
    /// `req.idempotence_key`.
    pub async fn report_usage(&self, ctx: &RequestContext, req: ReportUsageRequest) -> Result<ReportUsageResult, CoreError> {
        if self.storage.has_idempotence_key(&ctx.customer_id, &req.feature_slug, &req.idempotence_key).await? {
            let state = self.get_state_with_revalidation(ctx, &req.feature_slug).await?;
            let usage = state.as_ref().and_then(|s| s.meter.as_ref()).map_or(0.0, |m| m.usage);
            let limit = state.as_ref().and_then(|s| s.entitlement.limit);
            let pricing_config = state
                .as_ref()
                .and_then(|s| s.entitlement.grants.first())
                .map(|g| g.config.clone())
                .unwrap_or_default();
            let cost = PriceCalculator::waterfall(usage, &pricing_config);
            return Ok(ReportUsageResult {
                allowed: true,
                remaining: limit.map(|l| l - usage),
                message: Some("already recorded".into()),
                denied_reason: None,
                usage,
                limit,
                cost: Some(cost),
                notified_over_limit: None,
                already_recorded: true,
            });
        }

        let Some(state) = self.get_state_with_revalidation(ctx, &req.feature_slug).await? else {
            return Ok(ReportUsageResult {
                allowed: false,
                remaining: None,
                message: Some("no entitlement found".into()),
                denied_reason: Some(DeniedReason::EntitlementNotFound),
                usage: 0.0,
                limit: None,
                cost: None,
                notified_over_limit: None,
                already_recorded: false,
            });
        };

        let pricing_config = state
            .entitlement
            .grants
            .first()
            .map(|g| g.config.clone())
            .unwrap_or_default();
        let meter_state = state.meter.clone().unwrap_or_else(|| MeterState::fresh(ctx.now, None));
        let mut meter = UsageMeter::new(state.entitlement.clone(), meter_state);
        let cost_before = PriceCalculator::waterfall(meter.usage(), &pricing_config);
        let outcome = meter.consume(req.usage, ctx.now);

        if !outcome.allowed {
            return Ok(ReportUsageResult {
                allowed: false,
                remaining: Some(outcome.remaining),
                message: Some(outcome.message),
                denied_reason: outcome.denied_reason,
                usage: meter.usage(),
                limit: state.entitlement.limit,
                cost: None,
                notified_over_limit: None,
                already_recorded: false,
            });
        }

        let cost_after = PriceCalculator::waterfall(meter.usage(), &pricing_config);
        let new_state = EntitlementState { entitlement: state.entitlement.clone(), meter: Some(meter.to_persist()) };
        self.storage.set(new_state.clone()).await?;
        let cache_key = Self::cache_key(ctx, &req.feature_slug);
        self.cache.set(CacheNamespace::CustomerEntitlement, &cache_key, new_state).await.ok();

        let record = crate::entitlement::model::UsageRecord {
            id: ulid::ulid(ctx.now),
            customer_id: ctx.customer_id.clone(),
            project_id: ctx.project_id.clone(),
            feature_slug: req.feature_slug.clone(),
            usage: req.usage,
            timestamp: ctx.now,
            idempotence_key: Some(req.idempotence_key.clone()),
            request_id: ctx.request_id.clone(),
            created_at: ctx.now,
            metadata: crate::entitlement::model::UsageRecordMetadata {
                cost: Some(cost_after - cost_before),
                rate: None,
                rate_amount: None,
                rate_currency: None,
            },
            deleted: 0,
        };
        self.storage.insert_usage_record(record).await?;

        if req.usage < 0.0 && outcome.remaining > 0.0 {
            self.flip_acl_limit_reached(ctx, false).await;
        }

        Ok(ReportUsageResult {
            allowed: true,
            remaining: Some(outcome.remaining),
            message: None,
            denied_reason: None,
            usage: meter.usage(),
            limit: state.entitlement.limit,
            cost: Some(cost_after - cost_before),
            notified_over_limit: Some(outcome.over_threshold),
            already_recorded: false,
        })
    }

    /// Assemble a human-facing usage summary across `feature_slugs`, cached
    /// under the `getCurrentUsage` namespace keyed on `proj:cust` (not on
    /// the requested feature subset — callers are expected to query a
    /// consistent feature set per customer, matching the namespace table).
    pub async fn get_current_usage(&self, ctx: &RequestContext, feature_slugs: &[String]) -> Result<CurrentUsage, CoreError> {
        let key = Self::customer_key(ctx);
        if let Some(cached) = self.current_usage_cache.get(CacheNamespace::GetCurrentUsage, &key).await {
            return Ok(cached);
        }
        let mut features = Vec::with_capacity(feature_slugs.len());
        for feature_slug in feature_slugs {
            if let Some(state) = self.get_state_with_revalidation(ctx, feature_slug).await? {
                let usage = state.meter.as_ref().map_or(0.0, |m| m.usage);
                features.push(FeatureUsage { feature_slug: feature_slug.clone(), usage, limit: state.entitlement.limit });
            }
        }
        let result = CurrentUsage { features };
        self.current_usage_cache.set(CacheNamespace::GetCurrentUsage, &key, result.clone()).await.ok();
        Ok(result)
    }

    /// Flush pending usage/verification batches to durable storage. Called
    /// from the meter actor's alarm loop.
    pub async fn flush_storage(&self) -> Result<(), CoreError> {
        self.storage.flush().await?;
        Ok(())
    }

    /// Read the customer's access-control summary.
    pub async fn get_access_control_list(&self, ctx: &RequestContext) -> Result<AccessControlList, CoreError> {
        let key = Self::customer_key(ctx);
        Ok(self.acl_cache.get(CacheNamespace::AccessControlList, &key).await.unwrap_or_default())
    }

    /// Assemble the `MinimalEntitlement` projection for every feature the
    /// customer currently has an active grant for, cached under the
    /// `customerEntitlements` namespace keyed on `proj:cust`. A cache hit
    /// of an empty list is still treated as a hit (matching the cached
    /// miss/empty decision made for the access-control-list recompute
    /// trigger) — only a true cache miss recomputes from the grant store.
    pub async fn get_active_entitlements(&self, ctx: &RequestContext) -> Result<Vec<MinimalEntitlement>, CoreError> {
        let key = Self::customer_key(ctx);
        if let Some(cached) = self.entitlements_cache.get(CacheNamespace::CustomerEntitlements, &key).await {
            return Ok(cached);
        }

        let grants = self
            .grants
            .list_active_for_subjects(&ctx.project_id, &[(SubjectKind::Customer, ctx.customer_id.clone())], ctx.now)
            .await?;

        let mut by_feature: HashMap<String, Vec<crate::entitlement::grants::Grant>> = HashMap::new();
        for grant in grants {
            by_feature.entry(grant.feature.feature_slug.clone()).or_default().push(grant);
        }

        let mut result = Vec::with_capacity(by_feature.len());
        for feature_grants in by_feature.into_values() {
            let entitlement = resolver::resolve(&feature_grants, ctx.now, ctx.now + chrono::Duration::minutes(5))?;
            result.push(MinimalEntitlement {
                feature_slug: entitlement.feature_slug,
                feature_type: entitlement.feature_type,
                limit: entitlement.limit,
                effective_at: entitlement.effective_at,
                expires_at: entitlement.expires_at,
            });
        }
        result.sort_by(|a, b| a.feature_slug.cmp(&b.feature_slug));

        self.entitlements_cache.set(CacheNamespace::CustomerEntitlements, &key, result.clone()).await.ok();
        Ok(result)
    }

    /// Invalidate all cached/durable state for `feature_slugs`, forcing
    /// the next `get_state_with_revalidation` to recompute from grants.
    /// Touches all five cache namespaces, matching the orchestrator's
    /// lifecycle-event invalidation contract.
    pub async fn reset_entitlements(&self, ctx: &RequestContext, feature_slugs: &[String]) -> Result<(), CoreError> {
        for feature_slug in feature_slugs {
            let storage_key = self.storage.make_key(&ctx.project_id, &ctx.customer_id, feature_slug);
            let cache_key = Self::cache_key(ctx, feature_slug);
            self.storage.delete(&storage_key).await?;
            self.cache.remove(CacheNamespace::CustomerEntitlement, &cache_key).await.ok();
            self.negative_cache.remove(CacheNamespace::NegativeEntitlements, &cache_key).await.ok();
        }
        let customer_key = Self::customer_key(ctx);
        self.acl_cache.remove(CacheNamespace::AccessControlList, &customer_key).await.ok();
        self.entitlements_cache.remove(CacheNamespace::CustomerEntitlements, &customer_key).await.ok();
        self.current_usage_cache.remove(CacheNamespace::GetCurrentUsage, &customer_key).await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::aggregation::AggregationMethod;
    use crate::entitlement::analytics::FakeAnalyticsClient;
    use crate::entitlement::cycle::{IntervalUnit, PlanType};
    use crate::entitlement::grants::store::MemoryGrantStore;
    use crate::entitlement::grants::{
        BillingConfig, FeatureMetadata, FeaturePlanVersion, FeatureType, Grant, GrantType, PricingConfig,
        SubjectKind, UsageMode,
    };
    use crate::entitlement::storage::MemoryEntitlementStorage;
    use std::time::Duration as StdDuration;

    fn build_service() -> EntitlementService {
        let grants: Arc<dyn GrantStore> = Arc::new(MemoryGrantStore::new());
        let storage: Arc<dyn EntitlementStorage> = Arc::new(MemoryEntitlementStorage::default());
        let analytics: Arc<dyn AnalyticsClient> = Arc::new(FakeAnalyticsClient::new());
        let cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let negative_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let acl_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let entitlements_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        let current_usage_cache = Arc::new(CacheLayer::new(1000, StdDuration::from_secs(60), None, StdDuration::from_secs(60)));
        EntitlementService::new(
            grants,
            storage,
            analytics,
            cache,
            negative_cache,
            acl_cache,
            entitlements_cache,
            current_usage_cache,
            Config::default(),
        )
    }

    async fn seed_grant(service: &EntitlementService, limit: Option<f64>, overage: crate::entitlement::grants::OverageStrategy) {
        let now = Utc::now();
        let grant = Grant {
            id: "g1".into(),
            subject_kind: SubjectKind::Customer,
            subject_id: "cust_1".into(),
            project_id: "proj_1".into(),
            feature_plan_version_id: "fpv_1".into(),
            feature: FeaturePlanVersion {
                feature_slug: "api_calls".into(),
                feature_type: FeatureType::Usage,
                aggregation_method: AggregationMethod::Sum,
                usage_mode: UsageMode::Unit,
                billing_config: BillingConfig {
                    name: "monthly".into(),
                    billing_interval: IntervalUnit::Month,
                    billing_interval_count: 1,
                    plan_type: PlanType::Recurring,
                    billing_anchor: now,
                },
                reset_config: None,
                metadata: FeatureMetadata { overage_strategy: overage, ..Default::default() },
                config: PricingConfig::default(),
            },
            grant_type: GrantType::Subscription,
            limit,
            anchor: now,
            effective_at: now - chrono::Duration::days(1),
            expires_at: None,
            auto_renew: false,
            deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        service.grants.insert(grant).await.unwrap();
    }

    #[tokio::test]
    async fn verify_without_grants_denies_not_found() {
        let service = build_service();
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);
        let result = service
            .verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: None, metadata: HashMap::new() })
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.denied_reason, Some(DeniedReason::EntitlementNotFound));
    }

    #[tokio::test]
    async fn report_then_verify_observes_read_your_writes() {
        let service = build_service();
        seed_grant(&service, Some(100.0), crate::entitlement::grants::OverageStrategy::None).await;
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);

        let report = service
            .report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 10.0, idempotence_key: "k1".into() })
            .await
            .unwrap();
        assert!(report.allowed);
        assert_eq!(report.usage, 10.0);

        let verify = service
            .verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: HashMap::new() })
            .await
            .unwrap();
        assert!(verify.allowed);
        assert_eq!(verify.usage, 10.0);
    }

    #[tokio::test]
    async fn repeated_idempotence_key_does_not_double_count() {
        let service = build_service();
        seed_grant(&service, Some(100.0), crate::entitlement::grants::OverageStrategy::None).await;
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);

        let first = service
            .report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "k1".into() })
            .await
            .unwrap();
        assert!(!first.already_recorded);

        let second = service
            .report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "k1".into() })
            .await
            .unwrap();
        assert!(second.already_recorded);
        assert_eq!(second.usage, 5.0);
    }

    #[tokio::test]
    async fn limit_exceeded_flips_acl() {
        let service = build_service();
        seed_grant(&service, Some(10.0), crate::entitlement::grants::OverageStrategy::None).await;
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);

        service
            .report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 10.0, idempotence_key: "k1".into() })
            .await
            .unwrap();
        let verify = service
            .verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(1.0), metadata: HashMap::new() })
            .await
            .unwrap();
        assert!(!verify.allowed);

        let acl = service.get_access_control_list(&ctx).await.unwrap();
        assert!(acl.usage_limit_reached);
    }

    #[tokio::test]
    async fn reset_entitlements_clears_state() {
        let service = build_service();
        seed_grant(&service, Some(100.0), crate::entitlement::grants::OverageStrategy::None).await;
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);
        service
            .report_usage(&ctx, ReportUsageRequest { feature_slug: "api_calls".into(), usage: 5.0, idempotence_key: "k1".into() })
            .await
            .unwrap();
        service.reset_entitlements(&ctx, &["api_calls".to_string()]).await.unwrap();

        let state = service.get_state_with_revalidation(&ctx, "api_calls").await.unwrap();
        // Grants are still active, so state recomputes fresh at usage=0
        // rather than staying missing — reset clears the *meter history*,
        // not the underlying grants.
        assert_eq!(state.unwrap().meter.unwrap().usage, 0.0);
    }

    #[tokio::test]
    async fn reset_entitlements_clears_active_entitlements_and_current_usage_caches() {
        let service = build_service();
        seed_grant(&service, Some(100.0), crate::entitlement::grants::OverageStrategy::None).await;
        let ctx = RequestContext::new("cust_1", "proj_1", Utc::now(), None);

        let before = service.get_active_entitlements(&ctx).await.unwrap();
        assert_eq!(before.len(), 1);
        service.get_current_usage(&ctx, &["api_calls".to_string()]).await.unwrap();

        let key = EntitlementService::customer_key(&ctx);
        assert!(service.entitlements_cache.get(CacheNamespace::CustomerEntitlements, &key).await.is_some());
        assert!(service.current_usage_cache.get(CacheNamespace::GetCurrentUsage, &key).await.is_some());

        service.reset_entitlements(&ctx, &["api_calls".to_string()]).await.unwrap();

        assert!(service.entitlements_cache.get(CacheNamespace::CustomerEntitlements, &key).await.is_none());
        assert!(service.current_usage_cache.get(CacheNamespace::GetCurrentUsage, &key).await.is_none());
    }

    #[tokio::test]
    async fn get_active_entitlements_groups_by_feature_and_sorts() {
        let service = build_service();
        let now = Utc::now();

        async fn seed(service: &EntitlementService, feature_slug: &str, id: &str, now: DateTime<Utc>) {
            let grant = Grant {
                id: id.into(),
                subject_kind: SubjectKind::Customer,
                subject_id: "cust_1".into(),
                project_id: "proj_1".into(),
                feature_plan_version_id: format!("fpv_{id}"),
                feature: FeaturePlanVersion {
                    feature_slug: feature_slug.into(),
                    feature_type: FeatureType::Usage,
                    aggregation_method: AggregationMethod::Sum,
                    usage_mode: UsageMode::Unit,
                    billing_config: BillingConfig {
                        name: "monthly".into(),
                        billing_interval: IntervalUnit::Month,
                        billing_interval_count: 1,
                        plan_type: PlanType::Recurring,
                        billing_anchor: now,
                    },
                    reset_config: None,
                    metadata: FeatureMetadata::default(),
                    config: PricingConfig::default(),
                },
                grant_type: GrantType::Subscription,
                limit: Some(50.0),
                anchor: now,
                effective_at: now - chrono::Duration::days(1),
                expires_at: None,
                auto_renew: false,
                deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            };
            service.grants.insert(grant).await.unwrap();
        }

        seed(&service, "seats", "g1", now).await;
        seed(&service, "api_calls", "g2", now).await;

        let ctx = RequestContext::new("cust_1", "proj_1", now, None);
        let active = service.get_active_entitlements(&ctx).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].feature_slug, "api_calls");
        assert_eq!(active[1].feature_slug, "seats");
    }

    #[tokio::test]
    async fn verify_remerges_staggered_grants_dropping_an_expired_contributor() {
        let service = build_service();
        let now = Utc::now();

        async fn seed_with_expiry(service: &EntitlementService, id: &str, limit: f64, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
            let grant = Grant {
                id: id.into(),
                subject_kind: SubjectKind::Customer,
                subject_id: "cust_1".into(),
                project_id: "proj_1".into(),
                feature_plan_version_id: format!("fpv_{id}"),
                feature: FeaturePlanVersion {
                    feature_slug: "api_calls".into(),
                    feature_type: FeatureType::Usage,
                    aggregation_method: AggregationMethod::Sum,
                    usage_mode: UsageMode::Unit,
                    billing_config: BillingConfig {
                        name: "monthly".into(),
                        billing_interval: IntervalUnit::Month,
                        billing_interval_count: 1,
                        plan_type: PlanType::Recurring,
                        billing_anchor: now,
                    },
                    reset_config: None,
                    metadata: FeatureMetadata::default(),
                    config: PricingConfig::default(),
                },
                grant_type: GrantType::Subscription,
                limit: Some(limit),
                anchor: now,
                effective_at: now - chrono::Duration::days(2),
                expires_at,
                auto_renew: false,
                deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            };
            service.grants.insert(grant).await.unwrap();
        }

        // Grant A expires soon (T1); grant B outlives it (T2 > T1). Under
        // `sum`, the merged entitlement's own `expires_at` is the later of
        // the two (T2), so the "whole entitlement expired" fast path in
        // `get_state_with_revalidation` never fires between T1 and T2 —
        // only a genuine re-merge against currently-live grants catches A
        // dropping out.
        let t1 = now + chrono::Duration::seconds(1);
        let t2 = now + chrono::Duration::hours(1);
        seed_with_expiry(&service, "a", 50.0, Some(t1), now).await;
        seed_with_expiry(&service, "b", 80.0, Some(t2), now).await;
        let ctx = RequestContext::new("cust_1", "proj_1", now, None);

        let first = service
            .verify(&ctx, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: HashMap::new() })
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.limit, Some(130.0), "both grants contribute while both are live");

        // Advance past T1 but stay well inside the 5-minute revalidation
        // throttle and before T2 — the cached merged entitlement's own
        // bounds still look valid (now < T2), so only the per-call
        // re-merge can notice grant A has lapsed.
        let between = t1 + chrono::Duration::seconds(1);
        let ctx_between = RequestContext::new("cust_1", "proj_1", between, None);
        let second = service
            .verify(&ctx_between, VerifyRequest { feature_slug: "api_calls".into(), usage: Some(0.0), metadata: HashMap::new() })
            .await
            .unwrap();
        assert!(second.allowed);
        assert_eq!(second.limit, Some(80.0), "grant a has expired, only grant b's limit should remain");
    }
}
