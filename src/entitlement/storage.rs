//! Entitlement Storage (component F): the durable per-(customer,feature)
//! record — config + meter + idempotency set + append log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::PgPool;
use thiserror::Error;

use crate::entitlement::model::{make_key, EntitlementState, UsageRecord, Verification};

/// Storage-layer failure.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The durable backend (Postgres) returned an error.
    #[error("database error: {0}")]
    Database(String),
    /// (De)serialization of a persisted value failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable per-actor persistent surface.
#[async_trait::async_trait]
pub trait EntitlementStorage: Send + Sync {
    /// Fetch the persisted state for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<EntitlementState>, StorageError>;
    /// Persist `state`, keyed by `state.key()`.
    async fn set(&self, state: EntitlementState) -> Result<(), StorageError>;
    /// Remove any persisted state for `key`.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Clear all persisted state owned by this storage instance.
    async fn reset(&self) -> Result<(), StorageError>;
    /// Canonical `proj:cust:feat` key.
    fn make_key(&self, project_id: &str, customer_id: &str, feature_slug: &str) -> String {
        make_key(project_id, customer_id, feature_slug)
    }
    /// Check-and-insert an idempotency key, scoped to
    /// `(customer_id, feature_slug, key)` — two customers who happen to
    /// choose the same client-generated key for the same feature must
    /// not collide. Returns `true` if the key had already been observed
    /// (the caller should short-circuit); `false` the first time, with
    /// the key now recorded.
    async fn has_idempotence_key(&self, customer_id: &str, feature_slug: &str, key: &str) -> Result<bool, StorageError>;
    /// Append a usage record to the write-behind buffer.
    async fn insert_usage_record(&self, record: UsageRecord) -> Result<(), StorageError>;
    /// Append a verification record to the write-behind buffer.
    async fn insert_verification(&self, record: Verification) -> Result<(), StorageError>;
    /// Flush buffered usage/verification records to the analytics sink.
    async fn flush(&self) -> Result<(), StorageError>;
}

/// One batch of records pending a flush; replayed on actor restart so a
/// crash between "committed to the append log" and "flushed upstream"
/// never silently drops data.
#[derive(Default, Clone)]
struct PendingBatches {
    usage_records: Vec<UsageRecord>,
    verifications: Vec<Verification>,
}

/// In-process storage with an idempotency TTL cache and a replay-safe
/// pending-batch buffer, built on the `JobQueue` dead-letter redelivery
/// pattern (`scheduling::queue`) and the moka L1 cache
/// (`database::cache::MultiTierCache`) used elsewhere. The state map is
/// a lock-free `DashMap`, matching `QuotaManager::usage`
/// (`enterprise::ratelimit::quota`).
pub struct MemoryEntitlementStorage {
    states: Arc<DashMap<String, EntitlementState>>,
    idempotency: Arc<moka::future::Cache<String, ()>>,
    pending: Arc<RwLock<PendingBatches>>,
    flushed_usage: Arc<RwLock<Vec<UsageRecord>>>,
    flushed_verifications: Arc<RwLock<Vec<Verification>>>,
}

impl MemoryEntitlementStorage {
    /// Build a store whose idempotency set expires after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        let idempotency = moka::future::Cache::builder().time_to_live(ttl).build();
        Self {
            states: Arc::new(DashMap::new()),
            idempotency: Arc::new(idempotency),
            pending: Arc::new(RwLock::new(PendingBatches::default())),
            flushed_usage: Arc::new(RwLock::new(Vec::new())),
            flushed_verifications: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Records that have been flushed upstream — the in-memory analogue
    /// of "delivered to the analytics ingest endpoint", used by tests.
    pub fn flushed_usage_records(&self) -> Vec<UsageRecord> {
        self.flushed_usage.read().clone()
    }

    /// Number of records currently buffered, awaiting a flush.
    pub fn pending_len(&self) -> usize {
        let p = self.pending.read();
        p.usage_records.len() + p.verifications.len()
    }
}

impl Default for MemoryEntitlementStorage {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait::async_trait]
impl EntitlementStorage for MemoryEntitlementStorage {
    async fn get(&self, key: &str) -> Result<Option<EntitlementState>, StorageError> {
        Ok(self.states.get(key).map(|r| r.clone()))
    }

    async fn set(&self, state: EntitlementState) -> Result<(), StorageError> {
        self.states.insert(state.key(), state);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.states.remove(key);
        Ok(())
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.states.clear();
        self.pending.write().usage_records.clear();
        self.pending.write().verifications.clear();
        Ok(())
    }

    async fn has_idempotence_key(&self, customer_id: &str, feature_slug: &str, key: &str) -> Result<bool, StorageError> {
        let full_key = format!("{customer_id}:{feature_slug}:{key}");
        if self.idempotency.get(&full_key).await.is_some() {
            return Ok(true);
        }
        self.idempotency.insert(full_key, ()).await;
        Ok(false)
    }

    async fn insert_usage_record(&self, record: UsageRecord) -> Result<(), StorageError> {
        self.pending.write().usage_records.push(record);
        Ok(())
    }

    async fn insert_verification(&self, record: Verification) -> Result<(), StorageError> {
        self.pending.write().verifications.push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let batch = {
            let mut pending = self.pending.write();
            std::mem::take(&mut *pending)
        };
        self.flushed_usage.write().extend(batch.usage_records);
        self.flushed_verifications.write().extend(batch.verifications);
        Ok(())
    }
}

/// Postgres-backed storage, built on the `SubscriptionManager`/
/// `sqlx::query_as` idiom used elsewhere. The idempotency set and
/// pending-batch buffer stay in-process (moka/Vec) in front of the
/// durable tables, matching "batch-write ... on flush()".
pub struct SqlxEntitlementStorage {
    pool: PgPool,
    idempotency: Arc<moka::future::Cache<String, ()>>,
    pending: Arc<RwLock<PendingBatches>>,
}

impl SqlxEntitlementStorage {
    /// Wrap an existing pool with an idempotency TTL of `ttl`.
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            idempotency: Arc::new(moka::future::Cache::builder().time_to_live(ttl).build()),
            pending: Arc::new(RwLock::new(PendingBatches::default())),
        }
    }
}

#[async_trait::async_trait]
impl EntitlementStorage for SqlxEntitlementStorage {
    async fn get(&self, key: &str) -> Result<Option<EntitlementState>, StorageError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state_json FROM entitlement_states WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
        match row {
            Some((json,)) => serde_json::from_value(json)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, state: EntitlementState) -> Result<(), StorageError> {
        let key = state.key();
        let json = serde_json::to_value(&state).map_err(|e| StorageError::Serialization(e.to_string()))?;
        sqlx::query(
            r"
            INSERT INTO entitlement_states (key, state_json, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET state_json = EXCLUDED.state_json, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&key)
        .bind(json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM entitlement_states WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), StorageError> {
        sqlx::query("TRUNCATE entitlement_states")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn has_idempotence_key(&self, customer_id: &str, feature_slug: &str, key: &str) -> Result<bool, StorageError> {
        let full_key = format!("{customer_id}:{feature_slug}:{key}");
        if self.idempotency.get(&full_key).await.is_some() {
            return Ok(true);
        }
        self.idempotency.insert(full_key, ()).await;
        Ok(false)
    }

    async fn insert_usage_record(&self, record: UsageRecord) -> Result<(), StorageError> {
        self.pending.write().usage_records.push(record);
        Ok(())
    }

    async fn insert_verification(&self, record: Verification) -> Result<(), StorageError> {
        self.pending.write().verifications.push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let batch = {
            let mut pending = self.pending.write();
            std::mem::take(&mut *pending)
        };
        if batch.usage_records.is_empty() && batch.verifications.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| StorageError::Database(e.to_string()))?;
        for record in &batch.usage_records {
            sqlx::query(
                r"
                INSERT INTO usage_records (id, customer_id, project_id, feature_slug, usage, timestamp, idempotence_key, request_id, created_at, metadata, deleted)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(&record.id)
            .bind(&record.customer_id)
            .bind(&record.project_id)
            .bind(&record.feature_slug)
            .bind(record.usage)
            .bind(record.timestamp)
            .bind(&record.idempotence_key)
            .bind(&record.request_id)
            .bind(record.created_at)
            .bind(serde_json::to_value(&record.metadata).map_err(|e| StorageError::Serialization(e.to_string()))?)
            .bind(record.deleted)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        for record in &batch.verifications {
            sqlx::query(
                r"
                INSERT INTO verifications (customer_id, project_id, feature_slug, timestamp, allowed, denied_reason, metadata, latency, request_id, created_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                ",
            )
            .bind(&record.customer_id)
            .bind(&record.project_id)
            .bind(&record.feature_slug)
            .bind(record.timestamp)
            .bind(record.allowed)
            .bind(&record.denied_reason)
            .bind(serde_json::to_value(&record.metadata).map_err(|e| StorageError::Serialization(e.to_string()))?)
            .bind(record.latency)
            .bind(&record.request_id)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}
