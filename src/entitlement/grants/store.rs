//! Grant Store implementations: an in-memory store for tests, built on
//! the `QuotaManager::usage` (`Arc<DashMap<_,_>>`) pattern used
//! elsewhere in this codebase, and a Postgres-backed store following
//! the `SubscriptionManager` / `sqlx::query_as` idiom.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;

use crate::entitlement::storage::StorageError;

use super::{Grant, GrantStore, SubjectKind};

/// In-process grant store backed by a lock-free `DashMap`. Used in tests
/// and for the `MemoryGrantStore`-backed scenario suite in `tests/`.
#[derive(Default)]
pub struct MemoryGrantStore {
    grants: Arc<DashMap<String, Grant>>,
}

impl MemoryGrantStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store directly, bypassing the uniqueness-key check —
    /// convenient for test fixtures that don't care about conflicts.
    pub fn seed(&self, grant: Grant) {
        self.grants.insert(grant.id.clone(), grant);
    }
}

fn uniqueness_key(g: &Grant) -> (String, String, String, String, i64, i64, String) {
    (
        g.project_id.clone(),
        g.subject_id.clone(),
        format!("{:?}", g.subject_kind),
        format!("{:?}", g.grant_type),
        g.effective_at.timestamp_millis(),
        g.expires_at.map_or(-1, |e| e.timestamp_millis()),
        g.feature_plan_version_id.clone(),
    )
}

#[async_trait::async_trait]
impl GrantStore for MemoryGrantStore {
    async fn list_active_for_subjects(
        &self,
        project_id: &str,
        subjects: &[(SubjectKind, String)],
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>, StorageError> {
        Ok(self
            .grants
            .iter()
            .filter(|g| {
                g.project_id == project_id
                    && g.is_live_at(now)
                    && subjects
                        .iter()
                        .any(|(kind, id)| *kind == g.subject_kind && *id == g.subject_id)
            })
            .map(|r| r.clone())
            .collect())
    }

    async fn insert(&self, grant: Grant) -> Result<(), StorageError> {
        let key = uniqueness_key(&grant);
        let conflict = self.grants.iter().any(|existing| uniqueness_key(&existing) == key);
        if conflict {
            return Ok(()); // insert-on-conflict-do-nothing
        }
        self.grants.insert(grant.id.clone(), grant);
        Ok(())
    }

    async fn soft_delete(
        &self,
        ids: &[String],
        project_id: &str,
        subject_kind: SubjectKind,
        subject_id: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        for id in ids {
            if let Some(mut g) = self.grants.get_mut(id) {
                if g.project_id == project_id && g.subject_kind == subject_kind && g.subject_id == subject_id {
                    g.deleted = true;
                    g.deleted_at = Some(now);
                    g.updated_at = now;
                }
            }
        }
        Ok(())
    }
}

/// Postgres-backed grant store.
pub struct SqlxGrantStore {
    pool: PgPool,
}

impl SqlxGrantStore {
    /// Wrap an existing pool. Pool construction/health-checking is the
    /// caller's responsibility, matching `ConnectionPool` elsewhere.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GrantStore for SqlxGrantStore {
    async fn list_active_for_subjects(
        &self,
        project_id: &str,
        subjects: &[(SubjectKind, String)],
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>, StorageError> {
        // Subject filtering happens in Rust after a project-scoped,
        // not-deleted, time-bounded fetch — the subject list is small
        // (customer + project + plan + plan-version, at most 4 rows)
        // and this keeps the query free of a dynamic IN-list.
        let rows: Vec<GrantRow> = sqlx::query_as(
            r"
            SELECT * FROM grants
            WHERE project_id = $1
              AND deleted = false
              AND effective_at <= $2
              AND (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(project_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|r| r.into_grant().ok())
            .filter(|g: &Grant| {
                subjects.iter().any(|(kind, id)| *kind == g.subject_kind && *id == g.subject_id)
            })
            .collect())
    }

    async fn insert(&self, grant: Grant) -> Result<(), StorageError> {
        let row = GrantRow::from_grant(&grant).map_err(StorageError::Database)?;
        sqlx::query(
            r"
            INSERT INTO grants (
                id, subject_kind, subject_id, project_id, feature_plan_version_id,
                feature_json, grant_type, limit_value, anchor, effective_at,
                expires_at, auto_renew, deleted, deleted_at, created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            ON CONFLICT (project_id, subject_id, subject_kind, grant_type, effective_at, expires_at, feature_plan_version_id)
            DO NOTHING
            ",
        )
        .bind(row.id)
        .bind(row.subject_kind)
        .bind(row.subject_id)
        .bind(row.project_id)
        .bind(row.feature_plan_version_id)
        .bind(row.feature_json)
        .bind(row.grant_type)
        .bind(row.limit_value)
        .bind(row.anchor)
        .bind(row.effective_at)
        .bind(row.expires_at)
        .bind(row.auto_renew)
        .bind(row.deleted)
        .bind(row.deleted_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn soft_delete(
        &self,
        ids: &[String],
        project_id: &str,
        subject_kind: SubjectKind,
        subject_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE grants SET deleted = true, deleted_at = now(), updated_at = now()
            WHERE id = ANY($1) AND project_id = $2 AND subject_kind = $3 AND subject_id = $4
            ",
        )
        .bind(ids)
        .bind(project_id)
        .bind(format!("{subject_kind:?}"))
        .bind(subject_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Flat row shape for the `grants` table; the rich nested `Grant` is
/// reconstructed from a JSON column for the embedded `FeaturePlanVersion`,
/// mirroring the `#[sqlx(json)] metadata: HashMap<...>` idiom used elsewhere.
#[derive(sqlx::FromRow)]
struct GrantRow {
    id: String,
    subject_kind: String,
    subject_id: String,
    project_id: String,
    feature_plan_version_id: String,
    feature_json: serde_json::Value,
    grant_type: String,
    limit_value: Option<f64>,
    anchor: DateTime<Utc>,
    effective_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    auto_renew: bool,
    deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GrantRow {
    fn from_grant(g: &Grant) -> Result<Self, String> {
        Ok(Self {
            id: g.id.clone(),
            subject_kind: format!("{:?}", g.subject_kind),
            subject_id: g.subject_id.clone(),
            project_id: g.project_id.clone(),
            feature_plan_version_id: g.feature_plan_version_id.clone(),
            feature_json: serde_json::to_value(&g.feature).map_err(|e| e.to_string())?,
            grant_type: format!("{:?}", g.grant_type),
            limit_value: g.limit,
            anchor: g.anchor,
            effective_at: g.effective_at,
            expires_at: g.expires_at,
            auto_renew: g.auto_renew,
            deleted: g.deleted,
            deleted_at: g.deleted_at,
            created_at: g.created_at,
            updated_at: g.updated_at,
        })
    }

    fn into_grant(self) -> Result<Grant, String> {
        let subject_kind = parse_subject_kind(&self.subject_kind)?;
        let grant_type = parse_grant_type(&self.grant_type)?;
        let feature = serde_json::from_value(self.feature_json).map_err(|e| e.to_string())?;
        Ok(Grant {
            id: self.id,
            subject_kind,
            subject_id: self.subject_id,
            project_id: self.project_id,
            feature_plan_version_id: self.feature_plan_version_id,
            feature,
            grant_type,
            limit: self.limit_value,
            anchor: self.anchor,
            effective_at: self.effective_at,
            expires_at: self.expires_at,
            auto_renew: self.auto_renew,
            deleted: self.deleted,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_subject_kind(s: &str) -> Result<SubjectKind, String> {
    match s {
        "Customer" => Ok(SubjectKind::Customer),
        "Project" => Ok(SubjectKind::Project),
        "Plan" => Ok(SubjectKind::Plan),
        "PlanVersion" => Ok(SubjectKind::PlanVersion),
        other => Err(format!("unknown subject kind: {other}")),
    }
}

fn parse_grant_type(s: &str) -> Result<super::GrantType, String> {
    use super::GrantType::*;
    match s {
        "Subscription" => Ok(Subscription),
        "Addon" => Ok(Addon),
        "Trial" => Ok(Trial),
        "Promotion" => Ok(Promotion),
        "Manual" => Ok(Manual),
        other => Err(format!("unknown grant type: {other}")),
    }
}
