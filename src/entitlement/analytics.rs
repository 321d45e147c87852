//! Analytics source: the append-only, ULID-cursored event stream the
//! reconciler folds into meters. Built on the `analytics::collector`
//! ingest idiom used elsewhere, reduced to the read/write surface the
//! reconciliation protocol actually needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Analytics-layer failure.
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// The upstream analytics store returned an error.
    #[error("analytics error: {0}")]
    Upstream(String),
}

/// One usage event as read back from the analytics store, ordered by
/// ULID cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    /// ULID, monotonically increasing with event time.
    pub id: String,
    /// Customer scope.
    pub customer_id: String,
    /// Project scope.
    pub project_id: String,
    /// Feature scope.
    pub feature_slug: String,
    /// Signed usage delta.
    pub usage: f64,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate usage total for a feature up to some cursor, used by
/// `get_billing_usage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingUsage {
    /// Feature scope.
    pub feature_slug: String,
    /// Summed usage.
    pub total: f64,
    /// Cursor the total is accurate as of.
    pub as_of_id: String,
}

/// Read/write surface the reconciler and meter actor need against the
/// analytics store.
#[async_trait::async_trait]
pub trait AnalyticsClient: Send + Sync {
    /// Events for `(customer_id, project_id, feature_slug)` strictly
    /// after `since_id` (exclusive), up to `watermark`, ordered by cursor.
    async fn get_features_usage_cursor(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
        since_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, AnalyticsError>;

    /// Billing-period aggregate for a feature as of `watermark`.
    async fn get_billing_usage(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
        watermark: DateTime<Utc>,
    ) -> Result<BillingUsage, AnalyticsError>;

    /// Ingest a usage event (used by tests and the in-memory double;
    /// production ingestion goes through the storage layer's write path).
    async fn ingest(&self, event: UsageEvent) -> Result<(), AnalyticsError>;
}

/// In-memory analytics double: an append-only, ULID-ordered event log
/// keyed by `(customer, project, feature)`.
#[derive(Default)]
pub struct FakeAnalyticsClient {
    events: Arc<RwLock<HashMap<(String, String, String), Vec<UsageEvent>>>>,
}

impl FakeAnalyticsClient {
    /// An empty event log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AnalyticsClient for FakeAnalyticsClient {
    async fn get_features_usage_cursor(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
        since_id: &str,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, AnalyticsError> {
        let key = (customer_id.to_string(), project_id.to_string(), feature_slug.to_string());
        let events = self.events.read().await;
        let Some(log) = events.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|e| e.id.as_str() > since_id && e.timestamp <= watermark)
            .cloned()
            .collect())
    }

    async fn get_billing_usage(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
        watermark: DateTime<Utc>,
    ) -> Result<BillingUsage, AnalyticsError> {
        let key = (customer_id.to_string(), project_id.to_string(), feature_slug.to_string());
        let events = self.events.read().await;
        let log = events.get(&key);
        let mut total = 0.0;
        let mut as_of_id = String::new();
        if let Some(log) = log {
            for e in log.iter().filter(|e| e.timestamp <= watermark) {
                total += e.usage;
                if e.id > as_of_id {
                    as_of_id = e.id.clone();
                }
            }
        }
        Ok(BillingUsage { feature_slug: feature_slug.to_string(), total, as_of_id })
    }

    async fn ingest(&self, event: UsageEvent) -> Result<(), AnalyticsError> {
        let key = (event.customer_id.clone(), event.project_id.clone(), event.feature_slug.clone());
        let mut events = self.events.write().await;
        let log = events.entry(key).or_default();
        log.push(event);
        log.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, usage: f64, at: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            id: id.into(),
            customer_id: "cust_1".into(),
            project_id: "proj_1".into(),
            feature_slug: "api_calls".into(),
            usage,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn cursor_excludes_since_id_and_future_events() {
        let client = FakeAnalyticsClient::new();
        let now = Utc::now();
        client.ingest(event("01A", 1.0, now)).await.unwrap();
        client.ingest(event("01B", 2.0, now)).await.unwrap();
        client.ingest(event("01C", 3.0, now + chrono::Duration::hours(1))).await.unwrap();

        let events = client
            .get_features_usage_cursor("cust_1", "proj_1", "api_calls", "01A", now)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "01B");
    }

    #[tokio::test]
    async fn billing_usage_sums_up_to_watermark() {
        let client = FakeAnalyticsClient::new();
        let now = Utc::now();
        client.ingest(event("01A", 1.0, now)).await.unwrap();
        client.ingest(event("01B", 2.0, now)).await.unwrap();
        let usage = client.get_billing_usage("cust_1", "proj_1", "api_calls", now).await.unwrap();
        assert_eq!(usage.total, 3.0);
        assert_eq!(usage.as_of_id, "01B");
    }
}
