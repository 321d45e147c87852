//! Explicit request context.
//!
//! The source this core was rewritten from threads a request-scoped
//! "wide event" through implicit task-local storage. That pattern does
//! not translate cleanly to a systems language with explicit ownership,
//! so here the context is a plain value: every service entrypoint takes
//! it as its first parameter, and any spawned background task receives
//! an owned clone rather than reaching for ambient storage.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Carried through every entrypoint and into any background task it spawns.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller-supplied or generated request id, echoed in logs and verifications.
    pub request_id: String,
    /// Customer the request is scoped to.
    pub customer_id: String,
    /// Project the request is scoped to.
    pub project_id: String,
    /// Wall-clock time the request was received, used as `now` throughout.
    pub now: DateTime<Utc>,
    /// Monotonic start used to compute `latency` in verification records.
    pub performance_start: std::time::Instant,
}

impl RequestContext {
    /// Build a context for `now`, generating a request id if none was supplied.
    pub fn new(
        customer_id: impl Into<String>,
        project_id: impl Into<String>,
        now: DateTime<Utc>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            customer_id: customer_id.into(),
            project_id: project_id.into(),
            now,
            performance_start: std::time::Instant::now(),
        }
    }

    /// Elapsed time since the context was constructed, in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        self.performance_start.elapsed().as_secs_f64() * 1000.0
    }

    /// A `tracing` span carrying the identifying fields of this request.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "entitlement_request",
            request_id = %self.request_id,
            customer_id = %self.customer_id,
            project_id = %self.project_id,
        )
    }
}
