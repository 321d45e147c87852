//! # entitlement-core
//!
//! Entitlement resolution and usage-metering core for the billing
//! platform: merges active grants into a single effective entitlement,
//! meters consumption against it, and keeps the meter honest against
//! settled analytics in the background.
//!
//! ## Architecture
//!
//! - `entitlement::aggregation`: aggregation-method behavior table
//! - `entitlement::cycle`: pure billing/reset cycle-window calculator
//! - `entitlement::grants`: grant model and grant store
//! - `entitlement::resolver`: merges grants into an `Entitlement`
//! - `entitlement::meter`: usage counter with verify/consume
//! - `entitlement::storage`: durable per-(customer, feature) state
//! - `entitlement::cache`: two-tier moka/redis cache with SWR
//! - `entitlement::analytics`: settled-usage event source
//! - `entitlement::reconciler`: drift correction against analytics
//! - `entitlement::pricing`: tiered/packaged/flat cost waterfall
//! - `entitlement::service`: orchestrator behind the service entrypoints
//! - `entitlement::actor`: per-customer actor and alarm loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entitlement;

/// Re-export version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
