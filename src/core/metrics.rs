// src/core/metrics.rs

//! Defines and registers Prometheus metrics for agent monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, TextEncoder, register_counter, register_gauge};

lazy_static! {
    // --- Counters ---
    /// Base-backup rebuild attempts. The rebuild loop is unbounded, so this
    /// is the only visibility into a node that cannot rejoin.
    pub static ref BASEBACKUP_ATTEMPTS_TOTAL: Counter =
        register_counter!("falcon_cm_basebackup_attempts_total", "Total pg_basebackup rebuild attempts.").unwrap();
    /// Elections this agent has won (created the group leader node).
    pub static ref ELECTIONS_WON_TOTAL: Counter =
        register_counter!("falcon_cm_elections_won_total", "Total group elections won by this agent.").unwrap();
    /// Supplement assignments performed by this agent (CN primary only).
    pub static ref SUPPLEMENTS_TOTAL: Counter =
        register_counter!("falcon_cm_supplements_total", "Total spare nodes assigned to depleted groups.").unwrap();
    /// Health-check cycles that ended unhealthy after the full retry budget.
    pub static ref HEALTH_CHECK_FAILURES_TOTAL: Counter =
        register_counter!("falcon_cm_health_check_failures_total", "Total health-check cycles that stayed unhealthy.").unwrap();

    // --- Gauges ---
    /// Current shortfall of the watched group's replica set.
    pub static ref REPLICA_SHORTFALL: Gauge =
        register_gauge!("falcon_cm_replica_shortfall", "Standbys missing from the watched group's replica set.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
