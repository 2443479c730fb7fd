// tests/unit_metrics_test.rs

use falcon_cm::core::metrics;

#[test]
fn test_registry_renders_agent_metrics() {
    metrics::BASEBACKUP_ATTEMPTS_TOTAL.inc();
    metrics::REPLICA_SHORTFALL.set(1.0);
    let text = metrics::gather_metrics();
    assert!(text.contains("falcon_cm_basebackup_attempts_total"));
    assert!(text.contains("falcon_cm_replica_shortfall"));
}
