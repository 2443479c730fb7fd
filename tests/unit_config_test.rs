// tests/unit_config_test.rs

use std::collections::HashMap;
use std::time::Duration;

use falcon_cm::config::{Config, ConfigError};

fn base_vars() -> HashMap<String, String> {
    [
        ("zk_endpoint", "zk-0:2181,zk-1:2181"),
        ("POD_IP", "10.0.0.1"),
        ("NODE_NAME", "meta-node-0"),
        ("cn_num", "3"),
        ("dn_num", "3"),
        ("dn_sup_num", "0"),
        ("cn_sup_num", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn from_vars(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
    Config::from_lookup(|k| vars.get(k).cloned())
}

#[test]
fn test_config_defaults() {
    let cfg = from_vars(&base_vars()).unwrap();
    assert_eq!(cfg.replica_server_num, 2);
    assert_eq!(cfg.root_path, "/falcon");
    assert_eq!(cfg.user_name, "falconMeta");
    assert_eq!(cfg.meta_port, 5432);
    assert_eq!(cfg.session_timeout, Duration::from_secs(10));
    assert_eq!(cfg.wait_replica_time, Duration::from_secs(600));
    assert_eq!(cfg.check_meta_period, Duration::from_secs(2 * 3600));
    assert_eq!(cfg.report_dst, "None");
    assert!(!cfg.use_error_report);
    assert!(!cfg.has_falcon_stor);
    assert_eq!(cfg.group_size(), 3);
    assert_eq!(
        cfg.pgdata_dir(),
        std::path::Path::new("/home/falconMeta/data/metadata")
    );
}

#[test]
fn test_config_replica_server_num_above_range() {
    let mut vars = base_vars();
    vars.insert("replica_server_num".into(), "3".into());
    let err = from_vars(&vars).unwrap_err();
    assert!(err.to_string().contains("replica_server_num"));
}

#[test]
fn test_config_replica_server_num_below_range() {
    let mut vars = base_vars();
    vars.insert("replica_server_num".into(), "-1".into());
    let err = from_vars(&vars).unwrap_err();
    assert!(err.to_string().contains("replica_server_num"));
}

#[test]
fn test_config_replica_server_num_zero_is_valid() {
    let mut vars = base_vars();
    vars.insert("replica_server_num".into(), "0".into());
    let cfg = from_vars(&vars).unwrap();
    assert_eq!(cfg.replica_server_num, 0);
    assert_eq!(cfg.group_size(), 1);
}

#[test]
fn test_config_missing_store_endpoints() {
    let mut vars = base_vars();
    vars.remove("zk_endpoint");
    assert_eq!(
        from_vars(&vars).unwrap_err(),
        ConfigError::Missing("zk_endpoint")
    );
}

#[test]
fn test_config_missing_node_counts() {
    let mut vars = base_vars();
    vars.remove("dn_num");
    assert_eq!(from_vars(&vars).unwrap_err(), ConfigError::Missing("dn_num"));
}

#[test]
fn test_config_invalid_port() {
    let mut vars = base_vars();
    vars.insert("meta_port".into(), "not-a-port".into());
    let err = from_vars(&vars).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "meta_port", .. }));
}

#[test]
fn test_config_check_meta_period_is_hours() {
    let mut vars = base_vars();
    vars.insert("CHECK_META_PERIOD".into(), "5".into());
    let cfg = from_vars(&vars).unwrap();
    assert_eq!(cfg.check_meta_period, Duration::from_secs(5 * 3600));
}

#[test]
fn test_config_local_endpoint() {
    let cfg = from_vars(&base_vars()).unwrap();
    assert_eq!(cfg.local_endpoint().to_string(), "10.0.0.1:5432");
}
