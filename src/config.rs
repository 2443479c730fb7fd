// src/config.rs

//! Manages agent configuration: reading the environment, resolving defaults,
//! and validation.
//!
//! The agent is configured entirely through environment variables (it runs as
//! a pod sidecar; there are no CLI flags). `Config::from_env` reads the
//! process environment; `Config::from_lookup` takes an arbitrary lookup
//! function so tests can construct configurations without touching global
//! state.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::Endpoint;

/// The valid range for `replica_server_num` (standbys per group).
pub const REPLICA_SERVER_NUM_RANGE: std::ops::RangeInclusive<usize> = 0..=2;

/// Errors raised while constructing a [`Config`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable '{0}'")]
    Missing(&'static str),

    #[error("invalid value '{value}' for '{field}'")]
    Invalid { field: &'static str, value: String },

    #[error("'{field}' must be within [{min}, {max}], got {got}")]
    OutOfRange {
        field: &'static str,
        min: usize,
        max: usize,
        got: i64,
    },
}

/// The full agent configuration, shared read-only by every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination-store endpoints, e.g. `"zk-0:2181,zk-1:2181"`.
    pub store_endpoints: String,
    /// Root path of the cluster inside the store.
    pub root_path: String,
    /// Database role used for every SQL connection.
    pub user_name: String,
    /// This pod's advertised IP.
    pub pod_ip: String,
    /// Stable node identity, unique across the cluster.
    pub host_node_name: String,
    /// Port of the local (and every remote) database instance.
    pub meta_port: u16,
    /// Coordination-store session timeout.
    pub session_timeout: Duration,
    /// Number of hot standbys per replication group.
    pub replica_server_num: usize,
    /// Total data nodes registered at bootstrap.
    pub dn_num: usize,
    /// Total coordinator nodes registered at bootstrap.
    pub cn_num: usize,
    /// Data nodes reserved for the supplement pool.
    pub dn_supplement_num: usize,
    /// Coordinator nodes reserved for the supplement pool.
    pub cn_supplement_num: usize,
    /// How long a group member may be absent before it is declared dead.
    pub wait_replica_time: Duration,
    /// Base data directory; the database cluster lives in `<data_dir>/metadata`.
    pub data_dir: PathBuf,
    /// Interval between end-to-end metadata health checks.
    pub check_meta_period: Duration,
    /// Alert transport selector (`"None"` disables dispatch).
    pub report_dst: String,
    /// Whether the health reporter runs at all.
    pub use_error_report: bool,
    /// Whether to gate on the storage-tier deployment before serving.
    pub has_falcon_stor: bool,
    /// Log level for the tracing subscriber, overridable by `RUST_LOG`.
    pub log_level: String,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let replica_server_num = parse_or("replica_server_num", &get, 2i64)?;
        if replica_server_num < *REPLICA_SERVER_NUM_RANGE.start() as i64
            || replica_server_num > *REPLICA_SERVER_NUM_RANGE.end() as i64
        {
            return Err(ConfigError::OutOfRange {
                field: "replica_server_num",
                min: *REPLICA_SERVER_NUM_RANGE.start(),
                max: *REPLICA_SERVER_NUM_RANGE.end(),
                got: replica_server_num,
            });
        }

        let timeout_secs: f64 = parse_or("timeout", &get, 10.0)?;
        let check_meta_hours: u64 = parse_or("CHECK_META_PERIOD", &get, 2)?;

        Ok(Self {
            store_endpoints: required("zk_endpoint", &get)?,
            root_path: get("cluster_name").unwrap_or_else(|| "/falcon".to_string()),
            user_name: get("user_name").unwrap_or_else(|| "falconMeta".to_string()),
            pod_ip: required("POD_IP", &get)?,
            host_node_name: required("NODE_NAME", &get)?,
            meta_port: parse_or("meta_port", &get, 5432u16)?,
            session_timeout: Duration::from_secs_f64(timeout_secs),
            replica_server_num: replica_server_num as usize,
            dn_num: parse_required("dn_num", &get)?,
            cn_num: parse_required("cn_num", &get)?,
            dn_supplement_num: parse_required("dn_sup_num", &get)?,
            cn_supplement_num: parse_required("cn_sup_num", &get)?,
            wait_replica_time: Duration::from_secs(parse_or("wait_replica_time", &get, 600u64)?),
            data_dir: PathBuf::from(
                get("data_dir").unwrap_or_else(|| "/home/falconMeta/data".to_string()),
            ),
            check_meta_period: Duration::from_secs(check_meta_hours * 3600),
            report_dst: get("REPORT_DST").unwrap_or_else(|| "None".to_string()),
            use_error_report: parse_or("USE_ERROR_REPORT", &get, 0u8)? == 1,
            has_falcon_stor: get("has_falcon_stor").is_some_and(|v| !v.is_empty()),
            log_level: get("cm_log_level").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// The database cluster directory under the configured data dir.
    pub fn pgdata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// This node's advertised database endpoint.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.pod_ip.clone(),
            port: self.meta_port,
        }
    }

    /// Size of every replication group (one primary plus the standbys).
    pub fn group_size(&self) -> usize {
        self.replica_server_num + 1
    }
}

fn required(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    match get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_required<T: FromStr>(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
) -> Result<T, ConfigError> {
    let raw = required(key, get)?;
    raw.parse().map_err(|_| ConfigError::Invalid {
        field: key,
        value: raw,
    })
}

fn parse_or<T: FromStr>(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) if !raw.is_empty() => raw.parse().map_err(|_| ConfigError::Invalid {
            field: key,
            value: raw,
        }),
        _ => Ok(default),
    }
}
