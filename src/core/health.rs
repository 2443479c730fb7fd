// src/core/health.rs

//! Periodic end-to-end health check, run while this agent is the CN
//! primary.
//!
//! Each cycle confirms that the leader set in the store matches the
//! foreign-server catalog, and that every primary's physical replication is
//! streaming to exactly the replica set the store advertises. A cycle that
//! stays unhealthy through the whole retry budget dispatches one alert.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Config;
use crate::core::alert::AlertSender;
use crate::core::db::DbControl;
use crate::core::errors::CmError;
use crate::core::membership::MembershipEngine;
use crate::core::metrics;
use crate::core::store::{ClusterPaths, CoordStore};
use crate::core::types::{AgentMode, Endpoint, Group};

/// Retries per cycle before the failure is considered persistent.
const RETRY_BUDGET: u32 = 10;

/// Delay between retries within one cycle.
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// A health-check failure, naming the offending node for the alert.
#[derive(Debug, Clone, Default)]
struct HealthIssue {
    message: String,
    node: String,
}

impl HealthIssue {
    fn new(message: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node: node.into(),
        }
    }
}

pub struct HealthReporterTask {
    cfg: Arc<Config>,
    store: Arc<dyn CoordStore>,
    db: Arc<dyn DbControl>,
    paths: ClusterPaths,
    engine: Arc<MembershipEngine>,
    alert: AlertSender,
}

impl HealthReporterTask {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn CoordStore>,
        db: Arc<dyn DbControl>,
        paths: ClusterPaths,
        engine: Arc<MembershipEngine>,
    ) -> Self {
        let alert = AlertSender::new(cfg.report_dst.clone());
        Self {
            cfg,
            store,
            db,
            paths,
            engine,
            alert,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.cfg.use_error_report {
            info!("error reporting is disabled, health reporter will not run");
            return;
        }
        info!(
            "health reporter started, period {:?}",
            self.cfg.check_meta_period
        );
        loop {
            // Only the CN primary owns the check; followers idle.
            if self.engine.mode() == AgentMode::Primary {
                self.run_cycle(&mut shutdown_rx).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_meta_period) => {}
                _ = shutdown_rx.recv() => {
                    info!("health reporter shutting down");
                    return;
                }
            }
        }
    }

    /// One check cycle: retry up to the budget, alert if still unhealthy.
    async fn run_cycle(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!("check meta status");
        let mut last_issue = HealthIssue::default();
        for _ in 0..RETRY_BUDGET {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = shutdown_rx.recv() => return,
            }
            match self.check_cluster().await {
                Ok(()) => return,
                Err(issue) => {
                    error!("cluster is not healthy: {}", issue.message);
                    last_issue = issue;
                }
            }
        }
        metrics::HEALTH_CHECK_FAILURES_TOTAL.inc();
        self.alert.send(&last_issue.message, &last_issue.node).await;
    }

    async fn check_cluster(&self) -> Result<(), HealthIssue> {
        let leader_names = self
            .store
            .children(&self.paths.leaders_dir())
            .await
            .map_err(|e| HealthIssue::new(format!("store is in error state: {e}"), "ZK"))?;
        if leader_names.is_empty() {
            return Err(HealthIssue::new("store has no leaders", "ZK"));
        }

        let mut leaders: Vec<(Group, Endpoint)> = Vec::new();
        for name in &leader_names {
            let Some(group) = Group::parse(name) else {
                continue;
            };
            let raw = self
                .store
                .get_string(&self.paths.leader(group))
                .await
                .map_err(|e| HealthIssue::new(format!("cannot read leader of {group}: {e}"), name.clone()))?;
            let endpoint: Endpoint = raw
                .parse()
                .map_err(|_| HealthIssue::new(format!("leader of {group} holds garbage"), name.clone()))?;
            leaders.push((group, endpoint));
        }

        let cn_primary = leaders
            .iter()
            .find(|(group, _)| group.is_cn())
            .map(|(_, ep)| ep.clone())
            .ok_or_else(|| HealthIssue::new("no CN leader in the store", "CN"))?;

        // The catalog on the CN primary must list exactly the current
        // leaders.
        let catalog = self
            .db
            .foreign_servers(&cn_primary)
            .await
            .map_err(|e| HealthIssue::new(format!("cannot read the foreign-server catalog: {e}"), "Meta"))?;
        let store_set: HashSet<(String, String)> = leaders
            .iter()
            .map(|(group, ep)| (group.to_string(), ep.host.clone()))
            .collect();
        let catalog_set: HashSet<(String, String)> = catalog
            .iter()
            .map(|row| (row.server_name.clone(), row.host.clone()))
            .collect();
        if store_set != catalog_set {
            return Err(HealthIssue::new(
                "the leader set in the store does not match the metaserver catalog",
                "Meta",
            ));
        }

        for (group, endpoint) in &leaders {
            self.check_group_replication(*group, endpoint).await?;
        }
        Ok(())
    }

    async fn check_group_replication(
        &self,
        group: Group,
        endpoint: &Endpoint,
    ) -> Result<(), HealthIssue> {
        let node = format!("{}:{}", group, endpoint.host);
        let rows = self
            .db
            .stat_replication(endpoint)
            .await
            .map_err(|e| HealthIssue::new(format!("cannot read pg_stat_replication on {endpoint}: {e}"), node.clone()))?;
        let want = self.cfg.replica_server_num;
        if rows.len() != want || rows.iter().any(|r| r.state != "streaming") {
            let err = CmError::DbNotStreaming(endpoint.to_string());
            return Err(HealthIssue::new(
                format!("group {group}: {err}"),
                node.clone(),
            ));
        }

        let advertised = self
            .store
            .children(&self.paths.replicas_dir(group))
            .await
            .map_err(|e| HealthIssue::new(format!("cannot read replicas of {group}: {e}"), node.clone()))?;
        let store_ips: HashSet<String> = advertised
            .iter()
            .filter_map(|ep| ep.split(':').next().map(str::to_string))
            .collect();
        let db_ips: HashSet<String> = rows.iter().map(|r| r.client_addr.clone()).collect();
        if store_ips != db_ips {
            return Err(HealthIssue::new(
                format!("replicas of group {group} in the store and the metaserver differ"),
                node,
            ));
        }
        Ok(())
    }
}
