// src/core/bootstrap.rs

//! Cluster bootstrap, run exactly once by the first-elected CN leader.
//!
//! The controller waits for every node to register, partitions them into
//! replication groups, waits for every group to form, seeds the
//! foreign-server catalog and the shard map, and finally publishes the
//! `ready` sentinel. Every step is idempotent; a bootstrap failure is fatal
//! and the next CN leader start retries from the top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::info;

use crate::config::Config;
use crate::core::db::DbControl;
use crate::core::errors::{CmError, CmResult, absorb_exists};
use crate::core::membership::MembershipEngine;
use crate::core::store::{ClusterPaths, CoordStore};
use crate::core::types::{Endpoint, Group};

/// Poll interval while waiting on registrations and group formation.
const FORMATION_POLL: Duration = Duration::from_secs(1);

/// Poll interval while waiting for physical replication to stream.
const STREAMING_POLL: Duration = Duration::from_millis(500);

pub struct BootstrapController {
    cfg: Arc<Config>,
    store: Arc<dyn CoordStore>,
    db: Arc<dyn DbControl>,
    paths: ClusterPaths,
    engine: Arc<MembershipEngine>,
}

impl BootstrapController {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn CoordStore>,
        db: Arc<dyn DbControl>,
        paths: ClusterPaths,
        engine: Arc<MembershipEngine>,
    ) -> Self {
        Self {
            cfg,
            store,
            db,
            paths,
            engine,
        }
    }

    pub async fn run(&self) -> CmResult<()> {
        info!("bootstrap: waiting for all nodes to register");
        self.wait_all_registered().await?;

        info!("bootstrap: partitioning nodes into groups");
        let groups = self.build_groups().await?;

        info!("bootstrap: waiting for every group to form");
        let leaders = self.wait_groups_formed(&groups).await?;

        info!("bootstrap: initializing the filesystem catalog");
        self.init_filesystem(&leaders).await?;

        self.build_all_membership(&groups).await?;

        absorb_exists(self.store.create(&self.paths.ready(), &[], false).await)?;
        info!("bootstrap complete, cluster is ready");
        Ok(())
    }

    /// Blocks until both presence sets reach their configured sizes.
    async fn wait_all_registered(&self) -> CmResult<()> {
        loop {
            let cns = self.store.children(&self.paths.presence_dir(true)).await?;
            let dns = self.store.children(&self.paths.presence_dir(false)).await?;
            if cns.len() == self.cfg.cn_num && dns.len() == self.cfg.dn_num {
                return Ok(());
            }
            tokio::time::sleep(FORMATION_POLL).await;
        }
    }

    /// Creates the group subtrees and assigns live nodes to rosters.
    /// Excess data nodes are left unassigned for the supplement pool.
    async fn build_groups(&self) -> CmResult<Vec<Group>> {
        let mut groups = vec![Group::Cn];

        let mut cn_list = self.store.children(&self.paths.presence_dir(true)).await?;
        cn_list.sort();
        self.store
            .create(
                &self.paths.host_node(Group::Cn, &self.cfg.host_node_name),
                &[],
                false,
            )
            .await?;
        let mut picked = 0;
        for name in &cn_list {
            if picked == self.cfg.replica_server_num {
                break;
            }
            if *name == self.cfg.host_node_name {
                continue;
            }
            self.store
                .create(&self.paths.host_node(Group::Cn, name), &[], false)
                .await?;
            picked += 1;
        }

        let mut dn_list = self.store.children(&self.paths.presence_dir(false)).await?;
        dn_list.sort();
        let dn_group_count = (dn_list.len() - self.cfg.dn_supplement_num) / 3;
        let mut node_idx = 0;
        for i in 0..dn_group_count {
            let group = Group::Dn(i as u32);
            groups.push(group);
            self.engine.ensure_group_tree(group).await?;
            for _ in 0..self.cfg.group_size() {
                self.store
                    .create(&self.paths.host_node(group, &dn_list[node_idx]), &[], false)
                    .await?;
                node_idx += 1;
            }
        }
        Ok(groups)
    }

    /// Blocks until every group has a leader and a full replica set, and
    /// collects the leader endpoints.
    async fn wait_groups_formed(&self, groups: &[Group]) -> CmResult<HashMap<Group, Endpoint>> {
        let mut leaders: HashMap<Group, Endpoint> = HashMap::new();
        loop {
            for group in groups {
                if leaders.contains_key(group) {
                    continue;
                }
                let leader_path = self.paths.leader(*group);
                if !self.store.exists(&leader_path).await? {
                    continue;
                }
                let replicas = self
                    .store
                    .children(&self.paths.replicas_dir(*group))
                    .await
                    .unwrap_or_default();
                if replicas.len() == self.cfg.replica_server_num {
                    let endpoint = self.store.get_string(&leader_path).await?.parse()?;
                    leaders.insert(*group, endpoint);
                }
            }
            if leaders.len() == groups.len() {
                return Ok(leaders);
            }
            tokio::time::sleep(FORMATION_POLL).await;
        }
    }

    /// Seeds the database side: extension, foreign-server mesh, shard map,
    /// background services, and the filesystem root.
    async fn init_filesystem(&self, leaders: &HashMap<Group, Endpoint>) -> CmResult<()> {
        for (group, endpoint) in leaders {
            self.wait_replication_streaming(endpoint).await?;
            self.db.create_extension(endpoint).await?;
            info!("bootstrap: extension created on {} primary {}", group, endpoint);
        }

        // Every primary gets one catalog row per group.
        let group_names: HashMap<&Group, String> =
            leaders.keys().map(|group| (group, group.to_string())).collect();
        let mut inserts = Vec::new();
        for (group, primary) in leaders {
            for (target_group, target) in leaders {
                inserts.push(self.db.insert_foreign_server(
                    target,
                    group.id(),
                    &group_names[group],
                    primary,
                    group == target_group,
                ));
            }
        }
        try_join_all(inserts).await?;

        let dn_group_count = leaders.len().saturating_sub(1);
        let shard_count = 100 * dn_group_count as u32;
        for endpoint in leaders.values() {
            self.db.build_shard_table(endpoint, shard_count).await?;
            self.db.create_distributed_data_table(endpoint).await?;
            self.db.start_background_service(endpoint).await?;
        }

        let cn_primary = leaders
            .get(&Group::Cn)
            .ok_or_else(|| CmError::Store("bootstrap lost the cn leader".to_string()))?;
        self.db.plain_mkdir_root(cn_primary).await?;
        info!("bootstrap: filesystem catalog initialized");
        Ok(())
    }

    /// Confirms `pg_stat_replication` on one primary shows the full standby
    /// complement streaming.
    async fn wait_replication_streaming(&self, endpoint: &Endpoint) -> CmResult<()> {
        if self.cfg.replica_server_num == 0 {
            return Ok(());
        }
        loop {
            let rows = self.db.stat_replication(endpoint).await?;
            let streaming = rows.iter().filter(|r| r.state == "streaming").count();
            if streaming >= self.cfg.replica_server_num {
                return Ok(());
            }
            tokio::time::sleep(STREAMING_POLL).await;
        }
    }

    /// Marks every rostered node as a healthy member.
    async fn build_all_membership(&self, groups: &[Group]) -> CmResult<()> {
        info!("bootstrap: building all membership");
        for group in groups {
            let hosts = self.store.children(&self.paths.host_nodes_dir(*group)).await?;
            for host in hosts {
                self.store.ensure(&self.paths.member(*group, &host)).await?;
            }
        }
        Ok(())
    }
}
