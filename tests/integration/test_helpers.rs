// tests/integration/test_helpers.rs

//! Test helpers and utilities for the agent test suite.
//!
//! `TestCluster` wraps the in-process store with the seeded layout of a
//! bootstrapped cluster; `FakeDb` is a scripted database control that
//! records calls instead of touching PostgreSQL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use falcon_cm::config::Config;
use falcon_cm::core::db::{DbControl, ForeignServerRow, ReplicationRow};
use falcon_cm::core::errors::CmResult;
use falcon_cm::core::store::memory::{MemorySession, MemoryStore};
use falcon_cm::core::store::{ClusterPaths, CoordStore};
use falcon_cm::core::types::{Endpoint, Group};

/// Builds a config for one test node with sensible cluster counts.
pub fn test_config(node: &str, ip: &str) -> Config {
    config_with(node, ip, &[])
}

pub fn config_with(node: &str, ip: &str, overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("zk_endpoint", "memory:2181"),
        ("POD_IP", ip),
        ("NODE_NAME", node),
        ("cn_num", "3"),
        ("dn_num", "3"),
        ("dn_sup_num", "0"),
        ("cn_sup_num", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|k| vars.get(k).cloned()).expect("test config must be valid")
}

/// An in-process cluster: the shared store plus the path layout.
pub struct TestCluster {
    pub store: MemoryStore,
    pub paths: ClusterPaths,
    admin: MemorySession,
}

impl TestCluster {
    /// Creates the store with the base layout every agent expects.
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let paths = ClusterPaths::new("/falcon");
        let admin = store.session();
        for path in [
            paths.root().to_string(),
            paths.presence_dir(true),
            paths.presence_dir(false),
            paths.leaders_dir(),
            paths.clusters_dir(),
            paths.supplement_dir(true),
            paths.supplement_dir(false),
            paths.need_supplement_dir(),
        ] {
            admin.ensure(&path).await.unwrap();
        }
        Self {
            store,
            paths,
            admin,
        }
    }

    /// A persistent session for seeding and assertions.
    pub fn admin(&self) -> &MemorySession {
        &self.admin
    }

    /// A fresh session, as one agent would hold.
    pub fn session(&self) -> MemorySession {
        self.store.session()
    }

    /// Seeds one group's subtree with a roster and full membership.
    pub async fn seed_group(&self, group: Group, hosts: &[&str]) {
        self.admin
            .ensure(&self.paths.group_dir(group))
            .await
            .unwrap();
        self.admin
            .ensure(&self.paths.last_leader(group))
            .await
            .unwrap();
        self.admin
            .ensure(&self.paths.host_nodes_dir(group))
            .await
            .unwrap();
        self.admin
            .ensure(&self.paths.replicas_dir(group))
            .await
            .unwrap();
        self.admin
            .ensure(&self.paths.membership_dir(group))
            .await
            .unwrap();
        self.admin
            .ensure(&self.paths.candidates_dir(group))
            .await
            .unwrap();
        for host in hosts {
            self.admin
                .ensure(&self.paths.host_node(group, host))
                .await
                .unwrap();
            self.admin
                .ensure(&self.paths.member(group, host))
                .await
                .unwrap();
        }
    }

    /// Marks the cluster bootstrapped.
    pub async fn mark_ready(&self) {
        self.admin.ensure(&self.paths.ready()).await.unwrap();
    }

    /// Registers a persistent presence marker for one host (tests that
    /// only need existence, not session semantics).
    pub async fn register_presence(&self, is_cn: bool, host: &str, endpoint: &Endpoint) {
        self.admin
            .create(
                &self.paths.presence(is_cn, host),
                endpoint.to_string().as_bytes(),
                false,
            )
            .await
            .unwrap();
    }
}

/// Polls a condition until it holds, panicking after a few seconds.
pub async fn wait_for<F, Fut>(mut cond: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..700 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A scripted [`DbControl`] recording every call.
pub struct FakeDb {
    standby: AtomicBool,
    lsn: AtomicU64,
    pub promotes: Mutex<Vec<Endpoint>>,
    pub demotes: Mutex<Vec<Endpoint>>,
    pub basebackups: Mutex<Vec<Endpoint>>,
    pub follow_changes: Mutex<Vec<Endpoint>>,
    pub stop_replication_count: AtomicU64,
    pub foreign_server_updates: Mutex<Vec<(u32, Endpoint)>>,
    pub replication_rows: Mutex<Vec<ReplicationRow>>,
    pub catalog: Mutex<Vec<ForeignServerRow>>,
}

impl FakeDb {
    fn new(standby: bool, lsn: u64) -> Arc<Self> {
        Arc::new(Self {
            standby: AtomicBool::new(standby),
            lsn: AtomicU64::new(lsn),
            promotes: Mutex::new(Vec::new()),
            demotes: Mutex::new(Vec::new()),
            basebackups: Mutex::new(Vec::new()),
            follow_changes: Mutex::new(Vec::new()),
            stop_replication_count: AtomicU64::new(0),
            foreign_server_updates: Mutex::new(Vec::new()),
            replication_rows: Mutex::new(Vec::new()),
            catalog: Mutex::new(Vec::new()),
        })
    }

    /// A standby instance with the given WAL position.
    pub fn standby_with_lsn(lsn: u64) -> Arc<Self> {
        Self::new(true, lsn)
    }

    /// A primary instance.
    pub fn primary() -> Arc<Self> {
        Self::new(false, 0)
    }

    pub fn is_standby_now(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DbControl for FakeDb {
    async fn is_standby(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }

    async fn get_lsn(&self, _local: &Endpoint) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    async fn promote(&self, local: &Endpoint) -> CmResult<()> {
        self.standby.store(false, Ordering::SeqCst);
        self.promotes.lock().push(local.clone());
        Ok(())
    }

    async fn demote(&self, leader: &Endpoint, _local: &Endpoint) -> CmResult<()> {
        self.standby.store(true, Ordering::SeqCst);
        self.demotes.lock().push(leader.clone());
        Ok(())
    }

    async fn demote_by_basebackup(&self, leader: &Endpoint, _local: &Endpoint) -> CmResult<()> {
        self.standby.store(true, Ordering::SeqCst);
        self.basebackups.lock().push(leader.clone());
        Ok(())
    }

    async fn change_following_leader(&self, leader: &Endpoint, _local: &Endpoint) -> CmResult<()> {
        self.follow_changes.lock().push(leader.clone());
        Ok(())
    }

    async fn stop_replication(&self, _local: &Endpoint) -> CmResult<()> {
        self.stop_replication_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hard_stop(&self) {}

    async fn update_foreign_server(
        &self,
        _cn: &Endpoint,
        group_id: u32,
        primary: &Endpoint,
    ) -> CmResult<()> {
        self.foreign_server_updates
            .lock()
            .push((group_id, primary.clone()));
        Ok(())
    }

    async fn reload_foreign_server_cache(&self, _cn: &Endpoint) -> CmResult<()> {
        Ok(())
    }

    async fn start_background_service(&self, _ep: &Endpoint) -> CmResult<()> {
        Ok(())
    }

    async fn create_extension(&self, _ep: &Endpoint) -> CmResult<()> {
        Ok(())
    }

    async fn insert_foreign_server(
        &self,
        _ep: &Endpoint,
        _group_id: u32,
        _group_name: &str,
        _primary: &Endpoint,
        _is_local: bool,
    ) -> CmResult<()> {
        Ok(())
    }

    async fn build_shard_table(&self, _ep: &Endpoint, _shard_count: u32) -> CmResult<()> {
        Ok(())
    }

    async fn create_distributed_data_table(&self, _ep: &Endpoint) -> CmResult<()> {
        Ok(())
    }

    async fn plain_mkdir_root(&self, _cn: &Endpoint) -> CmResult<()> {
        Ok(())
    }

    async fn stat_replication(&self, _ep: &Endpoint) -> CmResult<Vec<ReplicationRow>> {
        Ok(self.replication_rows.lock().clone())
    }

    async fn foreign_servers(&self, _cn: &Endpoint) -> CmResult<Vec<ForeignServerRow>> {
        Ok(self.catalog.lock().clone())
    }
}
