// src/core/supplement.rs

//! Failure-driven group reshaping.
//!
//! [`ReplicaMonitorTask`] runs on every group primary: when the replica set
//! falls short it opens a retry window, tracks how long each rostered node
//! has been absent, and finally declares dead nodes and files replacement
//! requests. [`SupplementReactorTask`] runs on the CN primary only: it
//! fulfils those requests from the spare pools.
//!
//! Both tasks are driven by ticks forwarded from children watches; the
//! ticks carry no data, so redelivered events collapse into one
//! reconciliation pass over current store state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::errors::{CmError, CmResult, absorb_exists};
use crate::core::metrics;
use crate::core::store::paths::parse_need_supplement;
use crate::core::store::{ClusterPaths, CoordStore};
use crate::core::types::Group;

/// Poll interval inside the replica retry window and the empty-pool wait.
const RETRY_POLL: Duration = Duration::from_secs(10);

/// Maximum outstanding replacement requests per group.
const MAX_PENDING_REQUESTS: u8 = 2;

/// Watches one group's replica set and files replacement requests for
/// members that stay gone.
pub struct ReplicaMonitorTask {
    cfg: Arc<Config>,
    is_cn: bool,
    store: Arc<dyn CoordStore>,
    paths: ClusterPaths,
    group: Group,
    rx: mpsc::Receiver<()>,
}

impl ReplicaMonitorTask {
    pub fn new(
        cfg: Arc<Config>,
        is_cn: bool,
        store: Arc<dyn CoordStore>,
        paths: ClusterPaths,
        group: Group,
        rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            cfg,
            is_cn,
            store,
            paths,
            group,
            rx,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("replica monitor started for group {}", self.group);
        loop {
            tokio::select! {
                tick = self.rx.recv() => {
                    if tick.is_none() {
                        return;
                    }
                    if let Err(e) = self.reconcile().await {
                        warn!("replica reconciliation failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("replica monitor shutting down");
                    return;
                }
            }
        }
    }

    /// One reconciliation pass: if the group is short, run the retry
    /// window; when it ends, everything still absent long enough is dead.
    async fn reconcile(&self) -> CmResult<()> {
        let replicas_dir = self.paths.replicas_dir(self.group);
        let replicas = self.store.children(&replicas_dir).await?;
        let want = self.cfg.replica_server_num;
        metrics::REPLICA_SHORTFALL.set(want.saturating_sub(replicas.len()) as f64);
        if replicas.len() >= want {
            return Ok(());
        }

        let wait_secs = self.cfg.wait_replica_time.as_secs();
        let mut lost: HashMap<String, u64> = HashMap::new();
        let mut retry_num = wait_secs / 10 + 1;
        loop {
            let replicas = self.store.children(&replicas_dir).await?;
            if replicas.len() >= want {
                metrics::REPLICA_SHORTFALL.set(0.0);
                return Ok(());
            }

            let hosts = self
                .store
                .children(&self.paths.host_nodes_dir(self.group))
                .await?;
            for name in &hosts {
                if self
                    .store
                    .exists(&self.paths.presence(self.is_cn, name))
                    .await?
                {
                    lost.remove(name);
                } else {
                    let elapsed = lost
                        .entry(name.clone())
                        .and_modify(|t| *t += 10)
                        .or_insert(0);
                    info!("lost time for node {} is {}s", name, elapsed);
                    if *elapsed >= wait_secs.saturating_sub(10) {
                        retry_num = 0;
                    }
                }
            }

            if retry_num == 0 {
                info!("replica retry window over for group {}", self.group);
                self.declare_dead(&hosts, &lost).await?;
                return Ok(());
            }
            retry_num -= 1;
            tokio::time::sleep(RETRY_POLL).await;
        }
    }

    /// Removes dead nodes from the roster and files one replacement request
    /// per lost slot, capped at two outstanding requests.
    async fn declare_dead(&self, hosts: &[String], lost: &HashMap<String, u64>) -> CmResult<()> {
        let wait_secs = self.cfg.wait_replica_time.as_secs();
        for name in hosts {
            if self
                .store
                .exists(&self.paths.presence(self.is_cn, name))
                .await?
            {
                continue;
            }
            let Some(elapsed) = lost.get(name) else {
                continue;
            };
            if *elapsed < wait_secs.saturating_sub(10) {
                continue;
            }
            warn!("node {} is lost, requesting a replacement", name);
            self.request_supplement().await?;
            self.store
                .delete_quiet(&self.paths.host_node(self.group, name))
                .await?;
            self.store
                .delete_quiet(&self.paths.member(self.group, name))
                .await?;
        }
        Ok(())
    }

    async fn request_supplement(&self) -> CmResult<()> {
        for k in 0..MAX_PENDING_REQUESTS {
            match self
                .store
                .create(&self.paths.need_supplement(self.group, k), &[], false)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_race() => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(
            "group {} already has {} outstanding replacement requests, dropping",
            self.group, MAX_PENDING_REQUESTS
        );
        Ok(())
    }
}

/// Consumes replacement requests on the CN primary, moving spares from the
/// supplement pools into depleted rosters.
pub struct SupplementReactorTask {
    store: Arc<dyn CoordStore>,
    paths: ClusterPaths,
    rx: mpsc::Receiver<()>,
}

impl SupplementReactorTask {
    pub fn new(store: Arc<dyn CoordStore>, paths: ClusterPaths, rx: mpsc::Receiver<()>) -> Self {
        Self { store, paths, rx }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("supplement reactor started");
        loop {
            tokio::select! {
                tick = self.rx.recv() => {
                    if tick.is_none() {
                        return;
                    }
                    if let Err(e) = self.drain_requests().await {
                        warn!("supplement pass failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("supplement reactor shutting down");
                    return;
                }
            }
        }
    }

    async fn drain_requests(&self) -> CmResult<()> {
        let requests = self
            .store
            .children(&self.paths.need_supplement_dir())
            .await?;
        for child in requests {
            let request_path = format!("{}/{}", self.paths.need_supplement_dir(), child);
            if !self.store.exists(&request_path).await? {
                continue;
            }
            let Some((group, k)) = parse_need_supplement(&child) else {
                warn!("malformed replacement request '{}', dropping", child);
                self.store.delete_quiet(&request_path).await?;
                continue;
            };
            if k >= MAX_PENDING_REQUESTS {
                warn!("replacement request '{}' is out of contract, dropping", child);
                self.store.delete_quiet(&request_path).await?;
                continue;
            }

            info!("group {} needs a replacement member", group);
            let node = self.take_from_pool(group.is_cn()).await?;
            absorb_exists(
                self.store
                    .create(&self.paths.host_node(group, &node), b"new", false)
                    .await,
            )?;
            info!("node {} is added to group {}", node, group);
            self.store.delete_quiet(&request_path).await?;
            metrics::SUPPLEMENTS_TOTAL.inc();
        }
        Ok(())
    }

    /// Atomically claims one spare from the pool, waiting while it is
    /// empty. The delete is the claim: losing the race moves on to the next
    /// entry.
    async fn take_from_pool(&self, is_cn: bool) -> CmResult<String> {
        let pool_dir = self.paths.supplement_dir(is_cn);
        loop {
            let mut pool = self.store.children(&pool_dir).await?;
            pool.sort();
            for name in pool {
                match self.store.delete(&self.paths.supplement(is_cn, &name)).await {
                    Ok(()) => return Ok(name),
                    Err(e) if e.is_race() => continue,
                    Err(e) => return Err(e),
                }
            }
            info!("{}", CmError::SupplementExhausted(pool_dir.clone()));
            tokio::time::sleep(RETRY_POLL).await;
        }
    }
}
