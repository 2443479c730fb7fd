// src/core/agent.rs

//! Agent orchestration: startup sequence, task spawning, and the session
//! guard.
//!
//! One agent runs per node. Both roles share this sequence and differ only
//! by the `is_cn` flag: register presence, find the group, race for
//! leadership, then either bootstrap (first CN leader), reclaim, or join as
//! a replica — and finally run the reconciliation workers.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use crate::config::Config;
use crate::core::bootstrap::BootstrapController;
use crate::core::db::DbControl;
use crate::core::db::postgres::PgControl;
use crate::core::errors::{CmError, CmResult, absorb_exists};
use crate::core::events::SessionEvent;
use crate::core::health::HealthReporterTask;
use crate::core::membership::MembershipEngine;
use crate::core::store::zk::ZkStore;
use crate::core::store::{ClusterPaths, CoordStore};
use crate::core::store_node::StoreNodeGate;
use crate::core::supplement::{ReplicaMonitorTask, SupplementReactorTask};
use crate::core::types::AgentMode;

/// Capacity of the worker tick channels. Ticks are collapsible: a full
/// channel already has a pass queued.
const TICK_CHANNEL_CAPACITY: usize = 16;

/// The entry point shared by both binaries.
pub async fn run_agent(is_cn: bool) -> Result<()> {
    let cfg = Config::from_env().context("invalid agent configuration")?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    info!(
        "starting falcon-cm {} ({} agent) on node {}",
        env!("CARGO_PKG_VERSION"),
        role_name(is_cn),
        cfg.host_node_name
    );

    let store: Arc<dyn CoordStore> =
        Arc::new(ZkStore::connect(&cfg.store_endpoints, cfg.session_timeout).await?);
    let db: Arc<dyn DbControl> = Arc::new(PgControl::new(&cfg));
    Agent::new(is_cn, cfg, store, db).run().await
}

fn role_name(is_cn: bool) -> &'static str {
    if is_cn { "coordinator" } else { "data" }
}

pub struct Agent {
    cfg: Arc<Config>,
    is_cn: bool,
    store: Arc<dyn CoordStore>,
    db: Arc<dyn DbControl>,
    paths: ClusterPaths,
}

impl Agent {
    pub fn new(
        is_cn: bool,
        cfg: Config,
        store: Arc<dyn CoordStore>,
        db: Arc<dyn DbControl>,
    ) -> Self {
        let paths = ClusterPaths::new(cfg.root_path.clone());
        Self {
            cfg: Arc::new(cfg),
            is_cn,
            store,
            db,
            paths,
        }
    }

    pub async fn run(self) -> Result<()> {
        self.init_sys().await?;

        let (replica_tick_tx, replica_tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (supplement_tick_tx, supplement_tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);

        let engine = MembershipEngine::join(
            self.cfg.clone(),
            self.is_cn,
            self.store.clone(),
            self.db.clone(),
            self.paths.clone(),
            replica_tick_tx,
            supplement_tick_tx,
        )
        .await?;
        self.spawn_session_guard(engine.clone());

        let is_leader = engine.try_acquire_leadership().await?;
        if is_leader {
            info!(
                "this node is the {} leader of group {}",
                role_name(self.is_cn),
                engine.group()
            );
            if !self.store.exists(&self.paths.ready()).await? {
                engine.spawn_event_loop().await?;
                if self.is_cn {
                    let bootstrap = BootstrapController::new(
                        self.cfg.clone(),
                        self.store.clone(),
                        self.db.clone(),
                        self.paths.clone(),
                        engine.clone(),
                    );
                    bootstrap.run().await.context("bootstrap failed")?;
                } else {
                    engine.wait_group_replicas_ready().await?;
                }
                engine.arm_primary_watches().await?;
            }
            if self.is_cn {
                absorb_exists(self.store.create(&self.paths.ready(), &[], false).await)?;
            }
        } else {
            info!("this node is a {} follower", role_name(self.is_cn));
            engine.join_as_replica().await?;
        }

        if self.cfg.has_falcon_stor {
            StoreNodeGate::new(self.store.clone(), self.paths.clone())
                .run()
                .await?;
        }

        // Reconciliation workers. The shutdown sender lives for the whole
        // agent; the workers only stop when the process does.
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
        tasks.spawn(
            ReplicaMonitorTask::new(
                self.cfg.clone(),
                self.is_cn,
                self.store.clone(),
                self.paths.clone(),
                engine.group(),
                replica_tick_rx,
            )
            .run(shutdown_tx.subscribe()),
        );
        if self.is_cn {
            tasks.spawn(
                SupplementReactorTask::new(
                    self.store.clone(),
                    self.paths.clone(),
                    supplement_tick_rx,
                )
                .run(shutdown_tx.subscribe()),
            );
            tasks.spawn(
                HealthReporterTask::new(
                    self.cfg.clone(),
                    self.store.clone(),
                    self.db.clone(),
                    self.paths.clone(),
                    engine.clone(),
                )
                .run(shutdown_tx.subscribe()),
            );
        }

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(()) => warn!("an agent task completed unexpectedly"),
                Err(e) => error!("an agent task panicked: {}", e),
            }
        }
        Err(anyhow!("all agent tasks have terminated, shutting down"))
    }

    /// Ensures the base layout exists and registers this node's ephemeral
    /// presence. A fast restart can race the previous session's node; wait
    /// out the expiry once.
    async fn init_sys(&self) -> CmResult<()> {
        self.store.ensure(self.paths.root()).await?;
        self.store.ensure(&self.paths.presence_dir(true)).await?;
        self.store.ensure(&self.paths.presence_dir(false)).await?;
        self.store.ensure(&self.paths.leaders_dir()).await?;

        let presence = self.paths.presence(self.is_cn, &self.cfg.host_node_name);
        let endpoint = self.cfg.local_endpoint().to_string();
        match self
            .store
            .create(&presence, endpoint.as_bytes(), true)
            .await
        {
            Ok(()) => Ok(()),
            Err(CmError::AlreadyExists(_)) => {
                warn!("presence node still exists, waiting for the old session to expire");
                tokio::time::sleep(self.cfg.session_timeout).await;
                self.store.create(&presence, endpoint.as_bytes(), true).await
            }
            Err(e) => Err(e),
        }
    }

    /// Session loss is fatal: the engine stops, the local database is
    /// hard-stopped so a deposed primary cannot keep serving writes, and
    /// the process exits.
    fn spawn_session_guard(&self, engine: Arc<MembershipEngine>) {
        let mut session_rx = self.store.subscribe_session();
        let db = self.db.clone();
        tokio::spawn(async move {
            loop {
                match session_rx.recv().await {
                    Ok(SessionEvent::Expired) => {
                        error!("the connection to the coordination store is lost");
                        engine.set_mode(AgentMode::Stopped);
                        db.hard_stop().await;
                        std::process::exit(1);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}
