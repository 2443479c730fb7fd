// src/core/membership.rs

//! The group membership engine: group discovery, the leader race, the
//! follower join path, and the failure-driven election protocol.
//!
//! All cross-node ordering derives from the store: ephemeral creates are
//! unique, and the election only relies on taking the maximum candidate LSN
//! rather than on event arrival order. Handlers run on the engine's own
//! event loop, fed by re-armed watch subscriptions, and are idempotent
//! because the store may redeliver events after reconnects.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::db::DbControl;
use crate::core::errors::{CmError, CmResult, absorb_exists};
use crate::core::events::StoreEvent;
use crate::core::metrics;
use crate::core::store::{ClusterPaths, CoordStore};
use crate::core::types::{AgentMode, Endpoint, Group};

/// Poll interval for short existence waits.
const SHORT_POLL: Duration = Duration::from_secs(1);

/// Poll interval of the DN group-discovery loop and the CN roster wait.
const DISCOVERY_POLL: Duration = Duration::from_secs(10);

/// Roster wait of a CN follower that may yet be pulled into the group.
const ROSTER_POLL: Duration = Duration::from_secs(30);

/// Picks the election winner: maximum LSN, ties broken by the
/// lexicographically smallest `ip:port`.
pub fn pick_winner(entries: &[(Endpoint, u64)]) -> Option<&Endpoint> {
    entries
        .iter()
        .max_by(|a, b| match a.1.cmp(&b.1) {
            // Reversed endpoint order so the smaller endpoint wins the tie.
            Ordering::Equal => b.0.to_string().cmp(&a.0.to_string()),
            ord => ord,
        })
        .map(|(ep, _)| ep)
}

struct Shared {
    mode: Mutex<AgentMode>,
    leader_endpoint: Mutex<Option<Endpoint>>,
    event_loop_armed: AtomicBool,
    replica_watch_armed: AtomicBool,
    supplement_watch_armed: AtomicBool,
}

/// Drives one agent's membership within its replication group.
pub struct MembershipEngine {
    cfg: Arc<Config>,
    is_cn: bool,
    store: Arc<dyn CoordStore>,
    db: Arc<dyn DbControl>,
    paths: ClusterPaths,
    group: Group,
    local: Endpoint,
    replica_tick_tx: mpsc::Sender<()>,
    supplement_tick_tx: mpsc::Sender<()>,
    shared: Shared,
}

impl MembershipEngine {
    /// Finds (or waits for) this node's group and builds the engine.
    ///
    /// A node listed in no roster enters the matching supplement pool and,
    /// for DNs, keeps cycling the groups until a roster change pulls it in.
    pub async fn join(
        cfg: Arc<Config>,
        is_cn: bool,
        store: Arc<dyn CoordStore>,
        db: Arc<dyn DbControl>,
        paths: ClusterPaths,
        replica_tick_tx: mpsc::Sender<()>,
        supplement_tick_tx: mpsc::Sender<()>,
    ) -> CmResult<Arc<Self>> {
        let local = cfg.local_endpoint();
        let group = find_group(&cfg, is_cn, store.as_ref(), db.as_ref(), &paths, &local).await?;
        info!("node {} joins group {}", cfg.host_node_name, group);
        Ok(Arc::new(Self {
            cfg,
            is_cn,
            store,
            db,
            paths,
            group,
            local,
            replica_tick_tx,
            supplement_tick_tx,
            shared: Shared {
                mode: Mutex::new(AgentMode::Joining),
                leader_endpoint: Mutex::new(None),
                event_loop_armed: AtomicBool::new(false),
                replica_watch_armed: AtomicBool::new(false),
                supplement_watch_armed: AtomicBool::new(false),
            },
        }))
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn mode(&self) -> AgentMode {
        *self.shared.mode.lock()
    }

    pub(crate) fn set_mode(&self, mode: AgentMode) {
        *self.shared.mode.lock() = mode;
    }

    /// Races for `leaders/<group>`. Returns whether this agent is primary.
    ///
    /// Post-bootstrap, only the recorded last leader re-claims leadership;
    /// it first waits (bounded) for its previous ephemeral node to expire,
    /// and arms the group watches beforehand so its own create event drives
    /// the primary startup sequence.
    pub async fn try_acquire_leadership(self: &Arc<Self>) -> CmResult<bool> {
        let leader_path = self.paths.leader(self.group);
        let last_leader_path = self.paths.last_leader(self.group);
        let node_info = self.local.to_string();

        if self.store.exists(&self.paths.ready()).await? {
            let last = self
                .store
                .get_string(&last_leader_path)
                .await
                .unwrap_or_default();
            if last != self.cfg.host_node_name {
                return Ok(false);
            }
            self.wait_leader_absent(&leader_path).await;
            self.spawn_event_loop().await?;
            match self
                .store
                .create(&leader_path, node_info.as_bytes(), true)
                .await
            {
                Ok(()) => {
                    self.record_last_leader(&last_leader_path).await;
                    *self.shared.leader_endpoint.lock() = Some(self.local.clone());
                    Ok(true)
                }
                Err(CmError::AlreadyExists(_)) => Ok(false),
                Err(e) => Err(e),
            }
        } else {
            if self.store.exists(&leader_path).await? {
                return Ok(false);
            }
            match self
                .store
                .create(&leader_path, node_info.as_bytes(), true)
                .await
            {
                Ok(()) => {
                    *self.shared.leader_endpoint.lock() = Some(self.local.clone());
                    if self.is_cn {
                        self.init_cluster_layout().await?;
                    }
                    self.record_last_leader(&last_leader_path).await;
                    Ok(true)
                }
                Err(CmError::AlreadyExists(_)) => Ok(false),
                Err(e) => {
                    error!("failed to take group leadership: {}", e);
                    Ok(false)
                }
            }
        }
    }

    /// Waits for the previous leader's ephemeral node to expire, bounded by
    /// twice the session timeout.
    async fn wait_leader_absent(&self, leader_path: &str) {
        let deadline = self.cfg.session_timeout * 2;
        let wait = async {
            loop {
                match self.store.exists(leader_path).await {
                    Ok(false) => return,
                    _ => tokio::time::sleep(SHORT_POLL).await,
                }
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!("previous leader node still present after {:?}", deadline);
        }
    }

    async fn record_last_leader(&self, last_leader_path: &str) {
        let name = self.cfg.host_node_name.as_bytes();
        let res = match self.store.set_data(last_leader_path, name).await {
            Err(CmError::NoNode(_)) => self.store.create(last_leader_path, name, false).await,
            other => other,
        };
        if let Err(e) = res {
            error!("failed to record last leader: {}", e);
        }
    }

    /// Creates the shared cluster layout on first CN leadership.
    async fn init_cluster_layout(&self) -> CmResult<()> {
        if self.store.exists(&self.paths.clusters_dir()).await? {
            return Ok(());
        }
        self.store.ensure(&self.paths.clusters_dir()).await?;
        self.store.ensure(&self.paths.supplement_dir(true)).await?;
        self.store.ensure(&self.paths.supplement_dir(false)).await?;
        self.store.ensure(&self.paths.need_supplement_dir()).await?;
        self.ensure_group_tree(Group::Cn).await?;
        self.store.ensure(&self.paths.store_node_dir()).await?;
        self.store.ensure(&self.paths.store_node_members()).await?;
        absorb_exists(
            self.store
                .create(&self.paths.store_node_status(), b"0", false)
                .await,
        )?;
        Ok(())
    }

    /// Creates one group's subtree (idempotent).
    pub async fn ensure_group_tree(&self, group: Group) -> CmResult<()> {
        self.store.ensure(&self.paths.group_dir(group)).await?;
        self.store.ensure(&self.paths.last_leader(group)).await?;
        self.store.ensure(&self.paths.host_nodes_dir(group)).await?;
        self.store.ensure(&self.paths.replicas_dir(group)).await?;
        self.store.ensure(&self.paths.membership_dir(group)).await?;
        self.store.ensure(&self.paths.candidates_dir(group)).await?;
        Ok(())
    }

    /// The follower join path: wait for a roster slot, sync the local
    /// database against the current primary, then advertise the replica.
    pub async fn join_as_replica(self: &Arc<Self>) -> CmResult<()> {
        if self.is_cn {
            self.wait_cn_roster_slot().await?;
        }

        let leader_path = self.paths.leader(self.group);
        while !self.store.exists(&leader_path).await? {
            tokio::time::sleep(SHORT_POLL).await;
        }
        let leader: Endpoint = self.store.get_string(&leader_path).await?.parse()?;
        *self.shared.leader_endpoint.lock() = Some(leader.clone());

        if self.store.exists(&self.paths.ready()).await? {
            self.sync_against_leader(&leader).await?;
        } else {
            // Cold start: the follower's data directory predates the
            // cluster, rebuild it outright.
            self.db.demote_by_basebackup(&leader, &self.local).await?;
        }

        absorb_exists(
            self.store
                .create(&self.paths.replica(self.group, &self.local), &[], true)
                .await,
        )?;
        self.spawn_event_loop().await?;
        self.set_mode(AgentMode::Follower);
        Ok(())
    }

    /// Waits until this CN appears in the group roster, parking in the
    /// supplement pool while the roster is full.
    async fn wait_cn_roster_slot(&self) -> CmResult<()> {
        let host_nodes_dir = self.paths.host_nodes_dir(self.group);
        loop {
            if !self.store.exists(&host_nodes_dir).await? {
                tokio::time::sleep(SHORT_POLL).await;
                continue;
            }
            let hosts = self.store.children(&host_nodes_dir).await?;
            if hosts.contains(&self.cfg.host_node_name) {
                info!(
                    "node {} is in the group roster, writing the replica",
                    self.cfg.host_node_name
                );
                return Ok(());
            }
            if hosts.len() == self.cfg.group_size() {
                let supplement = self.paths.supplement(true, &self.cfg.host_node_name);
                if !self.store.exists(&supplement).await? {
                    absorb_exists(self.store.create(&supplement, &[], true).await)?;
                    info!(
                        "node {} is not in any group, entering the supplement pool",
                        self.cfg.host_node_name
                    );
                    if let Err(e) = self.db.stop_replication(&self.local).await {
                        error!("failed to stop the replication: {}", e);
                    }
                }
            }
            tokio::time::sleep(ROSTER_POLL).await;
        }
    }

    /// Brings the local database in line with the current primary on a
    /// post-bootstrap start.
    async fn sync_against_leader(&self, leader: &Endpoint) -> CmResult<()> {
        let host_path = self.paths.host_node(self.group, &self.cfg.host_node_name);
        let member_path = self.paths.member(self.group, &self.cfg.host_node_name);
        if !self.store.exists(&host_path).await? {
            return Ok(());
        }
        let flag = self.store.get_string(&host_path).await.unwrap_or_default();
        if flag == "new" {
            // Fresh supplement: the old data directory is unrelated.
            info!("node {} joins as a new member", self.cfg.host_node_name);
            self.db.demote_by_basebackup(leader, &self.local).await?;
            self.store.set_data(&host_path, b"").await?;
            absorb_exists(self.store.create(&member_path, &[], false).await)?;
        } else if !self.db.is_standby().await {
            // Deposed primary: membership is void while the demote runs.
            self.store.delete_quiet(&member_path).await?;
            self.db.demote(leader, &self.local).await?;
            absorb_exists(self.store.create(&member_path, &[], false).await)?;
        } else {
            self.db.change_following_leader(leader, &self.local).await?;
        }
        Ok(())
    }

    /// Arms the leader and candidates watches and spawns the event loop.
    /// Idempotent; every join path ends up here exactly once.
    pub async fn spawn_event_loop(self: &Arc<Self>) -> CmResult<()> {
        if self
            .shared
            .event_loop_armed
            .swap(true, AtomicOrdering::SeqCst)
        {
            return Ok(());
        }
        let mut leader_sub = self.store.watch_data(&self.paths.leader(self.group)).await?;
        let mut candidates_sub = self
            .store
            .watch_children(&self.paths.candidates_dir(self.group))
            .await?;
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = leader_sub.recv() => match ev {
                        Some(StoreEvent::Deleted) => engine.on_leader_lost().await,
                        Some(StoreEvent::Created) => engine.on_leader_established().await,
                        Some(_) => {}
                        None => return,
                    },
                    ev = candidates_sub.recv() => match ev {
                        Some(StoreEvent::ChildrenChanged(candidates)) => {
                            engine.on_candidates_changed(candidates).await;
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        });
        Ok(())
    }

    /// Leader gone: healthy members post their last-received LSN as a
    /// candidate.
    async fn on_leader_lost(&self) {
        info!("leader of group {} lost", self.group);
        if !self.db.is_standby().await || !self.is_in_membership().await {
            info!("node is not in the membership, sitting out the election");
            return;
        }
        self.set_mode(AgentMode::Electing);
        match self.db.stop_replication(&self.local).await {
            Ok(()) => info!("stopped the replication for the election"),
            Err(e) => error!("failed to stop the replication: {}", e),
        }
        let lsn = self.db.get_lsn(&self.local).await;
        let candidate_path = self.paths.candidate(self.group, &self.local);
        if let Err(e) = self
            .store
            .create_or_set(&candidate_path, lsn.to_string().as_bytes())
            .await
        {
            error!("failed to post candidate lsn: {}", e);
        }
    }

    /// Candidate set complete: the holder of the maximum LSN claims the
    /// leader node.
    async fn on_candidates_changed(&self, candidates: Vec<String>) {
        info!(
            "group {} has {} election candidates",
            self.group,
            candidates.len()
        );
        if self.cfg.replica_server_num == 0 || candidates.len() < self.cfg.replica_server_num {
            return;
        }

        let mut entries = Vec::with_capacity(candidates.len());
        for name in &candidates {
            let Ok(endpoint) = name.parse::<Endpoint>() else {
                continue;
            };
            let path = format!("{}/{}", self.paths.candidates_dir(self.group), name);
            match self.store.get_string(&path).await {
                Ok(raw) => entries.push((endpoint, raw.parse().unwrap_or(0))),
                // A concurrent winner may already be clearing the set.
                Err(_) => continue,
            }
        }
        let Some(winner) = pick_winner(&entries) else {
            return;
        };
        if *winner != self.local {
            return;
        }

        let leader_path = self.paths.leader(self.group);
        match self
            .store
            .create(&leader_path, self.local.to_string().as_bytes(), true)
            .await
        {
            Ok(()) => {
                metrics::ELECTIONS_WON_TOTAL.inc();
                self.record_last_leader(&self.paths.last_leader(self.group))
                    .await;
                let _ = self
                    .store
                    .delete_quiet(&self.paths.replica(self.group, &self.local))
                    .await;
            }
            Err(CmError::AlreadyExists(_)) => {}
            Err(e) => error!("failed to claim group leadership: {}", e),
        }
        for name in &candidates {
            let path = format!("{}/{}", self.paths.candidates_dir(self.group), name);
            let _ = self.store.delete_quiet(&path).await;
        }
    }

    /// New leader advertised: everyone reconciles against it.
    async fn on_leader_established(&self) {
        let leader_path = self.paths.leader(self.group);
        let Ok(raw) = self.store.get_string(&leader_path).await else {
            // Gone again already; the delete event will follow.
            return;
        };
        let Ok(leader) = raw.parse::<Endpoint>() else {
            error!("leader node of group {} holds garbage: {}", self.group, raw);
            return;
        };

        if let Ok(stale) = self.store.children(&self.paths.candidates_dir(self.group)).await {
            for name in stale {
                let path = format!("{}/{}", self.paths.candidates_dir(self.group), name);
                let _ = self.store.delete_quiet(&path).await;
            }
        }
        let _ = self
            .store
            .delete_quiet(&self.paths.replica(self.group, &leader))
            .await;

        *self.shared.leader_endpoint.lock() = Some(leader.clone());
        info!("the leader of group {} is {}", self.group, leader);

        if leader == self.local {
            self.become_primary().await;
        } else {
            self.follow_new_leader(&leader).await;
        }
    }

    /// Primary startup: arm the reconciliation watches, promote the local
    /// instance if needed, then publish this group's new endpoint.
    async fn become_primary(&self) {
        self.set_mode(AgentMode::Primary);
        if let Err(e) = self.arm_primary_watches().await {
            error!("failed to arm primary watches: {}", e);
        }
        if self.db.is_standby().await
            && let Err(e) = self.db.promote(&self.local).await
        {
            error!("promote failed: {}", e);
        }

        loop {
            info!("--update background service--");
            if self.db.start_background_service(&self.local).await.is_ok() {
                break;
            }
            tokio::time::sleep(SHORT_POLL).await;
        }
        info!("--update background service successfully--");

        loop {
            let cn_leader = self.wait_cn_leader().await;
            info!("--update the node table--");
            let updated = self
                .db
                .update_foreign_server(&cn_leader, self.group.id(), &self.local)
                .await;
            if let Err(e) = self.db.reload_foreign_server_cache(&cn_leader).await {
                warn!("failed to reload foreign server cache: {}", e);
            }
            match updated {
                Ok(()) => break,
                // The CN primary may be failing over underneath us;
                // re-read its leader node and try again.
                Err(e) => {
                    warn!("failed to update the node table: {}", e);
                    tokio::time::sleep(SHORT_POLL).await;
                }
            }
        }
        info!("--update the node table successfully--");
    }

    /// Follower reconciliation against a newly established leader.
    async fn follow_new_leader(&self, leader: &Endpoint) {
        let member_path = self.paths.member(self.group, &self.cfg.host_node_name);
        if self.db.is_standby().await {
            if let Err(e) = self.db.change_following_leader(leader, &self.local).await {
                error!("failed to follow the new leader: {}", e);
            }
        } else {
            let _ = self.store.delete_quiet(&member_path).await;
            match self.db.demote(leader, &self.local).await {
                Ok(()) => {
                    if let Err(e) =
                        absorb_exists(self.store.create(&member_path, &[], false).await)
                    {
                        error!("failed to restore membership: {}", e);
                    }
                }
                Err(e) => error!("demote failed: {}", e),
            }
        }
        self.set_mode(AgentMode::Follower);
    }

    /// Arms the replica watch (every primary) and the supplement watch (CN
    /// primary only), forwarding ticks to the worker channels. Idempotent.
    pub async fn arm_primary_watches(&self) -> CmResult<()> {
        if !self
            .shared
            .replica_watch_armed
            .swap(true, AtomicOrdering::SeqCst)
        {
            let mut sub = self
                .store
                .watch_children(&self.paths.replicas_dir(self.group))
                .await?;
            let tx = self.replica_tick_tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = sub.recv().await {
                    if matches!(ev, StoreEvent::ChildrenChanged(_)) {
                        let _ = tx.try_send(());
                    }
                }
            });
        }
        if self.is_cn
            && !self
                .shared
                .supplement_watch_armed
                .swap(true, AtomicOrdering::SeqCst)
        {
            let mut sub = self
                .store
                .watch_children(&self.paths.need_supplement_dir())
                .await?;
            let tx = self.supplement_tick_tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = sub.recv().await {
                    if matches!(ev, StoreEvent::ChildrenChanged(_)) {
                        let _ = tx.try_send(());
                    }
                }
            });
        }
        Ok(())
    }

    /// Blocks until every standby of this group streams and advertises
    /// itself. Pre-bootstrap leaders run this before serving.
    pub async fn wait_group_replicas_ready(&self) -> CmResult<()> {
        let replicas_dir = self.paths.replicas_dir(self.group);
        loop {
            match self.store.children(&replicas_dir).await {
                Ok(replicas) if replicas.len() >= self.cfg.replica_server_num => return Ok(()),
                Ok(_) | Err(CmError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(SHORT_POLL).await;
        }
    }

    async fn is_in_membership(&self) -> bool {
        self.store
            .exists(&self.paths.member(self.group, &self.cfg.host_node_name))
            .await
            .unwrap_or(false)
    }

    /// Reads the CN leader endpoint, waiting for one to exist.
    pub async fn wait_cn_leader(&self) -> Endpoint {
        let cn_leader_path = self.paths.leader(Group::Cn);
        loop {
            if let Ok(raw) = self.store.get_string(&cn_leader_path).await
                && let Ok(endpoint) = raw.parse()
            {
                return endpoint;
            }
            tokio::time::sleep(SHORT_POLL).await;
        }
    }
}

/// Locates this node's group, entering the supplement pool when no roster
/// lists it.
async fn find_group(
    cfg: &Config,
    is_cn: bool,
    store: &dyn CoordStore,
    db: &dyn DbControl,
    paths: &ClusterPaths,
    local: &Endpoint,
) -> CmResult<Group> {
    let mut found = None;
    if store.exists(&paths.ready()).await? {
        for cluster in store.children(&paths.clusters_dir()).await? {
            let Some(group) = Group::parse(&cluster) else {
                continue;
            };
            if group.is_cn() != is_cn {
                continue;
            }
            let hosts = store
                .children(&paths.host_nodes_dir(group))
                .await
                .unwrap_or_default();
            if hosts.contains(&cfg.host_node_name) {
                found = Some(group);
                break;
            }
        }
        if found.is_none() {
            enter_supplement_pool(cfg, is_cn, store, db, paths, local).await?;
        }
    }

    if is_cn {
        // CNs default to the one coordinator group; a pooled CN still
        // belongs to it for the later roster wait.
        return Ok(found.unwrap_or(Group::Cn));
    }
    if let Some(group) = found {
        return Ok(group);
    }

    // DN discovery: cycle the data-node groups until one lists this node.
    let dn_group_count = (cfg.dn_num - cfg.dn_supplement_num) / 3;
    let mut full_groups: HashSet<String> = HashSet::new();
    loop {
        if !store.exists(&paths.clusters_dir()).await? {
            tokio::time::sleep(SHORT_POLL).await;
            continue;
        }
        for cluster in store.children(&paths.clusters_dir()).await? {
            let Some(group) = Group::parse(&cluster) else {
                continue;
            };
            if group.is_cn() || full_groups.contains(&cluster) {
                continue;
            }
            let hosts = store
                .children(&paths.host_nodes_dir(group))
                .await
                .unwrap_or_default();
            if hosts.contains(&cfg.host_node_name) {
                return Ok(group);
            }
            if hosts.len() == cfg.group_size() {
                full_groups.insert(cluster);
            }
        }
        if !full_groups.is_empty() && full_groups.len() == dn_group_count {
            full_groups.clear();
            if !store
                .exists(&paths.supplement(false, &cfg.host_node_name))
                .await?
            {
                enter_supplement_pool(cfg, is_cn, store, db, paths, local).await?;
            }
        }
        tokio::time::sleep(DISCOVERY_POLL).await;
    }
}

async fn enter_supplement_pool(
    cfg: &Config,
    is_cn: bool,
    store: &dyn CoordStore,
    db: &dyn DbControl,
    paths: &ClusterPaths,
    local: &Endpoint,
) -> CmResult<()> {
    absorb_exists(
        store
            .create(&paths.supplement(is_cn, &cfg.host_node_name), &[], true)
            .await,
    )?;
    info!(
        "node {} is not in any group, entering the supplement pool",
        cfg.host_node_name
    );
    if let Err(e) = db.stop_replication(local).await {
        error!("failed to stop the replication: {}", e);
    }
    Ok(())
}
