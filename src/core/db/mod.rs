// src/core/db/mod.rs

//! Database-side control: role transitions, replication plumbing, and the
//! foreign-server catalog calls.
//!
//! [`DbControl`] is the seam between the membership protocol and the
//! database; [`postgres::PgControl`] is the production implementation. The
//! test suite substitutes a scripted fake to drive elections without a
//! database.

pub mod liveness;
pub mod lsn;
pub mod postgres;

use async_trait::async_trait;

use crate::core::errors::CmResult;
use crate::core::types::Endpoint;

/// One row of `pg_stat_replication`, as the health reporter consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRow {
    pub client_addr: String,
    pub state: String,
    pub sync_state: String,
}

/// One row of the foreign-server catalog on a CN primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignServerRow {
    pub server_name: String,
    pub host: String,
}

/// Every database operation the agent performs, local or remote.
///
/// Implementations must be idempotent where the underlying operation allows
/// it; the membership engine retries whole sequences rather than tracking
/// partial progress.
#[async_trait]
pub trait DbControl: Send + Sync + 'static {
    // --- Local role control ---

    /// Whether the local data directory carries `standby.signal`.
    async fn is_standby(&self) -> bool;

    /// The last WAL position received locally, `0` if unknown.
    async fn get_lsn(&self, local: &Endpoint) -> u64;

    /// Promotes the local standby to primary.
    async fn promote(&self, local: &Endpoint) -> CmResult<()>;

    /// Demotes the local primary to a standby of `leader`: rewind first,
    /// base backup if the WAL receiver does not come up.
    async fn demote(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()>;

    /// Rebuilds the local instance from a full base backup of `leader` and
    /// blocks until the WAL receiver streams.
    async fn demote_by_basebackup(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()>;

    /// Re-points a running standby at a new primary, falling back to a base
    /// backup if it cannot catch up.
    async fn change_following_leader(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()>;

    /// Blanks the replication source, severing the node from its old
    /// primary.
    async fn stop_replication(&self, local: &Endpoint) -> CmResult<()>;

    /// Immediate stop of the local database. Used on session loss; never
    /// fails, never retries.
    async fn hard_stop(&self);

    // --- Remote catalog and service control ---

    async fn update_foreign_server(
        &self,
        cn: &Endpoint,
        group_id: u32,
        primary: &Endpoint,
    ) -> CmResult<()>;

    async fn reload_foreign_server_cache(&self, cn: &Endpoint) -> CmResult<()>;

    async fn start_background_service(&self, ep: &Endpoint) -> CmResult<()>;

    async fn create_extension(&self, ep: &Endpoint) -> CmResult<()>;

    async fn insert_foreign_server(
        &self,
        ep: &Endpoint,
        group_id: u32,
        group_name: &str,
        primary: &Endpoint,
        is_local: bool,
    ) -> CmResult<()>;

    async fn build_shard_table(&self, ep: &Endpoint, shard_count: u32) -> CmResult<()>;

    async fn create_distributed_data_table(&self, ep: &Endpoint) -> CmResult<()>;

    async fn plain_mkdir_root(&self, cn: &Endpoint) -> CmResult<()>;

    async fn stat_replication(&self, ep: &Endpoint) -> CmResult<Vec<ReplicationRow>>;

    async fn foreign_servers(&self, cn: &Endpoint) -> CmResult<Vec<ForeignServerRow>>;
}
