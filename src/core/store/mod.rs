// src/core/store/mod.rs

//! The coordination-store gateway.
//!
//! Everything the agents agree on lives in a ZooKeeper-like hierarchical
//! store: ephemeral presence nodes, per-group leader nodes, rosters, and
//! election candidates. [`CoordStore`] is the thin typed contract the rest
//! of the agent programs against; [`zk::ZkStore`] is the production
//! implementation and [`memory::MemoryStore`] backs the test suite with
//! fault injection (session expiry, event redelivery).

pub mod memory;
pub mod paths;
pub mod zk;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::errors::{CmError, CmResult, absorb_exists, absorb_no_node};
use crate::core::events::{SessionEvent, WatchSubscription};

pub use paths::ClusterPaths;

/// Typed access to the coordination store.
///
/// Watch semantics: the store's watches are one-shot, but both
/// implementations re-arm transparently — a [`WatchSubscription`] keeps
/// delivering until dropped. Children watches deliver the current child
/// list immediately on registration; data watches deliver transitions only.
/// Events may be redelivered after reconnects, so consumers must be
/// idempotent.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Creates a node. The parent must already exist.
    async fn create(&self, path: &str, value: &[u8], ephemeral: bool) -> CmResult<()>;

    /// Overwrites the data of an existing node.
    async fn set_data(&self, path: &str, value: &[u8]) -> CmResult<()>;

    /// Reads the data of a node.
    async fn get_data(&self, path: &str) -> CmResult<Vec<u8>>;

    /// Deletes a node. Fails with `NoNode` if absent.
    async fn delete(&self, path: &str) -> CmResult<()>;

    async fn exists(&self, path: &str) -> CmResult<bool>;

    /// Lists the direct children of a node (names, not full paths).
    async fn children(&self, path: &str) -> CmResult<Vec<String>>;

    /// Watches a single node for create/delete/data-change transitions.
    async fn watch_data(&self, path: &str) -> CmResult<WatchSubscription>;

    /// Watches a node's child set; the current list is delivered first.
    async fn watch_children(&self, path: &str) -> CmResult<WatchSubscription>;

    /// Subscribes to session-liveness events. Session loss is fatal to
    /// agent correctness; the subscriber hard-stops the local database.
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;

    // --- Convenience wrappers over the race-prone primitives ---

    /// Creates a persistent node if absent, absorbing a lost race.
    async fn ensure(&self, path: &str) -> CmResult<()> {
        absorb_exists(self.create(path, &[], false).await)
    }

    /// Best-effort delete, absorbing `NoNode`.
    async fn delete_quiet(&self, path: &str) -> CmResult<()> {
        absorb_no_node(self.delete(path).await)
    }

    /// Reads a node's data as UTF-8.
    async fn get_string(&self, path: &str) -> CmResult<String> {
        let raw = self.get_data(path).await?;
        String::from_utf8(raw).map_err(|e| CmError::Store(format!("non-utf8 data at {path}: {e}")))
    }

    /// Creates the node with the given value, or overwrites it if it
    /// already exists.
    async fn create_or_set(&self, path: &str, value: &[u8]) -> CmResult<()> {
        match self.create(path, value, false).await {
            Err(CmError::AlreadyExists(_)) => self.set_data(path, value).await,
            other => other,
        }
    }
}
