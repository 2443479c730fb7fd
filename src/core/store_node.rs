// src/core/store_node.rs

//! Storage-tier readiness gate.
//!
//! When the deployment ships the storage tier (`has_falcon_stor`), the
//! agent waits for at least one storage node to register under
//! `StoreNode/Nodes`, gives the tier a grace period to settle, then flips
//! `storeNodeStatus` so dependents can proceed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::errors::CmResult;
use crate::core::events::StoreEvent;
use crate::core::store::{ClusterPaths, CoordStore};

/// Settle time between the first registration and the status flip.
const SETTLE_DELAY: Duration = Duration::from_secs(30);

pub struct StoreNodeGate {
    store: Arc<dyn CoordStore>,
    paths: ClusterPaths,
}

impl StoreNodeGate {
    pub fn new(store: Arc<dyn CoordStore>, paths: ClusterPaths) -> Self {
        Self { store, paths }
    }

    /// Blocks until the storage tier has registered, then marks it ready.
    pub async fn run(&self) -> CmResult<()> {
        info!("waiting for the storage tier to register");
        let mut sub = self
            .store
            .watch_children(&self.paths.store_node_members())
            .await?;
        loop {
            match sub.recv().await {
                Some(StoreEvent::ChildrenChanged(nodes)) if !nodes.is_empty() => break,
                Some(_) => {}
                None => return Ok(()),
            }
        }
        tokio::time::sleep(SETTLE_DELAY).await;
        if let Err(e) = self
            .store
            .set_data(&self.paths.store_node_status(), b"1")
            .await
        {
            warn!("failed to mark the storage tier ready: {}", e);
        } else {
            info!("storage tier is ready");
        }
        Ok(())
    }
}
