// src/core/store/zk.rs

//! ZooKeeper-backed implementation of the coordination-store gateway.
//!
//! Watches in ZooKeeper are one-shot; each subscription here owns a small
//! task that re-arms the watch after every delivery and forwards mapped
//! events into the subscription channel. Session expiry is surfaced on a
//! broadcast channel that the agent's session guard consumes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use zookeeper_client as zk;

use crate::core::errors::{CmError, CmResult};
use crate::core::events::{SessionEvent, StoreEvent, WatchSubscription};
use crate::core::store::CoordStore;

/// Capacity of the session broadcast channel; a single event matters.
const SESSION_CHANNEL_CAPACITY: usize = 4;

/// Delay before re-trying a watch on a path that does not exist yet.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ZkStore {
    client: zk::Client,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl ZkStore {
    /// Connects to the store and spawns the session monitor.
    pub async fn connect(endpoints: &str, session_timeout: Duration) -> CmResult<Self> {
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(endpoints)
            .await
            .map_err(|e| CmError::Store(format!("failed to connect to {endpoints}: {e}")))?;

        let (session_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        let mut state_watcher = client.state_watcher();
        let tx = session_tx.clone();
        tokio::spawn(async move {
            loop {
                let state = state_watcher.changed().await;
                debug!("store session state changed: {:?}", state);
                if state.is_terminated() {
                    let _ = tx.send(SessionEvent::Expired);
                    return;
                }
            }
        });

        Ok(Self { client, session_tx })
    }

    fn map_err(path: &str, err: zk::Error) -> CmError {
        match err {
            zk::Error::NodeExists => CmError::AlreadyExists(path.to_string()),
            zk::Error::NoNode => CmError::NoNode(path.to_string()),
            zk::Error::SessionExpired | zk::Error::SessionMoved => CmError::SessionLost,
            other => CmError::Store(format!("{path}: {other}")),
        }
    }
}

#[async_trait]
impl CoordStore for ZkStore {
    async fn create(&self, path: &str, value: &[u8], ephemeral: bool) -> CmResult<()> {
        let mode = if ephemeral {
            zk::CreateMode::Ephemeral
        } else {
            zk::CreateMode::Persistent
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        self.client
            .create(path, value, &options)
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(path, e))
    }

    async fn set_data(&self, path: &str, value: &[u8]) -> CmResult<()> {
        self.client
            .set_data(path, value, None)
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(path, e))
    }

    async fn get_data(&self, path: &str) -> CmResult<Vec<u8>> {
        self.client
            .get_data(path)
            .await
            .map(|(data, _)| data)
            .map_err(|e| Self::map_err(path, e))
    }

    async fn delete(&self, path: &str) -> CmResult<()> {
        self.client
            .delete(path, None)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn exists(&self, path: &str) -> CmResult<bool> {
        self.client
            .check_stat(path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|e| Self::map_err(path, e))
    }

    async fn children(&self, path: &str) -> CmResult<Vec<String>> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn watch_data(&self, path: &str) -> CmResult<WatchSubscription> {
        let (tx, sub) = WatchSubscription::channel();
        let client = self.client.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                let watcher = match client.check_and_watch_stat(&path).await {
                    Ok((_, watcher)) => watcher,
                    Err(e) => {
                        warn!("data watch on {} failed to arm: {}", path, e);
                        return;
                    }
                };
                let event = watcher.changed().await;
                let mapped = match event.event_type {
                    zk::EventType::NodeCreated => Some(StoreEvent::Created),
                    zk::EventType::NodeDeleted => Some(StoreEvent::Deleted),
                    zk::EventType::NodeDataChanged => Some(StoreEvent::DataChanged),
                    zk::EventType::Session => return,
                    _ => None,
                };
                if let Some(ev) = mapped
                    && tx.send(ev).await.is_err()
                {
                    return;
                }
            }
        });
        Ok(sub)
    }

    async fn watch_children(&self, path: &str) -> CmResult<WatchSubscription> {
        let (tx, sub) = WatchSubscription::channel();
        let client = self.client.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                let (children, _, watcher) = match client.get_and_watch_children(&path).await {
                    Ok(armed) => armed,
                    Err(zk::Error::NoNode) => {
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("children watch on {} failed to arm: {}", path, e);
                        return;
                    }
                };
                // Each re-arm observes the post-event child list, so every
                // delivery carries current state.
                if tx.send(StoreEvent::ChildrenChanged(children)).await.is_err() {
                    return;
                }
                let event = watcher.changed().await;
                if event.event_type == zk::EventType::Session {
                    return;
                }
            }
        });
        Ok(sub)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}
