// src/core/store/memory.rs

//! In-process implementation of the coordination-store gateway.
//!
//! Backs the test suite: it models sessions, ephemeral-node ownership, and
//! watch delivery closely enough to drive the full membership protocol
//! without a real store. `expire_session` injects the session-loss fault;
//! `poke_children` redelivers a children event to exercise consumer
//! idempotency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::core::errors::{CmError, CmResult};
use crate::core::events::{SessionEvent, StoreEvent, WatchSubscription};
use crate::core::store::CoordStore;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Data,
    Children,
}

struct WatchEntry {
    path: String,
    kind: WatchKind,
    tx: mpsc::Sender<StoreEvent>,
}

struct Inner {
    nodes: Mutex<BTreeMap<String, Node>>,
    watches: Mutex<Vec<WatchEntry>>,
    sessions: Mutex<HashMap<u64, broadcast::Sender<SessionEvent>>>,
    expired: Mutex<HashSet<u64>>,
    next_session: AtomicU64,
}

/// The shared store; hand out per-agent handles with [`MemoryStore::session`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                watches: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                expired: Mutex::new(HashSet::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a new session handle. Each handle owns its ephemeral nodes.
    pub fn session(&self) -> MemorySession {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(4);
        self.inner.sessions.lock().insert(id, tx.clone());
        MemorySession {
            id,
            inner: self.inner.clone(),
            session_tx: tx,
        }
    }

    /// Expires one session: its ephemeral nodes vanish (firing watches) and
    /// its session subscribers observe `Expired`.
    pub fn expire_session(&self, session: &MemorySession) {
        self.inner.expired.lock().insert(session.id);
        let owned: Vec<String> = {
            let nodes = self.inner.nodes.lock();
            nodes
                .iter()
                .filter(|(_, n)| n.ephemeral_owner == Some(session.id))
                .map(|(p, _)| p.clone())
                .collect()
        };
        for path in owned {
            self.inner.nodes.lock().remove(&path);
            self.inner.notify_data(&path, StoreEvent::Deleted);
            self.inner.notify_children(&parent_of(&path));
        }
        let _ = session.session_tx.send(SessionEvent::Expired);
    }

    /// Redelivers the current child list to every children watcher of
    /// `path`, as a reconnecting store would.
    pub fn poke_children(&self, path: &str) {
        self.inner.notify_children(path);
    }
}

impl Inner {
    fn children_of(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        let prefix = format!("{dir}/");
        nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn notify_data(&self, path: &str, ev: StoreEvent) {
        let mut watches = self.watches.lock();
        watches.retain(|w| !w.tx.is_closed());
        for w in watches.iter() {
            if w.kind == WatchKind::Data && w.path == path {
                let _ = w.tx.try_send(ev.clone());
            }
        }
    }

    fn notify_children(&self, dir: &str) {
        if dir.is_empty() {
            return;
        }
        let listing = Self::children_of(&self.nodes.lock(), dir);
        let mut watches = self.watches.lock();
        watches.retain(|w| !w.tx.is_closed());
        for w in watches.iter() {
            if w.kind == WatchKind::Children && w.path == dir {
                let _ = w.tx.try_send(StoreEvent::ChildrenChanged(listing.clone()));
            }
        }
    }
}

/// One agent's handle onto the shared [`MemoryStore`].
#[derive(Clone)]
pub struct MemorySession {
    id: u64,
    inner: Arc<Inner>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    fn check_alive(&self) -> CmResult<()> {
        if self.inner.expired.lock().contains(&self.id) {
            return Err(CmError::SessionLost);
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl CoordStore for MemorySession {
    async fn create(&self, path: &str, value: &[u8], ephemeral: bool) -> CmResult<()> {
        self.check_alive()?;
        {
            let mut nodes = self.inner.nodes.lock();
            let parent = parent_of(path);
            if !parent.is_empty() && !nodes.contains_key(&parent) {
                return Err(CmError::NoNode(parent));
            }
            if nodes.contains_key(path) {
                return Err(CmError::AlreadyExists(path.to_string()));
            }
            nodes.insert(
                path.to_string(),
                Node {
                    data: value.to_vec(),
                    ephemeral_owner: ephemeral.then_some(self.id),
                },
            );
        }
        self.inner.notify_data(path, StoreEvent::Created);
        self.inner.notify_children(&parent_of(path));
        Ok(())
    }

    async fn set_data(&self, path: &str, value: &[u8]) -> CmResult<()> {
        self.check_alive()?;
        {
            let mut nodes = self.inner.nodes.lock();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| CmError::NoNode(path.to_string()))?;
            node.data = value.to_vec();
        }
        self.inner.notify_data(path, StoreEvent::DataChanged);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> CmResult<Vec<u8>> {
        self.check_alive()?;
        let nodes = self.inner.nodes.lock();
        nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CmError::NoNode(path.to_string()))
    }

    async fn delete(&self, path: &str) -> CmResult<()> {
        self.check_alive()?;
        {
            let mut nodes = self.inner.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(CmError::NoNode(path.to_string()));
            }
            if !Inner::children_of(&nodes, path).is_empty() {
                return Err(CmError::Store(format!("node has children: {path}")));
            }
            nodes.remove(path);
        }
        self.inner.notify_data(path, StoreEvent::Deleted);
        self.inner.notify_children(&parent_of(path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> CmResult<bool> {
        self.check_alive()?;
        Ok(self.inner.nodes.lock().contains_key(path))
    }

    async fn children(&self, path: &str) -> CmResult<Vec<String>> {
        self.check_alive()?;
        let nodes = self.inner.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(CmError::NoNode(path.to_string()));
        }
        Ok(Inner::children_of(&nodes, path))
    }

    async fn watch_data(&self, path: &str) -> CmResult<WatchSubscription> {
        self.check_alive()?;
        let (tx, sub) = WatchSubscription::channel();
        self.inner.watches.lock().push(WatchEntry {
            path: path.to_string(),
            kind: WatchKind::Data,
            tx,
        });
        Ok(sub)
    }

    async fn watch_children(&self, path: &str) -> CmResult<WatchSubscription> {
        self.check_alive()?;
        let (tx, sub) = WatchSubscription::channel();
        let initial = {
            let nodes = self.inner.nodes.lock();
            nodes
                .contains_key(path)
                .then(|| Inner::children_of(&nodes, path))
        };
        if let Some(listing) = initial {
            let _ = tx.try_send(StoreEvent::ChildrenChanged(listing));
        }
        self.inner.watches.lock().push(WatchEntry {
            path: path.to_string(),
            kind: WatchKind::Children,
            tx,
        });
        Ok(sub)
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }
}
