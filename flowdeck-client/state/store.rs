use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{RwLock, watch};

use super::repository::NodeStateRepository;
use super::{NodeState, Phase};

/// One node's state plus the revision counter views subscribe to.
struct NodeSlot {
    state: Mutex<NodeState>,
    revision: watch::Sender<u64>,
}

impl NodeSlot {
    fn new(state: NodeState) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(state),
            revision,
        })
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct StoreInner {
    nodes: RwLock<HashMap<String, Arc<NodeSlot>>>,
    repo: Option<Arc<dyn NodeStateRepository>>,
    log_capacity: usize,
    save_debounce: Duration,
    /// Node ids with a flush already scheduled.
    pending_saves: Mutex<HashSet<String>>,
}

/// Process-wide keyed store of node state. Cloning shares the same store.
#[derive(Clone)]
pub struct NodeStateStore {
    inner: Arc<StoreInner>,
}

impl NodeStateStore {
    /// A store without persistence; `save` is a no-op.
    pub fn in_memory(log_capacity: usize) -> Self {
        Self::build(None, log_capacity, Duration::ZERO)
    }

    /// Open a persistent store, hydrating every saved node before returning.
    pub async fn open(
        repo: Arc<dyn NodeStateRepository>,
        log_capacity: usize,
        save_debounce: Duration,
    ) -> Result<Self> {
        let store = Self::build(Some(repo.clone()), log_capacity, save_debounce);

        let loaded = repo.load_all().await?;
        let mut nodes = store.inner.nodes.write().await;
        for (node_id, mut state) in loaded {
            state.logs.set_capacity(log_capacity);
            if state.phase == Phase::Running {
                // The task belonged to a previous process; nothing will resolve it.
                let task = state.task_id.take().unwrap_or_default();
                state.phase = Phase::Idle;
                state.logs.append(format!("⚠ task {task} was interrupted"));
            }
            nodes.insert(node_id, NodeSlot::new(state));
        }
        tracing::info!(count = nodes.len(), "node state store hydrated");
        drop(nodes);

        Ok(store)
    }

    fn build(
        repo: Option<Arc<dyn NodeStateRepository>>,
        log_capacity: usize,
        save_debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                nodes: RwLock::new(HashMap::new()),
                repo,
                log_capacity,
                save_debounce,
                pending_saves: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Return the live handle for `node_id`, creating the node from `defaults`
    /// only if it does not exist yet. Existing state always wins.
    pub async fn get_or_create(
        &self,
        node_id: &str,
        defaults: Option<serde_json::Value>,
    ) -> NodeHandle {
        if let Some(handle) = self.get(node_id).await {
            return handle;
        }

        let mut nodes = self.inner.nodes.write().await;
        let slot = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(node_id, "creating node state");
                let state = NodeState::new(self.inner.log_capacity);
                NodeSlot::new(match defaults {
                    Some(d) => state.with_fields(d),
                    None => state,
                })
            })
            .clone();

        self.handle(node_id, slot)
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeHandle> {
        let nodes = self.inner.nodes.read().await;
        nodes
            .get(node_id)
            .cloned()
            .map(|slot| self.handle(node_id, slot))
    }

    pub async fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.nodes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a node and delete its persisted copy.
    pub async fn remove(&self, node_id: &str) -> Result<bool> {
        let existed = self.inner.nodes.write().await.remove(node_id).is_some();
        if let Some(repo) = &self.inner.repo {
            repo.delete(node_id).await?;
        }
        Ok(existed)
    }

    fn handle(&self, node_id: &str, slot: Arc<NodeSlot>) -> NodeHandle {
        NodeHandle {
            node_id: node_id.to_string(),
            slot,
            store: self.clone(),
        }
    }

    /// Schedule a flush of `node_id`. Never blocks; calls made while a flush
    /// is pending collapse into it, and the flush writes whatever the state
    /// is when it fires.
    pub fn save(&self, node_id: &str) {
        let Some(repo) = self.inner.repo.clone() else {
            return;
        };

        {
            let mut pending = lock(&self.inner.pending_saves);
            if !pending.insert(node_id.to_string()) {
                return;
            }
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(node_id, "save requested outside a runtime, skipping");
            lock(&self.inner.pending_saves).remove(node_id);
            return;
        };

        let store = self.clone();
        let node_id = node_id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(store.inner.save_debounce).await;
            lock(&store.inner.pending_saves).remove(&node_id);

            let Some(handle) = store.get(&node_id).await else {
                return;
            };
            let snapshot = handle.snapshot();
            if let Err(e) = repo.save(&node_id, &snapshot).await {
                tracing::warn!(node_id = %node_id, error = %e, "failed to persist node state");
            } else {
                tracing::trace!(node_id = %node_id, "node state persisted");
            }
        });
    }

    /// Write every node now.
    pub async fn flush_all(&self) {
        let Some(repo) = &self.inner.repo else {
            return;
        };
        let slots: Vec<(String, Arc<NodeSlot>)> = self
            .inner
            .nodes
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (node_id, slot) in slots {
            let snapshot = slot.lock().clone();
            if let Err(e) = repo.save(&node_id, &snapshot).await {
                tracing::warn!(node_id = %node_id, error = %e, "failed to flush node state");
            }
        }
    }

    /// Fire-and-forget flush for shutdown paths.
    pub fn flush_on_unload(&self) {
        let store = self.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { store.flush_all().await });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live handle to one node. Every handle for the same node id shares state.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: String,
    slot: Arc<NodeSlot>,
    store: NodeStateStore,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn read<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        f(&self.slot.lock())
    }

    pub fn snapshot(&self) -> NodeState {
        self.slot.lock().clone()
    }

    /// Mutate the state and notify subscribers once the mutation is complete.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let result = {
            let mut state = self.slot.lock();
            let result = f(&mut state);
            state.touch();
            result
        };
        self.slot.revision.send_modify(|rev| *rev += 1);
        result
    }

    /// Like `update`, but only runs `f` (and notifies) if this node still
    /// tracks `task_id`. Returns `None` for stale tasks.
    pub fn update_if_tracking<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut NodeState) -> R,
    ) -> Option<R> {
        let result = {
            let mut state = self.slot.lock();
            if !state.tracks(task_id) {
                return None;
            }
            let result = f(&mut state);
            state.touch();
            result
        };
        self.slot.revision.send_modify(|rev| *rev += 1);
        Some(result)
    }

    pub fn save(&self) {
        self.store.save(&self.node_id);
    }

    /// Revision counter bumped after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.slot.revision.subscribe()
    }

    /// True when both handles are backed by the same state object.
    pub fn shares_state_with(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}
