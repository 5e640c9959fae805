//! Binds node state, task execution and live streams together.
//!
//! A run on a node goes through the same steps no matter where it was
//! started: mark the node running under a fresh task id, swap in a stream
//! session for that id, wait for the execution result and apply it if the
//! node still tracks the task. Every way a session can end (completion,
//! failure, stop, last view unmounted) goes through `release_session`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::SessionConfig;
use crate::execution::{
    Correlation, ExecutionBackend, ExecutionResponse, FlowEdge, FlowExecuteRequest,
    FlowExecuteResponse, FlowNode, generate_task_id,
};
use crate::state::{NodeHandle, NodeStateStore, Phase};
use crate::stream::{StreamEvent, StreamTransport, Subscriber, TaskStreamSession};
use crate::views::{NodeView, ViewMode};

/// One node's part in a flow run.
#[derive(Debug, Clone)]
pub struct FlowStep {
    pub node_id: String,
    pub tool: String,
    pub payload: serde_json::Value,
}

struct WorkbenchInner {
    store: NodeStateStore,
    backend: Arc<dyn ExecutionBackend>,
    transport: Arc<dyn StreamTransport>,
    session_config: SessionConfig,
    /// node id -> session for the task that node currently tracks
    sessions: Mutex<HashMap<String, Arc<TaskStreamSession>>>,
    mounts: Mutex<HashMap<String, usize>>,
}

/// Process-wide entry point for views. Cloning shares everything.
#[derive(Clone)]
pub struct Workbench {
    inner: Arc<WorkbenchInner>,
}

impl Workbench {
    pub fn new(
        store: NodeStateStore,
        backend: Arc<dyn ExecutionBackend>,
        transport: Arc<dyn StreamTransport>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkbenchInner {
                store,
                backend,
                transport,
                session_config,
                sessions: Mutex::new(HashMap::new()),
                mounts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &NodeStateStore {
        &self.inner.store
    }

    /// Mount a view on `node_id`. If the node is mid-task and nothing is
    /// listening for it (the previous view went away), a session is reopened
    /// for the tracked task id.
    pub async fn mount(
        &self,
        node_id: &str,
        defaults: Option<serde_json::Value>,
        mode: ViewMode,
    ) -> NodeView {
        let handle = self.inner.store.get_or_create(node_id, defaults).await;
        *lock(&self.inner.mounts).entry(node_id.to_string()).or_default() += 1;
        tracing::debug!(node_id, mode = ?mode, "view mounted");

        let running_task = handle.read(|s| {
            if s.phase.is_running() {
                s.task_id.clone()
            } else {
                None
            }
        });
        if let Some(task_id) = running_task {
            self.resume_session(&handle, &task_id);
        }

        NodeView::new(self.clone(), handle, mode)
    }

    /// Called when a view goes away. The session is released once no view
    /// is left on the node; the execution itself keeps running.
    pub(crate) fn unmount(&self, node_id: &str) {
        let remaining = {
            let mut mounts = lock(&self.inner.mounts);
            let count = mounts.entry(node_id.to_string()).or_default();
            *count = count.saturating_sub(1);
            let remaining = *count;
            if remaining == 0 {
                mounts.remove(node_id);
            }
            remaining
        };
        tracing::debug!(node_id, remaining, "view unmounted");
        if remaining == 0 {
            self.release_session(node_id, None);
        }
    }

    pub fn mounted_views(&self, node_id: &str) -> usize {
        lock(&self.inner.mounts).get(node_id).copied().unwrap_or(0)
    }

    /// Run `tool` on `node_id` under a freshly generated task id.
    pub async fn run(
        &self,
        node_id: &str,
        tool: &str,
        payload: serde_json::Value,
    ) -> ExecutionResponse {
        let task_id = generate_task_id(tool, node_id);
        self.run_task(node_id, tool, payload, &task_id).await
    }

    /// Run under a caller-chosen task id.
    pub async fn run_task(
        &self,
        node_id: &str,
        tool: &str,
        payload: serde_json::Value,
        task_id: &str,
    ) -> ExecutionResponse {
        let handle = self.inner.store.get_or_create(node_id, None).await;
        handle.update(|s| s.begin_task(task_id, tool));
        handle.save();
        tracing::info!(node_id, tool, task_id, "task started");

        let session = Arc::new(TaskStreamSession::new(
            task_id,
            node_subscriber(handle.clone(), task_id),
        ));
        self.install_session(node_id, session.clone());
        let streaming = session
            .open(self.inner.transport.clone(), self.inner.session_config)
            .await;
        if !streaming {
            tracing::debug!(node_id, task_id, "submitting without a live stream");
        }

        let correlation = Correlation::new(task_id, node_id);
        let response = self
            .inner
            .backend
            .execute(tool, payload, Some(&correlation))
            .await;

        // Stop listening first so no frame lands after the final state.
        self.release_session(node_id, Some(task_id));
        self.finish(&handle, task_id, &response);
        // A mount between the two steps above may have resumed the stream.
        self.release_session(node_id, Some(task_id));
        response
    }

    /// Spawn a run so it outlives the caller, e.g. a view that unmounts
    /// before the backend answers.
    pub fn spawn_run(
        &self,
        node_id: &str,
        tool: &str,
        payload: serde_json::Value,
    ) -> (String, tokio::task::JoinHandle<ExecutionResponse>) {
        let task_id = generate_task_id(tool, node_id);
        let workbench = self.clone();
        let (node_id, tool, id) = (node_id.to_string(), tool.to_string(), task_id.clone());
        let join = tokio::spawn(async move {
            workbench.run_task(&node_id, &tool, payload, &id).await
        });
        (task_id, join)
    }

    /// Run several nodes as one flow. All nodes share a single task id and
    /// one stream; frames are routed by their `node_id`.
    pub async fn run_flow(&self, steps: Vec<FlowStep>, edges: Vec<FlowEdge>) -> FlowExecuteResponse {
        let task_id = format!("flow-{}", uuid::Uuid::new_v4());
        self.run_flow_task(steps, edges, &task_id).await
    }

    pub async fn run_flow_task(
        &self,
        steps: Vec<FlowStep>,
        edges: Vec<FlowEdge>,
        task_id: &str,
    ) -> FlowExecuteResponse {
        let mut handles = HashMap::new();
        for step in &steps {
            let handle = self.inner.store.get_or_create(&step.node_id, None).await;
            handle.update(|s| s.begin_task(task_id, &step.tool));
            handle.save();
            handles.insert(step.node_id.clone(), handle);
        }
        tracing::info!(task_id, nodes = steps.len(), "flow started");

        let session = Arc::new(TaskStreamSession::new(
            task_id,
            flow_subscriber(handles.clone(), task_id),
        ));
        for node_id in handles.keys() {
            self.install_session(node_id, session.clone());
        }
        session
            .open(self.inner.transport.clone(), self.inner.session_config)
            .await;

        let request = FlowExecuteRequest {
            nodes: steps
                .into_iter()
                .map(|step| FlowNode {
                    id: step.node_id,
                    node_type: step.tool,
                    config: step.payload,
                })
                .collect(),
            edges,
            task_id: Some(task_id.to_string()),
        };
        let response = self.inner.backend.execute_flow(&request).await;

        for (node_id, handle) in &handles {
            self.release_session(node_id, Some(task_id));
            let node_response = response
                .node_results
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| ExecutionResponse::failure(response.message.clone()));
            self.finish(handle, task_id, &node_response);
            self.release_session(node_id, Some(task_id));
        }
        response
    }

    /// Stop listening to the node's current task. The backend is not told;
    /// a result arriving later for that task is ignored.
    pub fn stop(&self, node_id: &str, handle: &NodeHandle) {
        self.release_session(node_id, None);
        let stopped = handle.update(|s| {
            if !s.phase.is_running() {
                return None;
            }
            let task = s.task_id.take().unwrap_or_default();
            s.phase = Phase::Idle;
            s.logs.append(format!("■ stopped listening to {task}"));
            Some(task)
        });
        if let Some(task_id) = stopped {
            tracing::info!(node_id, task_id = %task_id, "task stopped by user");
            handle.save();
        }
    }

    /// Whether a live session is attached to `node_id`.
    pub fn has_session(&self, node_id: &str) -> bool {
        lock(&self.inner.sessions)
            .get(node_id)
            .is_some_and(|s| !s.is_terminated())
    }

    pub fn session_task(&self, node_id: &str) -> Option<String> {
        lock(&self.inner.sessions)
            .get(node_id)
            .map(|s| s.task_id().to_string())
    }

    fn install_session(&self, node_id: &str, session: Arc<TaskStreamSession>) {
        let previous = {
            let mut sessions = lock(&self.inner.sessions);
            let previous = sessions.insert(node_id.to_string(), session);
            previous.filter(|p| !in_use(&sessions, p))
        };
        if let Some(previous) = previous {
            tracing::debug!(node_id, task_id = %previous.task_id(), "replacing session");
            previous.stop();
        }
    }

    fn resume_session(&self, handle: &NodeHandle, task_id: &str) {
        let node_id = handle.node_id().to_string();
        {
            let sessions = lock(&self.inner.sessions);
            if sessions
                .get(&node_id)
                .is_some_and(|s| s.task_id() == task_id && !s.is_terminated())
            {
                return;
            }
        }

        tracing::info!(node_id = %node_id, task_id, "resuming live updates");
        let session = Arc::new(TaskStreamSession::new(
            task_id,
            node_subscriber(handle.clone(), task_id),
        ));
        self.install_session(&node_id, session.clone());

        // The task may have finished while the session was being installed.
        if !handle.read(|s| s.phase.is_running() && s.tracks(task_id)) {
            self.release_session(&node_id, Some(task_id));
            return;
        }

        let transport = self.inner.transport.clone();
        let config = self.inner.session_config;
        tokio::spawn(async move {
            session.open(transport, config).await;
        });
    }

    /// The one teardown path for sessions. With `task_id` set, only a
    /// session bound to that task is released. A flow session is stopped
    /// once the last of its nodes lets go of it.
    fn release_session(&self, node_id: &str, task_id: Option<&str>) {
        let released = {
            let mut sessions = lock(&self.inner.sessions);
            let matches = sessions
                .get(node_id)
                .is_some_and(|s| task_id.is_none_or(|id| s.task_id() == id));
            let removed = if matches { sessions.remove(node_id) } else { None };
            removed.filter(|s| !in_use(&sessions, s))
        };
        if let Some(session) = released {
            session.stop();
            tracing::debug!(node_id, task_id = %session.task_id(), "session released");
        }
    }

    fn finish(&self, handle: &NodeHandle, task_id: &str, response: &ExecutionResponse) {
        let applied = handle
            .update_if_tracking(task_id, |s| s.apply_response(response))
            .is_some();
        if applied {
            tracing::info!(
                node_id = %handle.node_id(),
                task_id,
                success = response.success,
                "task finished"
            );
            handle.save();
        } else {
            tracing::debug!(node_id = %handle.node_id(), task_id, "dropping result for stale task");
        }
    }
}

fn apply_event(handle: &NodeHandle, task_id: &str, event: &StreamEvent) {
    let applied = handle.update_if_tracking(task_id, |s| match event {
        StreamEvent::Frame(frame) => s.apply_frame(frame),
        other => {
            if let Some(line) = other.log_line() {
                s.logs.append(line);
            }
        }
    });
    match applied {
        Some(()) => handle.save(),
        None => tracing::trace!(node_id = %handle.node_id(), task_id, "stale event dropped"),
    }
}

fn node_subscriber(handle: NodeHandle, task_id: &str) -> Subscriber {
    let task_id = task_id.to_string();
    Arc::new(move |event| apply_event(&handle, &task_id, &event))
}

/// Frames without a `node_id`, raw frames and disconnect notices go to
/// every node in the flow.
fn flow_subscriber(handles: HashMap<String, NodeHandle>, task_id: &str) -> Subscriber {
    let task_id = task_id.to_string();
    Arc::new(move |event| {
        let target = match &event {
            StreamEvent::Frame(frame) => frame.node_id.as_deref(),
            _ => None,
        };
        match target {
            Some(node_id) => match handles.get(node_id) {
                Some(handle) => apply_event(handle, &task_id, &event),
                None => tracing::debug!(node_id, task_id = %task_id, "frame for node outside flow"),
            },
            None => {
                for handle in handles.values() {
                    apply_event(handle, &task_id, &event);
                }
            }
        }
    })
}

/// Whether some node still maps to `session`.
fn in_use(
    sessions: &HashMap<String, Arc<TaskStreamSession>>,
    session: &Arc<TaskStreamSession>,
) -> bool {
    sessions.values().any(|s| Arc::ptr_eq(s, session))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
