//! In-process fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::error::ClientError;
use crate::execution::{
    Correlation, ExecutionBackend, ExecutionResponse, FlowExecuteRequest, FlowExecuteResponse,
};
use crate::stream::{FrameStream, StreamEvent, StreamTransport, Subscriber};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Mode {
    Live,
    Hang,
    Refuse,
}

/// A transport whose connections are channels the test writes frames into.
pub struct ScriptedTransport {
    mode: Mode,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    attempts: Mutex<HashMap<String, u32>>,
    connects: watch::Sender<u64>,
}

impl ScriptedTransport {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            senders: Mutex::default(),
            attempts: Mutex::default(),
            connects: watch::channel(0).0,
        }
    }

    pub fn live() -> Self {
        Self::with_mode(Mode::Live)
    }

    /// Every connect blocks until cancelled.
    pub fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    /// Every connect fails immediately.
    pub fn refusing() -> Self {
        Self::with_mode(Mode::Refuse)
    }

    /// Waits for a live connection on `task_id` and returns its write end.
    pub async fn sender(&self, task_id: &str) -> mpsc::UnboundedSender<String> {
        let mut rx = self.connects.subscribe();
        let found = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(tx) = self.senders.lock().unwrap().get(task_id) {
                    return tx.clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("no connection for {task_id}"))
    }

    /// Drops the transport's own handle so the server side can close.
    pub fn forget(&self, task_id: &str) {
        self.senders.lock().unwrap().remove(task_id);
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(&self, task_id: &str) -> Result<FrameStream, ClientError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default() += 1;

        match self.mode {
            Mode::Refuse => Err(ClientError::Socket("connection refused".into())),
            Mode::Hang => futures::future::pending().await,
            Mode::Live => {
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                self.senders
                    .lock()
                    .unwrap()
                    .insert(task_id.to_string(), tx);
                self.connects.send_modify(|n| *n += 1);
                let frames = async_stream::stream! {
                    while let Some(text) = rx.recv().await {
                        yield Ok(text);
                    }
                };
                Ok(frames.boxed())
            }
        }
    }
}

/// Everything a subscriber received, in order.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StreamEvent>>>,
    count: watch::Sender<usize>,
}

impl EventLog {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for_len(&self, n: usize) -> Vec<StreamEvent> {
        let mut rx = self.count.subscribe();
        let reached = tokio::time::timeout(WAIT, rx.wait_for(|count| *count >= n))
            .await
            .is_ok();
        assert!(reached, "expected {n} events, got {:?}", self.snapshot());
        self.snapshot()
    }
}

pub fn collect_events() -> (Subscriber, EventLog) {
    let log = EventLog {
        events: Arc::default(),
        count: watch::channel(0).0,
    };
    let sink = log.clone();
    let subscriber: Subscriber = Arc::new(move |event| {
        let len = {
            let mut events = sink.events.lock().unwrap();
            events.push(event);
            events.len()
        };
        sink.count.send_replace(len);
    });
    (subscriber, log)
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tool: String,
    pub payload: serde_json::Value,
    pub correlation: Option<Correlation>,
}

impl RecordedCall {
    pub fn task_id(&self) -> &str {
        self.correlation
            .as_ref()
            .and_then(|c| c.task_id.as_deref())
            .unwrap_or_default()
    }
}

/// An execution backend whose responses the test releases by task id.
pub struct ScriptedExecutor {
    immediate: Option<ExecutionResponse>,
    calls: watch::Sender<Vec<RecordedCall>>,
    responses: watch::Sender<HashMap<String, ExecutionResponse>>,
    flow_responses: watch::Sender<HashMap<String, FlowExecuteResponse>>,
}

impl ScriptedExecutor {
    /// Calls block until [`ScriptedExecutor::resolve`] names their task.
    pub fn pending() -> Self {
        Self {
            immediate: None,
            calls: watch::channel(Vec::new()).0,
            responses: watch::channel(HashMap::new()).0,
            flow_responses: watch::channel(HashMap::new()).0,
        }
    }

    /// Every call returns `response` right away.
    pub fn immediate(response: ExecutionResponse) -> Self {
        Self {
            immediate: Some(response),
            ..Self::pending()
        }
    }

    pub fn resolve(&self, task_id: &str, response: ExecutionResponse) {
        self.responses.send_modify(|map| {
            map.insert(task_id.to_string(), response);
        });
    }

    pub fn resolve_flow(&self, task_id: &str, response: FlowExecuteResponse) {
        self.flow_responses.send_modify(|map| {
            map.insert(task_id.to_string(), response);
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    /// Waits until at least `n` calls have been made.
    pub async fn wait_for_calls(&self, n: usize) -> Vec<RecordedCall> {
        let mut rx = self.calls.subscribe();
        let reached = tokio::time::timeout(WAIT, rx.wait_for(|calls| calls.len() >= n))
            .await
            .is_ok();
        assert!(reached, "expected {n} execute calls");
        self.calls()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedExecutor {
    async fn execute(
        &self,
        tool: &str,
        payload: serde_json::Value,
        correlation: Option<&Correlation>,
    ) -> ExecutionResponse {
        let call = RecordedCall {
            tool: tool.to_string(),
            payload,
            correlation: correlation.cloned(),
        };
        let task_id = call.task_id().to_string();
        self.calls.send_modify(|calls| calls.push(call));

        if let Some(response) = &self.immediate {
            return response.clone();
        }
        let mut rx = self.responses.subscribe();
        match rx.wait_for(|map| map.contains_key(&task_id)).await {
            Ok(map) => map[&task_id].clone(),
            Err(_) => ExecutionResponse::failure("executor dropped"),
        }
    }

    async fn execute_flow(&self, request: &FlowExecuteRequest) -> FlowExecuteResponse {
        let task_id = request.task_id.clone().unwrap_or_default();
        let call = RecordedCall {
            tool: "flow".to_string(),
            payload: serde_json::to_value(request).unwrap(),
            correlation: Some(Correlation {
                task_id: Some(task_id.clone()),
                node_id: None,
            }),
        };
        self.calls.send_modify(|calls| calls.push(call));

        let mut rx = self.flow_responses.subscribe();
        match rx.wait_for(|map| map.contains_key(&task_id)).await {
            Ok(map) => map[&task_id].clone(),
            Err(_) => FlowExecuteResponse::failure("executor dropped"),
        }
    }
}
