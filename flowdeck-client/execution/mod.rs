pub mod http_client;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use http_client::HttpExecutionClient;

/// Ids that let the backend tag stream frames with the caller's task and node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub task_id: Option<String>,
    pub node_id: Option<String>,
}

impl Correlation {
    pub fn new(task_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            node_id: Some(node_id.into()),
        }
    }
}

/// Body of `POST /execute/node`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub node_type: String,
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(tool: &str, payload: serde_json::Value, correlation: Option<&Correlation>) -> Self {
        let correlation = correlation.cloned().unwrap_or_default();
        Self {
            node_type: tool.to_string(),
            config: payload,
            task_id: correlation.task_id,
            node_id: correlation.node_id,
        }
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub stats: HashMap<String, i64>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ExecutionResponse {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            stats: HashMap::new(),
            output_path: None,
            logs: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: serde_json::Value::Null,
            stats: HashMap::new(),
            output_path: None,
            logs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
}

/// Body of `POST /execute/flow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecuteRequest {
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub node_results: HashMap<String, ExecutionResponse>,
    #[serde(default)]
    pub execution_order: Vec<String>,
}

impl FlowExecuteResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            node_results: HashMap::new(),
            execution_order: Vec::new(),
        }
    }
}

/// Node type metadata from `GET /nodes/types`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeTypeInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub icon: String,
}

/// Starts tasks on the backend and reports how they ended.
///
/// Implementations never fail: every transport or backend problem comes back
/// as a response with `success: false`, so callers drive the node's phase
/// from a single code path.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(
        &self,
        tool: &str,
        payload: serde_json::Value,
        correlation: Option<&Correlation>,
    ) -> ExecutionResponse;

    async fn execute_flow(&self, request: &FlowExecuteRequest) -> FlowExecuteResponse;
}

static LAST_TASK_MILLIS: AtomicI64 = AtomicI64::new(0);

/// `{tool}-{node_id}-{millis}`. The millisecond part never repeats within a
/// process, so back-to-back starts on one node get distinct ids.
pub fn generate_task_id(tool: &str, node_id: &str) -> String {
    let now = Utc::now().timestamp_millis();
    let previous = LAST_TASK_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    let millis = now.max(previous + 1);
    format!("{tool}-{node_id}-{millis}")
}
