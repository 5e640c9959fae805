use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    Correlation, ExecutionBackend, ExecutionRequest, ExecutionResponse, FlowExecuteRequest,
    FlowExecuteResponse, NodeTypeInfo,
};
use crate::error::ClientError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to the execution backend over plain JSON HTTP.
///
/// Only the connect phase has a deadline. Tasks like a full repository
/// clean can run for minutes and the request stays open until they finish.
pub struct HttpExecutionClient {
    http: reqwest::Client,
    api_url: String,
}

impl HttpExecutionClient {
    pub fn new(api_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let resp = self.http.post(self.endpoint(path)).json(body).send().await?;
        decode(resp).await
    }

    pub async fn list_node_types(&self) -> anyhow::Result<Vec<NodeTypeInfo>> {
        let resp = self
            .http
            .get(self.endpoint("nodes/types"))
            .send()
            .await
            .context("failed to reach execution backend")?;
        let types = decode(resp)
            .await
            .context("failed to list node types")?;
        Ok(types)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_str(&body)?)
}

/// FastAPI style errors carry `{"detail": ...}`.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Failure message shown on the node. A backend `detail` is shown as-is.
fn failure_message(err: &ClientError) -> String {
    match err {
        ClientError::Http { body, .. } => error_detail(body).unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutionClient {
    async fn execute(
        &self,
        tool: &str,
        payload: serde_json::Value,
        correlation: Option<&Correlation>,
    ) -> ExecutionResponse {
        let request = ExecutionRequest::new(tool, payload, correlation);
        let task_id = request.task_id.clone().unwrap_or_default();
        tracing::info!(tool = %tool, task_id = %task_id, "executing node");

        match self.post_json::<_, ExecutionResponse>("execute/node", &request).await {
            Ok(resp) => {
                tracing::info!(
                    tool = %tool,
                    task_id = %task_id,
                    success = resp.success,
                    "execution finished"
                );
                resp
            }
            Err(e) => {
                tracing::warn!(tool = %tool, task_id = %task_id, error = %e, "execution failed");
                ExecutionResponse::failure(failure_message(&e))
            }
        }
    }

    async fn execute_flow(&self, request: &FlowExecuteRequest) -> FlowExecuteResponse {
        tracing::info!(nodes = request.nodes.len(), "executing flow");
        match self.post_json::<_, FlowExecuteResponse>("execute/flow", request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "flow execution failed");
                FlowExecuteResponse::failure(failure_message(&e))
            }
        }
    }
}
