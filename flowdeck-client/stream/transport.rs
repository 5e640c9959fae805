use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// Text frames from one connection. The stream ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<String, ClientError>>;

/// Opens the live event channel for a task.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, task_id: &str) -> Result<FrameStream, ClientError>;
}

/// WebSocket transport against `{api}/ws/tasks/{task_id}`.
pub struct WsTransport {
    api_url: reqwest::Url,
}

impl WsTransport {
    pub fn new(api_url: &str) -> Result<Self, ClientError> {
        let api_url = reqwest::Url::parse(api_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{api_url}: {e}")))?;
        match api_url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(Self { api_url }),
            other => Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {other}"
            ))),
        }
    }

    /// `http://host/v1` + `t1` -> `ws://host/v1/ws/tasks/t1`
    pub fn task_url(&self, task_id: &str) -> Result<reqwest::Url, ClientError> {
        let mut url = self.api_url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(self.api_url.to_string()))?;
            segments.pop_if_empty().extend(["ws", "tasks", task_id]);
        }
        Ok(url)
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self, task_id: &str) -> Result<FrameStream, ClientError> {
        let url = self.task_url(task_id)?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!(url = %url, "task stream connected");

        // Only the read half is used; dropping the stream closes the socket.
        let frames = async_stream::stream! {
            let mut ws_stream = ws_stream;
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => yield Ok(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => {
                        yield Ok(String::from_utf8_lossy(&data).into_owned())
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(ClientError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(frames.boxed())
    }
}
