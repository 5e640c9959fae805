pub mod session;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use session::{SessionState, Subscriber, TaskStreamSession};
pub use transport::{FrameStream, StreamTransport, WsTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

/// Payload of a task event frame, selected by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameKind {
    Progress {
        progress: f64,
        #[serde(default)]
        message: String,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    Status {
        status: String,
        #[serde(default)]
        message: String,
    },
    Connected {
        #[serde(default)]
        message: String,
    },
    Pong,
}

/// Routing fields the backend attaches to every frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Envelope {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFrame {
    pub task_id: Option<String>,
    pub node_id: Option<String>,
    pub timestamp: Option<String>,
    pub kind: FrameKind,
}

impl TaskFrame {
    /// Frames that carry information for the node (not handshake chatter).
    pub fn is_update(&self) -> bool {
        !matches!(self.kind, FrameKind::Connected { .. } | FrameKind::Pong)
    }
}

/// A decoded socket frame. Anything that is not a recognized task frame is
/// kept verbatim so it can still be shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Task(TaskFrame),
    Raw(String),
}

pub fn parse_frame(text: &str) -> Frame {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Raw(text.to_string()),
    };
    let kind = match FrameKind::deserialize(&value) {
        Ok(kind) => kind,
        Err(_) => return Frame::Raw(text.to_string()),
    };
    let envelope = Envelope::deserialize(&value).unwrap_or_default();

    Frame::Task(TaskFrame {
        task_id: envelope.task_id,
        node_id: envelope.node_id,
        timestamp: envelope.timestamp,
        kind,
    })
}

/// What a session hands to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(TaskFrame),
    /// A frame that could not be decoded, verbatim.
    Raw(String),
    /// The session gave up reconnecting. The task itself may still succeed.
    Disconnected { attempts: u32, reason: String },
}

impl StreamEvent {
    /// The line a node's log should show for this event, if any.
    pub fn log_line(&self) -> Option<String> {
        match self {
            StreamEvent::Frame(_) => None,
            StreamEvent::Raw(text) => Some(text.clone()),
            StreamEvent::Disconnected { attempts, reason } => Some(format!(
                "⚠ live updates disconnected after {attempts} attempt(s): {reason}"
            )),
        }
    }
}
