pub mod file_repository;
pub mod log_buffer;
pub mod repository;
pub mod store;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionResponse;
use crate::stream::{FrameKind, LogLevel, TaskFrame};

pub use log_buffer::LogBuffer;
pub use store::{NodeHandle, NodeStateStore};

/// Coarse lifecycle of a node. Tools may report their own phases, which are
/// kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Completed => "completed",
            Phase::Error => "error",
            Phase::Other(s) => s,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Running)
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "idle" => Phase::Idle,
            "running" => Phase::Running,
            "completed" => Phase::Completed,
            "error" => Phase::Error,
            _ => Phase::Other(s),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last `status` frame seen for the current task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMarker {
    pub status: String,
    pub message: String,
}

/// Everything a view needs to render one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub phase: Phase,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub progress_text: String,
    #[serde(default)]
    pub last_status: Option<StatusMarker>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub stats: HashMap<String, i64>,
    #[serde(default)]
    pub output_path: Option<String>,
    /// Tool-specific form values and outputs.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub logs: LogBuffer,
    /// Frames received over the live stream for the current task.
    #[serde(default)]
    pub live_frames: u32,
    pub updated_at: DateTime<Utc>,
}

impl NodeState {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            phase: Phase::Idle,
            task_id: None,
            progress: 0,
            progress_text: String::new(),
            last_status: None,
            message: None,
            result: None,
            stats: HashMap::new(),
            output_path: None,
            fields: serde_json::Map::new(),
            logs: LogBuffer::new(log_capacity),
            live_frames: 0,
            updated_at: Utc::now(),
        }
    }

    /// Seed tool-specific fields from a JSON object. Non-object values are ignored.
    pub fn with_fields(mut self, defaults: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = defaults {
            self.fields = map;
        }
        self
    }

    /// True when `task_id` is the task this node currently tracks.
    pub fn tracks(&self, task_id: &str) -> bool {
        self.task_id.as_deref() == Some(task_id)
    }

    /// Reset per-task fields and mark the node as running `task_id`.
    pub fn begin_task(&mut self, task_id: &str, tool: &str) {
        self.phase = Phase::Running;
        self.task_id = Some(task_id.to_string());
        self.progress = 0;
        self.progress_text.clear();
        self.last_status = None;
        self.message = None;
        self.result = None;
        self.stats.clear();
        self.output_path = None;
        self.live_frames = 0;
        self.logs.append(format!("▶ {tool} started ({task_id})"));
    }

    pub fn apply_frame(&mut self, frame: &TaskFrame) {
        self.live_frames = self.live_frames.saturating_add(1);
        match &frame.kind {
            FrameKind::Progress { progress, message } => {
                self.progress = progress.round().clamp(0.0, 100.0) as u8;
                self.progress_text = message.clone();
            }
            FrameKind::Log { message, level } => match level {
                LogLevel::Info => self.logs.append(message.clone()),
                other => self.logs.append(format!("[{}] {message}", other.as_str())),
            },
            FrameKind::Status { status, message } => {
                self.last_status = Some(StatusMarker {
                    status: status.clone(),
                    message: message.clone(),
                });
            }
            FrameKind::Connected { .. } | FrameKind::Pong => {}
        }
    }

    /// Apply the authoritative outcome of an execution call.
    pub fn apply_response(&mut self, response: &ExecutionResponse) {
        // Without a live stream the backend's collected logs are the only record.
        if self.live_frames == 0 {
            for line in &response.logs {
                self.logs.append(line.clone());
            }
        }

        self.message = Some(response.message.clone());
        self.stats = response.stats.clone();
        self.output_path = response.output_path.clone();

        if response.success {
            self.phase = Phase::Completed;
            self.progress = 100;
            self.result = Some(response.data.clone());
            self.logs.append(format!("✔ {}", response.message));
        } else {
            self.phase = Phase::Error;
            self.result = None;
            self.logs.append(format!("✖ {}", response.message));
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
