//! Compact and fullscreen renderings of a node.
//!
//! Views hold no state of their own. Everything they show is read from the
//! shared node state, so two views on the same node always agree.

use std::fmt::Write as _;

use tokio::sync::watch;

use crate::execution::ExecutionResponse;
use crate::state::{NodeHandle, NodeState, Phase};
use crate::workbench::Workbench;

const PROGRESS_WIDTH: usize = 20;
const COMPACT_TEXT_LIMIT: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// In-canvas card: one status line plus the latest log line.
    Compact,
    /// Panel with every field and the whole log.
    Fullscreen,
}

/// A mounted view. Dropping it unmounts.
pub struct NodeView {
    workbench: Workbench,
    handle: NodeHandle,
    mode: ViewMode,
    revision: watch::Receiver<u64>,
}

impl NodeView {
    pub(crate) fn new(workbench: Workbench, handle: NodeHandle, mode: ViewMode) -> Self {
        let revision = handle.subscribe();
        Self {
            workbench,
            handle,
            mode,
            revision,
        }
    }

    pub fn node_id(&self) -> &str {
        self.handle.node_id()
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn render(&self) -> String {
        self.handle.read(|state| render(self.mode, self.node_id(), state))
    }

    /// Wait for the next change to the node. Returns false once the store
    /// is gone.
    pub async fn changed(&mut self) -> bool {
        self.revision.changed().await.is_ok()
    }

    /// Write a tool-specific form field and schedule a save.
    pub fn set_field(&self, key: &str, value: serde_json::Value) {
        self.handle.update(|s| {
            s.fields.insert(key.to_string(), value);
        });
        self.handle.save();
    }

    pub async fn run(&self, tool: &str, payload: serde_json::Value) -> ExecutionResponse {
        self.workbench.run(self.node_id(), tool, payload).await
    }

    pub fn spawn_run(
        &self,
        tool: &str,
        payload: serde_json::Value,
    ) -> (String, tokio::task::JoinHandle<ExecutionResponse>) {
        self.workbench.spawn_run(self.node_id(), tool, payload)
    }

    pub fn stop(&self) {
        self.workbench.stop(self.node_id(), &self.handle);
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for NodeView {
    fn drop(&mut self) {
        self.workbench.unmount(self.handle.node_id());
    }
}

pub fn render(mode: ViewMode, node_id: &str, state: &NodeState) -> String {
    match mode {
        ViewMode::Compact => render_compact(node_id, state),
        ViewMode::Fullscreen => render_fullscreen(node_id, state),
    }
}

fn phase_icon(phase: &Phase) -> &'static str {
    match phase {
        Phase::Idle => "○",
        Phase::Running => "◐",
        Phase::Completed => "✓",
        Phase::Error => "✗",
        Phase::Other(_) => "·",
    }
}

pub fn render_compact(node_id: &str, state: &NodeState) -> String {
    let mut line = format!("{} [{node_id}] {}", phase_icon(&state.phase), state.phase);
    match state.phase {
        Phase::Running => {
            let _ = write!(line, " {:>3}%", state.progress);
            if !state.progress_text.is_empty() {
                let _ = write!(line, " {}", truncate(&state.progress_text, COMPACT_TEXT_LIMIT));
            }
        }
        Phase::Completed | Phase::Error => {
            if let Some(message) = &state.message {
                let _ = write!(line, " {}", truncate(message, COMPACT_TEXT_LIMIT));
            }
        }
        _ => {}
    }

    if let Some(last) = state.logs.last() {
        let _ = write!(line, "\n  {}", truncate(last, COMPACT_TEXT_LIMIT));
    }
    line
}

pub fn render_fullscreen(node_id: &str, state: &NodeState) -> String {
    let mut out = format!("══ {node_id} ══\n");
    let _ = writeln!(out, "phase:    {} {}", phase_icon(&state.phase), state.phase);
    if let Some(task_id) = &state.task_id {
        let _ = writeln!(out, "task:     {task_id}");
    }
    let _ = write!(
        out,
        "progress: {} {:>3}%",
        progress_bar(state.progress, PROGRESS_WIDTH),
        state.progress
    );
    if !state.progress_text.is_empty() {
        let _ = write!(out, "  {}", state.progress_text);
    }
    out.push('\n');

    if let Some(marker) = &state.last_status {
        let _ = writeln!(out, "status:   {}: {}", marker.status, marker.message);
    }
    if let Some(message) = &state.message {
        let _ = writeln!(out, "message:  {message}");
    }
    if !state.stats.is_empty() {
        let mut stats: Vec<_> = state.stats.iter().collect();
        stats.sort();
        let joined: Vec<String> = stats.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let _ = writeln!(out, "stats:    {}", joined.join(", "));
    }
    if let Some(path) = &state.output_path {
        let _ = writeln!(out, "output:   {path}");
    }
    for (key, value) in &state.fields {
        let shown = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "  {key} = {shown}");
    }
    if let Some(result) = state.result.as_ref().filter(|r| !r.is_null()) {
        let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
        let _ = writeln!(out, "result:\n{pretty}");
    }

    let _ = writeln!(
        out,
        "── logs ({}/{}) ──",
        state.logs.len(),
        state.logs.capacity()
    );
    for line in state.logs.iter() {
        let _ = writeln!(out, "{line}");
    }
    out
}

fn progress_bar(progress: u8, width: usize) -> String {
    let filled = (progress.min(100) as usize * width) / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}
