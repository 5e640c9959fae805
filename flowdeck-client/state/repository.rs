use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use super::NodeState;

/// Persistence boundary for node state, keyed by node id.
#[async_trait]
pub trait NodeStateRepository: Send + Sync {
    /// Load every persisted node. Called once, before any view reads.
    async fn load_all(&self) -> Result<HashMap<String, NodeState>>;
    async fn save(&self, node_id: &str, state: &NodeState) -> Result<()>;
    async fn delete(&self, node_id: &str) -> Result<bool>;
}
