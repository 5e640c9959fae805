use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use super::NodeState;
use super::repository::NodeStateRepository;

/// Stores each node as `<base_dir>/nodes/<node_id>.json`.
pub struct FileNodeStateRepository {
    base_dir: PathBuf,
}

impl FileNodeStateRepository {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn nodes_dir(&self) -> PathBuf {
        self.base_dir.join("nodes")
    }

    fn node_file(&self, node_id: &str) -> PathBuf {
        self.nodes_dir().join(format!("{}.json", file_stem(node_id)))
    }
}

/// Bytes escaped in file names. `%` is escaped too so distinct ids never
/// share a file.
const FILE_NAME: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|');

/// Node ids come from the canvas and may contain path separators.
fn file_stem(node_id: &str) -> String {
    utf8_percent_encode(node_id, FILE_NAME).to_string()
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredNode {
    node_id: String,
    state: NodeState,
}

#[async_trait]
impl NodeStateRepository for FileNodeStateRepository {
    async fn load_all(&self) -> Result<HashMap<String, NodeState>> {
        let dir = self.nodes_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create nodes dir: {}", dir.display()))?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read nodes dir: {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read node file: {}", path.display()))?;
            match serde_json::from_str::<StoredNode>(&content) {
                Ok(stored) => {
                    loaded.insert(stored.node_id, stored.state);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping invalid node file");
                }
            }
        }

        tracing::info!(count = loaded.len(), "Loaded node states");
        Ok(loaded)
    }

    async fn save(&self, node_id: &str, state: &NodeState) -> Result<()> {
        let dir = self.nodes_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create nodes dir: {}", dir.display()))?;

        let stored = StoredNode {
            node_id: node_id.to_string(),
            state: state.clone(),
        };
        let content =
            serde_json::to_string_pretty(&stored).context("failed to serialize node state")?;

        let path = self.node_file(node_id);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("failed to write node file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace node file: {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, node_id: &str) -> Result<bool> {
        let path = self.node_file(node_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("failed to delete node file: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load_across_instances() {
        let dir = tempdir().unwrap();
        let repo = FileNodeStateRepository::new(dir.path().to_path_buf());

        let mut state = NodeState::new(5);
        state.phase = Phase::Completed;
        state.logs.append("done");
        repo.save("n1", &state).await.unwrap();

        let repo2 = FileNodeStateRepository::new(dir.path().to_path_buf());
        let loaded = repo2.load_all().await.unwrap();
        let n1 = loaded.get("n1").unwrap();
        assert_eq!(n1.phase, Phase::Completed);
        assert!(n1.logs.contains("done"));
    }

    #[tokio::test]
    async fn test_node_id_with_separators_keeps_original_id() {
        let dir = tempdir().unwrap();
        let repo = FileNodeStateRepository::new(dir.path().to_path_buf());
        repo.save("flow/a:b", &NodeState::new(5)).await.unwrap();

        assert!(dir.path().join("nodes").join("flow%2Fa%3Ab.json").exists());
        let loaded = repo.load_all().await.unwrap();
        assert!(loaded.contains_key("flow/a:b"));
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_files() {
        let dir = tempdir().unwrap();
        let repo = FileNodeStateRepository::new(dir.path().to_path_buf());
        let ids = ["a/b", "a_b", "a:b", "a\\b", "a%2Fb"];
        for id in ids {
            let mut state = NodeState::new(5);
            state.logs.append(format!("from {id}"));
            repo.save(id, &state).await.unwrap();
        }

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), ids.len());
        for id in ids {
            assert!(loaded[id].logs.contains(&format!("from {id}")), "{id} was overwritten");
        }
    }

    #[tokio::test]
    async fn test_invalid_files_are_skipped() {
        let dir = tempdir().unwrap();
        let nodes = dir.path().join("nodes");
        std::fs::create_dir_all(&nodes).unwrap();
        std::fs::write(nodes.join("broken.json"), "{not json").unwrap();
        std::fs::write(nodes.join("notes.txt"), "ignored").unwrap();

        let repo = FileNodeStateRepository::new(dir.path().to_path_buf());
        repo.save("ok", &NodeState::new(5)).await.unwrap();
        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("ok"));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let repo = FileNodeStateRepository::new(dir.path().to_path_buf());
        repo.save("n1", &NodeState::new(5)).await.unwrap();
        assert!(repo.delete("n1").await.unwrap());
        assert!(!repo.delete("n1").await.unwrap());
        assert!(repo.load_all().await.unwrap().is_empty());
    }
}
