//! Result Persistence
//!
//! Durable sinks for the items of a finished analysis. The JSON store writes
//! one file per message under `<root>/<session>/<message>.json`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use insight_core::ResultItem;
use serde::{Deserialize, Serialize};

use crate::services::analysis::orchestrator::ResultStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::results_dir;

/// File contents for one persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedResults {
    pub session_id: String,
    pub message_id: String,
    pub saved_at: String,
    pub items: Vec<ResultItem>,
}

/// Stores results as pretty-printed JSON files.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    root: PathBuf,
}

impl JsonResultStore {
    /// Store under ~/.insight-desktop/results
    pub fn new() -> AppResult<Self> {
        Ok(Self::with_root(results_dir()?))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn message_path(&self, session_id: &str, message_id: &str) -> AppResult<PathBuf> {
        Ok(self
            .root
            .join(path_component(session_id)?)
            .join(format!("{}.json", path_component(message_id)?)))
    }

    /// Read back the items persisted for one message.
    pub async fn load(&self, session_id: &str, message_id: &str) -> AppResult<PersistedResults> {
        let path = self.message_path(session_id, message_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found(format!(
                    "no results for message {} in session {}",
                    message_id, session_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Message IDs with persisted results in a session, sorted.
    pub async fn list_messages(&self, session_id: &str) -> AppResult<Vec<String>> {
        let dir = self.root.join(path_component(session_id)?);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    messages.push(stem.to_string());
                }
            }
        }
        messages.sort();
        Ok(messages)
    }
}

#[async_trait]
impl ResultStore for JsonResultStore {
    async fn persist(
        &self,
        session_id: &str,
        message_id: &str,
        items: &[ResultItem],
    ) -> AppResult<()> {
        let path = self.message_path(session_id, message_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let record = PersistedResults {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            items: items.to_vec(),
        };
        let content = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&path, content).await?;

        tracing::debug!(
            "[ResultStore] Wrote {} item(s) to {}",
            items.len(),
            path.display()
        );
        Ok(())
    }
}

/// Keeps persisted batches in memory. Used by the headless binary and tests.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    saved: Mutex<Vec<PersistedResults>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<PersistedResults> {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn items_for(&self, session_id: &str) -> Vec<ResultItem> {
        self.saved()
            .into_iter()
            .filter(|record| record.session_id == session_id)
            .flat_map(|record| record.items)
            .collect()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn persist(
        &self,
        session_id: &str,
        message_id: &str,
        items: &[ResultItem],
    ) -> AppResult<()> {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PersistedResults {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                saved_at: chrono::Utc::now().to_rfc3339(),
                items: items.to_vec(),
            });
        Ok(())
    }
}

/// Reject IDs that would escape the results directory.
fn path_component(id: &str) -> AppResult<&str> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if invalid {
        Err(AppError::validation(format!("invalid identifier for storage: {:?}", id)))
    } else {
        Ok(id)
    }
}
