use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context, Result};

use atlas_core::write_atomic;

use crate::task_registry::{lock_unpoisoned, TaskRegistrySnapshot};

/// Durable storage for the serialized task map: one record per namespace,
/// written on every registry mutation, read once at startup.
pub trait TaskStateStore: Send + Sync {
    /// Loads the snapshot for `namespace`; `None` when nothing was persisted.
    fn load(&self, namespace: &str) -> Result<Option<TaskRegistrySnapshot>>;

    /// Replaces the snapshot for `namespace`.
    fn save(&self, namespace: &str, snapshot: &TaskRegistrySnapshot) -> Result<()>;
}

/// File-backed store keeping one `{namespace}.json` under a state directory.
#[derive(Debug, Clone)]
pub struct FileTaskStateStore {
    state_dir: PathBuf,
}

impl FileTaskStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Returns the snapshot file path backing `namespace`.
    pub fn snapshot_path(&self, namespace: &str) -> PathBuf {
        self.state_dir.join(format!("{namespace}.json"))
    }

    fn validated_path(&self, namespace: &str) -> Result<PathBuf> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            bail!("task store namespace cannot be empty");
        }
        if namespace.contains(['/', '\\']) || namespace == "." || namespace == ".." {
            bail!("task store namespace '{namespace}' is not a valid file stem");
        }
        Ok(self.snapshot_path(namespace))
    }
}

impl TaskStateStore for FileTaskStateStore {
    fn load(&self, namespace: &str) -> Result<Option<TaskRegistrySnapshot>> {
        let path = self.validated_path(namespace)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse task snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    fn save(&self, namespace: &str, snapshot: &TaskRegistrySnapshot) -> Result<()> {
        let path = self.validated_path(namespace)?;
        let payload = serde_json::to_string_pretty(snapshot)
            .context("failed to serialize task snapshot")?;
        write_atomic(path.as_path(), payload.as_str())
    }
}

/// In-memory store for tests and embedders that manage durability themselves.
///
/// Entries round-trip through the same JSON encoding as the file store so
/// serialization regressions surface in memory-backed tests too.
#[derive(Debug, Default)]
pub struct MemoryTaskStateStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryTaskStateStore {
    /// Returns the raw serialized payload for `namespace`, if any.
    pub fn raw_payload(&self, namespace: &str) -> Option<String> {
        lock_unpoisoned(&self.entries).get(namespace).cloned()
    }
}

impl TaskStateStore for MemoryTaskStateStore {
    fn load(&self, namespace: &str) -> Result<Option<TaskRegistrySnapshot>> {
        let entries = lock_unpoisoned(&self.entries);
        let Some(raw) = entries.get(namespace) else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(raw)
            .with_context(|| format!("failed to parse in-memory snapshot for {namespace}"))?;
        Ok(Some(snapshot))
    }

    fn save(&self, namespace: &str, snapshot: &TaskRegistrySnapshot) -> Result<()> {
        let payload =
            serde_json::to_string(snapshot).context("failed to serialize task snapshot")?;
        lock_unpoisoned(&self.entries).insert(namespace.to_string(), payload);
        Ok(())
    }
}

/// Returns the conventional state directory for a given application root.
pub fn default_state_dir(app_root: &Path) -> PathBuf {
    app_root.join("tasks")
}
