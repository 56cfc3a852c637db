use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use atlas_core::unix_timestamp_ms;

use crate::task_store::TaskStateStore;

const TASK_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

fn task_snapshot_schema_version() -> u32 {
    TASK_SNAPSHOT_SCHEMA_VERSION
}

/// Enumerates the lifecycle states of a supervised background task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Backend accepted the job but has not started executing it.
    Pending,
    /// Job is executing on the backend.
    Running,
    /// Cancellation was requested; the backend has not confirmed a stop yet.
    Canceling,
    /// Job finished successfully.
    Completed,
    /// Job finished with a failure reported by the backend.
    Error,
    /// Job stopped in response to a cancellation request.
    Cancelled,
}

impl TaskStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Canceling => "canceling",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a status token from the job-service wire format.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "canceling" | "cancelling" => Some(Self::Canceling),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true when the task cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Returns true for states the polling loop still has to refresh.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns true when a cancellation request makes sense for this state.
    pub fn accepts_cancel_request(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// One outstanding or recently finished background job tracked by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    #[serde(default = "task_snapshot_schema_version")]
    pub schema_version: u32,
    /// Stable identifier of the job kind; registry key.
    pub slug: String,
    /// Opaque backend-assigned id, unique per launched job instance.
    pub task_id: String,
    /// Human-readable label fixed at creation.
    pub name: String,
    pub status: TaskStatus,
    /// Latest full log tail reported by the backend. Replaced wholesale on
    /// every fold-in; the backend may coalesce or reorder lines between
    /// polls, so incremental appends would corrupt the narrative.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Whether the task's detail view is currently surfaced. Independent of
    /// job status.
    #[serde(default)]
    pub show_modal: bool,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    /// Sequence of the last poll folded into this record; fold-ins carrying
    /// an older sequence are stale and discarded. Process-local: sequences
    /// restart with the supervisor, so the value is never persisted and
    /// reloads start from zero.
    #[serde(skip)]
    pub last_poll_seq: u64,
}

/// Partial update merged into a task record by [`TaskRegistry::upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub task_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub logs: Option<Vec<String>>,
    pub show_modal: Option<bool>,
}

/// Serialized registry payload persisted once per namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRegistrySnapshot {
    #[serde(default = "task_snapshot_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
}

struct TaskRegistryInner {
    namespace: String,
    store: Arc<dyn TaskStateStore>,
    tasks: Mutex<BTreeMap<String, TaskRecord>>,
    revision_tx: watch::Sender<u64>,
}

/// Shared map of slug → task record; the single source of local truth.
///
/// Every mutation persists the full snapshot through the configured store and
/// bumps a revision watch channel, so durable storage and UI observers stay
/// in sync without inspecting individual records.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<TaskRegistryInner>,
}

impl TaskRegistry {
    /// Rehydrates the registry for `namespace` from the store. Jobs started
    /// before a restart stay tracked; the caller resumes polling afterwards.
    pub fn open(store: Arc<dyn TaskStateStore>, namespace: &str) -> Result<Self> {
        let snapshot = store
            .load(namespace)
            .with_context(|| format!("failed to load task snapshot for namespace {namespace}"))?
            .unwrap_or_default();
        let (revision_tx, _) = watch::channel(0_u64);
        Ok(Self {
            inner: Arc::new(TaskRegistryInner {
                namespace: namespace.to_string(),
                store,
                tasks: Mutex::new(snapshot.tasks),
                revision_tx,
            }),
        })
    }

    /// Returns the persistence namespace this registry is keyed by.
    pub fn namespace(&self) -> &str {
        self.inner.namespace.as_str()
    }

    /// Merges `patch` into the record for `slug`, creating it when absent.
    pub fn upsert(&self, slug: &str, patch: TaskPatch) -> Result<TaskRecord> {
        let mut tasks = lock_unpoisoned(&self.inner.tasks);
        let now = unix_timestamp_ms();
        let record = tasks.entry(slug.to_string()).or_insert_with(|| TaskRecord {
            schema_version: TASK_SNAPSHOT_SCHEMA_VERSION,
            slug: slug.to_string(),
            task_id: String::new(),
            name: slug.to_string(),
            status: TaskStatus::Pending,
            logs: Vec::new(),
            show_modal: false,
            created_unix_ms: now,
            updated_unix_ms: now,
            last_poll_seq: 0,
        });
        apply_patch(record, patch, now);
        let updated = record.clone();
        self.persist_and_notify(&tasks)?;
        Ok(updated)
    }

    /// Read-modify-write for an existing record. The closure runs under the
    /// registry lock, so an interleaved cancellation cannot be lost between
    /// the read and the write. Returns the updated record, or `None` when the
    /// slug is not tracked.
    pub fn mutate<F>(&self, slug: &str, apply: F) -> Result<Option<TaskRecord>>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = lock_unpoisoned(&self.inner.tasks);
        let Some(record) = tasks.get_mut(slug) else {
            return Ok(None);
        };
        apply(record);
        record.updated_unix_ms = unix_timestamp_ms();
        let updated = record.clone();
        self.persist_and_notify(&tasks)?;
        Ok(Some(updated))
    }

    /// Removes the record for `slug`, returning it when it existed.
    pub fn remove(&self, slug: &str) -> Result<Option<TaskRecord>> {
        let mut tasks = lock_unpoisoned(&self.inner.tasks);
        let removed = tasks.remove(slug);
        if removed.is_some() {
            self.persist_and_notify(&tasks)?;
        }
        Ok(removed)
    }

    /// Returns a copy of the record for `slug`.
    pub fn get(&self, slug: &str) -> Option<TaskRecord> {
        lock_unpoisoned(&self.inner.tasks).get(slug).cloned()
    }

    /// Lists all tracked records ordered by creation time, then slug.
    pub fn list(&self) -> Vec<TaskRecord> {
        let tasks = lock_unpoisoned(&self.inner.tasks);
        let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
        records.sort_by(|left, right| {
            left.created_unix_ms
                .cmp(&right.created_unix_ms)
                .then_with(|| left.slug.cmp(&right.slug))
        });
        records
    }

    /// Returns the records the polling loop still has to refresh.
    pub fn active_tasks(&self) -> Vec<TaskRecord> {
        lock_unpoisoned(&self.inner.tasks)
            .values()
            .filter(|record| record.status.is_active())
            .cloned()
            .collect()
    }

    /// Returns true when at least one record is non-terminal.
    pub fn has_active(&self) -> bool {
        lock_unpoisoned(&self.inner.tasks)
            .values()
            .any(|record| record.status.is_active())
    }

    /// Returns the current mutation revision.
    pub fn revision(&self) -> u64 {
        *self.inner.revision_tx.borrow()
    }

    /// Subscribes to mutation revisions; bumped once per registry mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision_tx.subscribe()
    }

    fn persist_and_notify(&self, tasks: &BTreeMap<String, TaskRecord>) -> Result<()> {
        let snapshot = TaskRegistrySnapshot {
            schema_version: TASK_SNAPSHOT_SCHEMA_VERSION,
            tasks: tasks.clone(),
        };
        self.inner
            .store
            .save(self.inner.namespace.as_str(), &snapshot)
            .with_context(|| {
                format!(
                    "failed to persist task snapshot for namespace {}",
                    self.inner.namespace
                )
            })?;
        self.inner.revision_tx.send_modify(|revision| {
            *revision = revision.saturating_add(1);
        });
        Ok(())
    }
}

fn apply_patch(record: &mut TaskRecord, patch: TaskPatch, now: u64) {
    if let Some(task_id) = patch.task_id {
        record.task_id = task_id;
    }
    if let Some(name) = patch.name {
        record.name = name;
    }
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(logs) = patch.logs {
        record.logs = logs;
    }
    if let Some(show_modal) = patch.show_modal {
        record.show_modal = show_modal;
    }
    record.updated_unix_ms = now;
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
