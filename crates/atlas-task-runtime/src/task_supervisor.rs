use std::{
    collections::BTreeSet,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{bail, Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::time::Duration;

use crate::{
    completion_bridge::TaskCompletionBridge,
    job_service_client::{JobServiceApi, JobServiceError, JobStatusReport},
    task_registry::{lock_unpoisoned, TaskPatch, TaskRecord, TaskRegistry, TaskStatus},
};

/// Matches the original client's polling cadence.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_500;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Runtime configuration for [`TaskSupervisor`].
pub struct TaskSupervisorConfig {
    pub poll_interval: Duration,
}

impl Default for TaskSupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

struct TaskSupervisorInner {
    config: TaskSupervisorConfig,
    registry: TaskRegistry,
    client: Arc<dyn JobServiceApi>,
    bridge: TaskCompletionBridge,
    poller_running: AtomicBool,
    poll_seq: AtomicU64,
    launching: Mutex<BTreeSet<String>>,
}

/// Launches backend jobs, keeps exactly one polling loop alive while any
/// tracked task is non-terminal, and reconciles local belief against the job
/// service's authoritative status on every tick.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<TaskSupervisorInner>,
}

impl TaskSupervisor {
    pub fn new(
        config: TaskSupervisorConfig,
        registry: TaskRegistry,
        client: Arc<dyn JobServiceApi>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskSupervisorInner {
                config,
                registry,
                client,
                bridge: TaskCompletionBridge::new(),
                poller_running: AtomicBool::new(false),
                poll_seq: AtomicU64::new(0),
                launching: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Returns the registry this supervisor mutates.
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Returns the bridge consumers subscribe to for terminal transitions.
    pub fn completion_bridge(&self) -> &TaskCompletionBridge {
        &self.inner.bridge
    }

    /// Resumes polling for tasks rehydrated from durable storage. A no-op
    /// when every tracked task is already terminal.
    pub fn resume(&self) {
        if self.inner.registry.has_active() {
            self.schedule_poller();
        }
    }

    /// Starts a job of kind `slug`. Fails fast, before any network call,
    /// when the slug already has a non-terminal task; a prior terminal
    /// record for the slug is superseded by the new launch. On backend
    /// rejection no record is created and the error propagates to the
    /// caller.
    pub async fn start(&self, slug: &str, name: &str, params: Value) -> Result<TaskRecord> {
        let slug = slug.trim();
        if slug.is_empty() {
            bail!("task slug must be non-empty");
        }
        // Claim the slug before the network round-trip. The registry gains
        // no record until the launch is acknowledged, so without the claim a
        // second start overlapping the first launch's HTTP call would pass
        // the duplicate check and reach the backend twice.
        {
            let mut launching = lock_unpoisoned(&self.inner.launching);
            if launching.contains(slug) {
                bail!("task '{slug}' already has an active run (launch in flight)");
            }
            if let Some(existing) = self.inner.registry.get(slug) {
                if existing.status.is_active() {
                    bail!(
                        "task '{slug}' already has an active run (status {})",
                        existing.status.as_str()
                    );
                }
            }
            launching.insert(slug.to_string());
        }
        let result = self.launch(slug, name, params).await;
        lock_unpoisoned(&self.inner.launching).remove(slug);
        result
    }

    async fn launch(&self, slug: &str, name: &str, params: Value) -> Result<TaskRecord> {
        let started = self
            .inner
            .client
            .start_job(slug, params)
            .await
            .with_context(|| format!("failed to start job '{slug}'"))?;

        // A leftover terminal record for this slug would keep its old
        // creation time and poll sequence; the new launch replaces it.
        if self
            .inner
            .registry
            .get(slug)
            .is_some_and(|record| record.status.is_terminal())
        {
            self.inner.registry.remove(slug)?;
        }
        let record = self.inner.registry.upsert(
            slug,
            TaskPatch {
                task_id: Some(started.task_id),
                name: Some(name.to_string()),
                status: Some(TaskStatus::Running),
                logs: Some(vec![format!("job start requested: {name}")]),
                show_modal: Some(true),
            },
        )?;
        tracing::info!(slug, task_id = %record.task_id, "background job started");
        self.schedule_poller();
        Ok(record)
    }

    /// Requests cancellation for the slug's task. Fire-and-forget: returns
    /// once the job service acknowledges, and the record moves to
    /// `canceling` until a poll reports the authoritative outcome (which may
    /// still be `completed` when the job wins the race). Returns `Ok(false)`
    /// without a network call when the task is not in a cancellable state,
    /// so a second `cancel` is a no-op.
    pub async fn cancel(&self, slug: &str) -> Result<bool> {
        let Some(record) = self.inner.registry.get(slug) else {
            return Ok(false);
        };
        if !record.status.accepts_cancel_request() {
            return Ok(false);
        }

        match self
            .inner
            .client
            .request_stop(record.task_id.as_str())
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_task_unknown() => {
                tracing::warn!(slug, "stop request hit an unknown task; pruning local record");
                self.inner.registry.remove(slug)?;
                return Ok(false);
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to stop job '{slug}'"));
            }
        }

        self.inner.registry.mutate(slug, |record| {
            if record.status.accepts_cancel_request() {
                record.status = TaskStatus::Canceling;
                record.logs.push("stop requested; waiting for the job to wind down".to_string());
            }
        })?;
        Ok(true)
    }

    /// Dismisses the slug's detail view. A terminal task is removed from the
    /// registry entirely; an active task only has its modal hidden and keeps
    /// running in the background. Returns true when the record was removed.
    pub fn dismiss(&self, slug: &str) -> Result<bool> {
        let Some(record) = self.inner.registry.get(slug) else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            self.inner.registry.remove(slug)?;
            return Ok(true);
        }
        self.inner.registry.mutate(slug, |record| {
            record.show_modal = false;
        })?;
        Ok(false)
    }

    /// Surfaces or hides the slug's detail view without touching job state.
    pub fn set_modal_visible(&self, slug: &str, visible: bool) -> Result<bool> {
        let updated = self.inner.registry.mutate(slug, |record| {
            record.show_modal = visible;
        })?;
        Ok(updated.is_some())
    }

    /// Ensures at most one polling loop is alive, regardless of how many
    /// tasks are non-terminal or how often this is called.
    fn schedule_poller(&self) {
        if self
            .inner
            .poller_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let supervisor = self.clone();
        spawn_supervisor_future(async move {
            supervisor.poll_loop().await;
        });
    }

    async fn poll_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let active = self.inner.registry.active_tasks();
            if active.is_empty() {
                break;
            }

            let seq = self
                .inner
                .poll_seq
                .fetch_add(1, Ordering::SeqCst)
                .saturating_add(1);
            let mut queries = FuturesUnordered::new();
            for record in active {
                let client = self.inner.client.clone();
                queries.push(async move {
                    let result = client.fetch_status(record.task_id.as_str()).await;
                    (record.slug, result)
                });
            }
            // Responses fold in as they arrive; a straggling or failing
            // query for one slug never blocks its siblings.
            while let Some((slug, result)) = queries.next().await {
                self.fold_in(seq, slug.as_str(), result);
            }
        }

        self.inner.poller_running.store(false, Ordering::SeqCst);
        // A start() racing the loop shutdown must not strand its task
        // unpolled.
        if self.inner.registry.has_active() {
            self.schedule_poller();
        }
    }

    /// Merges one polled response into the registry. The backend is the
    /// authority: its status replaces any active local status, including an
    /// optimistic `canceling`. Terminal local records and responses older
    /// than an already-applied poll are left untouched.
    fn fold_in(&self, seq: u64, slug: &str, result: Result<JobStatusReport, JobServiceError>) {
        match result {
            Ok(report) => {
                let mut previous_status = None;
                let outcome = self.inner.registry.mutate(slug, |record| {
                    if record.last_poll_seq > seq || record.status.is_terminal() {
                        return;
                    }
                    previous_status = Some(record.status);
                    record.status = report.status;
                    record.logs = report.logs.clone();
                    record.last_poll_seq = seq;
                });
                if let Err(error) = outcome {
                    tracing::warn!(slug, %error, "failed to persist polled task state");
                    return;
                }
                if let Some(previous) = previous_status {
                    if previous.is_active() && report.status.is_terminal() {
                        tracing::info!(
                            slug,
                            status = report.status.as_str(),
                            "background job reached terminal state"
                        );
                        self.inner.bridge.notify_finished(slug, report.status);
                    }
                }
            }
            Err(error) if error.is_task_unknown() => {
                // Reconciliation rule: the service lost or garbage-collected
                // the task, so retrying forever would never converge.
                tracing::warn!(slug, "job service no longer knows task; pruning local record");
                if let Err(error) = self.inner.registry.remove(slug) {
                    tracing::warn!(slug, %error, "failed to prune unknown task");
                }
            }
            Err(error) => {
                tracing::debug!(slug, %error, "transient poll failure; retrying next tick");
            }
        }
    }
}

fn spawn_supervisor_future<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(future),
            Err(error) => tracing::warn!(%error, "task poller bootstrap failed"),
        }
    });
}
