use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::watch;

use crate::task_registry::TaskStatus;

/// One terminal transition observed by the polling loop. `seq` is monotone,
/// so a watch subscriber that wakes up late can tell how many transitions it
/// coalesced over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCompletionEvent {
    /// 0 until the first transition fires.
    pub seq: u64,
    pub slug: String,
    /// Terminal status reached. `error` travels the same channel as
    /// `completed`; consumers differentiate by this value alone.
    pub status: Option<TaskStatus>,
}

#[derive(Debug)]
struct TaskCompletionBridgeInner {
    finished_total: AtomicU64,
    event_tx: watch::Sender<TaskCompletionEvent>,
}

/// Decouples "a task reached a terminal state" from whatever should refresh
/// or alert afterwards. Fired exactly once per non-terminal → terminal
/// transition; consumers react to the counter or the event stream instead of
/// inspecting raw task state, so polling cadence and log churn never reach
/// them.
#[derive(Debug, Clone)]
pub struct TaskCompletionBridge {
    inner: Arc<TaskCompletionBridgeInner>,
}

impl Default for TaskCompletionBridge {
    fn default() -> Self {
        let (event_tx, _) = watch::channel(TaskCompletionEvent::default());
        Self {
            inner: Arc::new(TaskCompletionBridgeInner {
                finished_total: AtomicU64::new(0),
                event_tx,
            }),
        }
    }
}

impl TaskCompletionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many terminal transitions have fired so far.
    pub fn finished_count(&self) -> u64 {
        self.inner.finished_total.load(Ordering::SeqCst)
    }

    /// Subscribes to terminal-transition events.
    pub fn subscribe(&self) -> watch::Receiver<TaskCompletionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Records one terminal transition and wakes subscribers.
    pub fn notify_finished(&self, slug: &str, status: TaskStatus) {
        let seq = self
            .inner
            .finished_total
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        self.inner.event_tx.send_replace(TaskCompletionEvent {
            seq,
            slug: slug.to_string(),
            status: Some(status),
        });
    }
}
