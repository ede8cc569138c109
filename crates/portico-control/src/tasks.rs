//! Task tracking for per-domain background work
//!
//! Verification and issuance run as independent tasks keyed by domain id. At
//! most one task per domain is in flight; a bounded pool of permits caps how
//! many run at once. Deleting a domain cancels its task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct TrackedTask {
    token: CancellationToken,
    generation: u64,
    label: &'static str,
}

/// Tracks background tasks associated with domains
pub struct TaskTracker {
    /// Map of domain_id -> running task
    tasks: Mutex<HashMap<String, TrackedTask>>,
    permits: Arc<Semaphore>,
    running: tokio_util::task::TaskTracker,
    next_generation: Mutex<u64>,
    weak_self: Weak<TaskTracker>,
}

impl TaskTracker {
    /// Create a tracker running at most `max_concurrent` tasks at a time
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            tasks: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: tokio_util::task::TaskTracker::new(),
            next_generation: Mutex::new(0),
            weak_self: weak.clone(),
        })
    }

    /// Spawn `work` for `domain_id` unless a task for it is already in flight.
    ///
    /// Returns `false` when refused. The task waits for a worker permit first;
    /// cancellation drops `work` at its next await point.
    pub fn spawn<F>(&self, domain_id: &str, label: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with_result(domain_id, label, work).is_some()
    }

    /// Like [`spawn`](Self::spawn), handing back the output of `work`.
    ///
    /// The domain's slot is released before the output is sent, so a caller
    /// that awaits the receiver can immediately schedule more work for it.
    /// The receiver errors when the task is cancelled.
    pub fn spawn_with_result<F, T>(
        &self,
        domain_id: &str,
        label: &'static str,
        work: F,
    ) -> Option<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.running.is_closed() {
            return None;
        }
        let mut tasks = self.tasks.lock().ok()?;
        if let Some(existing) = tasks.get(domain_id) {
            debug!(domain_id = %domain_id, running = existing.label, requested = label, "Task already in flight");
            return None;
        }

        let generation = {
            let mut next = self.next_generation.lock().ok()?;
            *next += 1;
            *next
        };
        let token = CancellationToken::new();
        tasks.insert(
            domain_id.to_string(),
            TrackedTask {
                token: token.clone(),
                generation,
                label,
            },
        );
        drop(tasks);

        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();
        let tracker = self.weak_self.clone();
        let key = domain_id.to_string();
        self.running.spawn(async move {
            let permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let mut output = None;
            if let Some(_permit) = permit {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(domain_id = %key, task = label, "Task cancelled");
                    }
                    value = work => output = Some(value),
                }
            }
            if let Some(tracker) = tracker.upgrade() {
                tracker.finish(&key, generation);
            }
            if let Some(value) = output {
                let _ = tx.send(value);
            }
        });
        Some(rx)
    }

    fn finish(&self, domain_id: &str, generation: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if tasks
                .get(domain_id)
                .is_some_and(|t| t.generation == generation)
            {
                tasks.remove(domain_id);
            }
        }
    }

    /// Cancel the task for a domain, if any
    pub fn cancel(&self, domain_id: &str) -> bool {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(task) = tasks.remove(domain_id) {
                task.token.cancel();
                debug!(domain_id = %domain_id, task = task.label, "Cancelled in-flight task");
                return true;
            }
        }
        false
    }

    pub fn is_running(&self, domain_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(domain_id))
            .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Refuse new work, cancel what is queued or running, and wait for it to stop
    pub async fn shutdown(&self) {
        self.running.close();
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.token.cancel();
            }
        }
        self.running.wait().await;
    }

    /// Wait until every spawned task has finished, without cancelling
    pub async fn idle(&self) {
        loop {
            if self.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_refuses_duplicate_work_for_domain() {
        let tracker = TaskTracker::new(4);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        assert!(tracker.spawn("d1", "verify", async move {
            let _ = rx.await;
        }));
        assert!(!tracker.spawn("d1", "issue", async {}));
        assert!(tracker.spawn("d2", "verify", async {}));

        tx.send(()).unwrap();
        tracker.idle().await;
        assert!(tracker.spawn("d1", "issue", async {}));
        tracker.idle().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_task() {
        let tracker = TaskTracker::new(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        tracker.spawn("d1", "verify", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            done.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tracker.is_running("d1"));
        assert!(tracker.cancel("d1"));
        assert!(!tracker.is_running("d1"));

        tracker.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let tracker = TaskTracker::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            tracker.spawn(&format!("d{i}"), "verify", async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tracker.idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let tracker = TaskTracker::new(1);
        tracker.shutdown().await;
        assert!(!tracker.spawn("d1", "verify", async {}));
    }
}
