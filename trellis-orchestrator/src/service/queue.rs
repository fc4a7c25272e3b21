//! In-process job queue
//!
//! A FIFO of queued jobs plus an independent pending-by-id map. Dequeue
//! pops the FIFO but leaves the job in the pending map, so in-flight
//! jobs stay discoverable by id until explicit completion or
//! cancellation. Process-wide singleton, internally synchronized.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use trellis_core::domain::job::QueuedJob;
use uuid::Uuid;

struct QueueInner {
    fifo: VecDeque<QueuedJob>,
    pending: HashMap<Uuid, QueuedJob>,
}

pub struct JobQueue {
    inner: Mutex<QueueInner>,
    arrived: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                pending: HashMap::new(),
            }),
            arrived: Notify::new(),
        }
    }

    /// Append to the FIFO and the pending map
    pub fn enqueue(&self, job: QueuedJob) {
        let mut inner = self.inner.lock().unwrap();
        debug!("Enqueued job for execution {}", job.execution_id);
        inner.pending.insert(job.execution_id, job.clone());
        inner.fifo.push_back(job);
        drop(inner);
        self.arrived.notify_waiters();
    }

    /// Pop the FIFO without blocking; `None` on empty
    ///
    /// The job stays in the pending map until completed or cancelled.
    pub fn dequeue(&self) -> Option<QueuedJob> {
        self.inner.lock().unwrap().fifo.pop_front()
    }

    /// Remove the oldest job satisfying `pred` without blocking
    ///
    /// Jobs ahead of the match stay in place, so a runner that cannot
    /// take the head does not reshuffle the FIFO. The job stays in the
    /// pending map until completed or cancelled.
    pub fn dequeue_matching<F>(&self, pred: F) -> Option<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.fifo.iter().position(|j| pred(j))?;
        inner.fifo.remove(position)
    }

    /// Block up to `timeout` for a job to arrive; `None` if none does
    pub async fn wait_for_job(&self, timeout: Duration) -> Option<QueuedJob> {
        self.wait_for_matching(timeout, |_| true).await
    }

    /// Block up to `timeout` for a job satisfying `pred`
    pub async fn wait_for_matching<F>(&self, timeout: Duration, pred: F) -> Option<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        let deadline = Instant::now() + timeout;

        loop {
            // Subscribe before the check so an enqueue between the two
            // is not missed
            let arrived = self.arrived.notified();

            if let Some(job) = self.dequeue_matching(&pred) {
                return Some(job);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let _ = tokio::time::timeout(remaining, arrived).await;
        }
    }

    /// A dequeued job finished; drop it from the pending map
    pub fn complete(&self, execution_id: Uuid) -> Option<QueuedJob> {
        self.inner.lock().unwrap().pending.remove(&execution_id)
    }

    /// Drop a job from both the FIFO (if still queued) and the pending map
    pub fn cancel(&self, execution_id: Uuid) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().unwrap();
        inner.fifo.retain(|j| j.execution_id != execution_id);
        inner.pending.remove(&execution_id)
    }

    /// Put an in-flight job back on the FIFO (e.g. missed ACK)
    pub fn requeue(&self, execution_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.pending.get(&execution_id).cloned() else {
            return false;
        };
        if inner.fifo.iter().any(|j| j.execution_id == execution_id) {
            return false;
        }
        debug!("Requeued job for execution {}", execution_id);
        inner.fifo.push_back(job);
        drop(inner);
        self.arrived.notify_waiters();
        true
    }

    /// Look up an in-flight or queued job by execution id
    pub fn pending(&self, execution_id: Uuid) -> Option<QueuedJob> {
        self.inner.lock().unwrap().pending.get(&execution_id).cloned()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().fifo.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use trellis_core::domain::job::StepConfig;
    use trellis_core::domain::step::StepKind;

    fn job(id: Uuid) -> QueuedJob {
        QueuedJob::new(
            id,
            format!("{}:0:1", id),
            StepConfig {
                kind: StepKind::Script,
                image: "trellis/step-base:latest".to_string(),
                command: Some("make test".to_string()),
                env: StdHashMap::new(),
                timeout_seconds: Some(300),
                workspace_affinity: "local".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.enqueue(job(a));
        queue.enqueue(job(b));

        assert_eq!(queue.dequeue().unwrap().execution_id, a);
        assert_eq!(queue.dequeue().unwrap().execution_id, b);
        assert!(queue.dequeue().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_leaves_job_pending() {
        let queue = JobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(job(id));

        let dequeued = queue.dequeue().unwrap();
        assert_eq!(dequeued.execution_id, id);
        assert!(queue.pending(id).is_some(), "in-flight job still discoverable");

        queue.complete(id);
        assert!(queue.pending(id).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_job_times_out_empty() {
        let queue = JobQueue::new();
        let got = queue.wait_for_job(Duration::from_millis(30)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_job_sees_concurrent_enqueue() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let id = Uuid::new_v4();

        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_job(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(job(id));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.execution_id, id);
    }

    #[tokio::test]
    async fn test_dequeue_matching_skips_jobs_the_runner_cannot_take() {
        let queue = JobQueue::new();
        let (cuda_id, plain_id) = (Uuid::new_v4(), Uuid::new_v4());
        let mut cuda_job = job(cuda_id);
        cuda_job.required_labels = vec!["cuda".to_string()];
        queue.enqueue(cuda_job);
        queue.enqueue(job(plain_id));

        // A runner without the label takes the later job; the head is untouched
        let got = queue
            .dequeue_matching(|j| j.matches_runner("cpu-box", &[]))
            .unwrap();
        assert_eq!(got.execution_id, plain_id);
        assert_eq!(queue.queued_len(), 1);

        // No second match for that runner, and the head keeps its place
        assert!(queue.dequeue_matching(|j| j.matches_runner("cpu-box", &[])).is_none());
        assert_eq!(queue.dequeue().unwrap().execution_id, cuda_id);
    }

    #[tokio::test]
    async fn test_wait_for_matching_ignores_mismatched_arrivals() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let mut pinned = job(Uuid::new_v4());
        pinned.required_runner_id = Some("rig-7".to_string());
        queue.enqueue(pinned);

        let got = queue
            .wait_for_matching(Duration::from_millis(30), |j| {
                j.matches_runner("rig-8", &[])
            })
            .await;
        assert!(got.is_none());
        assert_eq!(queue.queued_len(), 1, "mismatched job stays queued");
    }

    #[tokio::test]
    async fn test_requeue_after_missed_ack() {
        let queue = JobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(job(id));

        let _inflight = queue.dequeue().unwrap();
        assert_eq!(queue.queued_len(), 0);

        assert!(queue.requeue(id));
        assert_eq!(queue.queued_len(), 1);
        // Still queued: a second requeue must not duplicate it
        assert!(!queue.requeue(id));
        assert_eq!(queue.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_everywhere() {
        let queue = JobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(job(id));

        assert!(queue.cancel(id).is_some());
        assert!(queue.dequeue().is_none());
        assert!(queue.pending(id).is_none());
    }
}
