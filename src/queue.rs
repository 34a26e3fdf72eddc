/// Job queue abstraction
///
/// Workers pull `JobDelivery`s, each carrying its attempt number. A failed
/// delivery is retried with exponential backoff (`base * 2^(attempt-1)`) until
/// the configured number of attempts is exhausted. At most one delivery per
/// execution id is in flight at a time, so the same execution is never
/// processed concurrently. Deliveries of paused executions are parked until
/// the execution is resumed.

use crate::error::EngineError;
use crate::runtime::engine::JobAttempt;
use crate::workflow::types::ExecutionJob;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Exhausted executions remembered for inspection, newest last
const EXHAUSTED_HISTORY: usize = 100;

/// Retry policy applied to failed deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `failed_attempt` (1-based) failed
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

/// One delivery of a job to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct JobDelivery {
    pub job: ExecutionJob,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobDelivery {
    pub fn attempt_info(&self) -> JobAttempt {
        JobAttempt::new(self.attempt, self.max_attempts)
    }
}

/// What the queue did with a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    Exhausted,
}

/// Queue counters for the monitoring API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub parked: usize,
    /// Executions whose attempts ran out since startup
    pub exhausted: u64,
}

/// Source of job deliveries for the worker pool
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Add a new job as its first attempt
    async fn enqueue(&self, job: ExecutionJob) -> anyhow::Result<()>;

    /// Wait for the next delivery; `None` once the queue is closed and drained
    async fn next(&self) -> Option<JobDelivery>;

    /// Acknowledge a delivery that finished without error
    async fn complete(&self, delivery: &JobDelivery);

    /// Report a failed delivery; the queue schedules a retry if attempts remain
    async fn fail(&self, delivery: JobDelivery, error: &EngineError) -> RetryDecision;

    /// Hold the delivery of a paused execution until it is resumed
    async fn park(&self, delivery: JobDelivery);

    /// Queue the parked delivery of an execution again
    ///
    /// Returns `false` when nothing was parked for it.
    async fn unpark(&self, execution_id: &str) -> bool;

    /// Drop the parked delivery of an execution that will not resume
    async fn discard_parked(&self, execution_id: &str) -> bool;

    fn stats(&self) -> QueueStats;
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<JobDelivery>,
    in_flight: HashSet<String>,
    delayed: usize,
    parked: HashMap<String, JobDelivery>,
    exhausted_total: u64,
    recent_exhausted: VecDeque<(String, String)>,
    closed: bool,
}

enum Take {
    Ready(JobDelivery),
    Empty,
    Drained,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn push(&self, delivery: JobDelivery) {
        self.state.lock().waiting.push_back(delivery);
        self.notify.notify_one();
    }

    /// Wake a waiter after an execution left flight; every waiter once closed
    fn release(&self, execution_id: &str) {
        let closed = {
            let mut state = self.state.lock();
            state.in_flight.remove(execution_id);
            state.closed
        };
        if closed {
            self.notify.notify_waiters();
        } else {
            self.notify.notify_one();
        }
    }
}

/// In-process job queue with delayed retries
#[derive(Clone)]
pub struct InMemoryJobQueue {
    shared: Arc<Shared>,
    policy: RetryPolicy,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Stop accepting jobs; `next` returns `None` once the queue drains
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Most recent execution ids whose attempts ran out, with the last error
    pub fn exhausted(&self) -> Vec<(String, String)> {
        self.shared.state.lock().recent_exhausted.iter().cloned().collect()
    }

    /// Take the first waiting delivery whose execution is not in flight
    fn try_take(&self) -> Take {
        let mut state = self.shared.state.lock();
        let position = state
            .waiting
            .iter()
            .position(|delivery| !state.in_flight.contains(&delivery.job.execution_id));

        if let Some(delivery) = position.and_then(|position| state.waiting.remove(position)) {
            state.in_flight.insert(delivery.job.execution_id.clone());
            return Take::Ready(delivery);
        }
        if state.closed && state.waiting.is_empty() && state.delayed == 0 && state.in_flight.is_empty() {
            return Take::Drained;
        }
        Take::Empty
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: ExecutionJob) -> anyhow::Result<()> {
        if self.shared.state.lock().closed {
            return Err(anyhow::anyhow!("Queue is closed"));
        }
        tracing::debug!("📥 Enqueued execution {}", job.execution_id);
        self.shared.push(JobDelivery {
            job,
            attempt: 1,
            max_attempts: self.policy.attempts.max(1),
        });
        Ok(())
    }

    async fn next(&self) -> Option<JobDelivery> {
        loop {
            let notified = self.shared.notify.notified();
            match self.try_take() {
                Take::Ready(delivery) => return Some(delivery),
                Take::Empty => notified.await,
                Take::Drained => return None,
            }
        }
    }

    async fn complete(&self, delivery: &JobDelivery) {
        self.shared.release(&delivery.job.execution_id);
    }

    async fn fail(&self, delivery: JobDelivery, error: &EngineError) -> RetryDecision {
        let execution_id = delivery.job.execution_id.clone();

        if delivery.attempt >= delivery.max_attempts {
            {
                let mut state = self.shared.state.lock();
                state.exhausted_total += 1;
                if state.recent_exhausted.len() == EXHAUSTED_HISTORY {
                    state.recent_exhausted.pop_front();
                }
                state
                    .recent_exhausted
                    .push_back((execution_id.clone(), error.to_string()));
            }
            self.shared.release(&execution_id);
            tracing::error!(
                "❌ Execution {} exhausted {} attempt(s): {}",
                execution_id,
                delivery.max_attempts,
                error
            );
            return RetryDecision::Exhausted;
        }

        let delay = self.policy.backoff(delivery.attempt);
        let next_attempt = delivery.attempt + 1;
        {
            // Stays in flight until the retry is queued
            let mut state = self.shared.state.lock();
            state.delayed += 1;
        }
        tracing::warn!(
            "🔁 Retrying execution {} in {:?} (attempt {}/{})",
            execution_id,
            delay,
            next_attempt,
            delivery.max_attempts
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.state.lock();
                state.delayed -= 1;
                state.in_flight.remove(&delivery.job.execution_id);
            }
            shared.push(JobDelivery {
                attempt: next_attempt,
                ..delivery
            });
        });

        RetryDecision::Retry { next_attempt, delay }
    }

    async fn park(&self, delivery: JobDelivery) {
        let execution_id = delivery.job.execution_id.clone();
        tracing::debug!("⏸️ Parked execution {}", execution_id);
        self.shared
            .state
            .lock()
            .parked
            .insert(execution_id.clone(), delivery);
        self.shared.release(&execution_id);
    }

    async fn unpark(&self, execution_id: &str) -> bool {
        let Some(delivery) = self.shared.state.lock().parked.remove(execution_id) else {
            return false;
        };
        tracing::debug!("▶️ Unparked execution {}", execution_id);
        self.shared.push(delivery);
        true
    }

    async fn discard_parked(&self, execution_id: &str) -> bool {
        self.shared.state.lock().parked.remove(execution_id).is_some()
    }

    fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            waiting: state.waiting.len(),
            delayed: state.delayed,
            in_flight: state.in_flight.len(),
            parked: state.parked.len(),
            exhausted: state.exhausted_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(execution_id: &str) -> ExecutionJob {
        serde_json::from_value(json!({
            "executionId": execution_id,
            "workflowId": "wf",
            "userId": "u1",
            "nodes": [{"id": "a", "type": "set"}]
        }))
        .unwrap()
    }

    fn failure() -> EngineError {
        EngineError::NodeExecution {
            node_id: "a".to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            attempts: 3,
            backoff_base: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_retried_after_backoff() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(job("e1")).await.unwrap();

        let first = queue.next().await.unwrap();
        assert_eq!(first.attempt, 1);
        assert!(!first.attempt_info().is_final());

        let decision = queue.fail(first, &failure()).await;
        assert_eq!(
            decision,
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(queue.stats().delayed, 1);

        let second = queue.next().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.stats().delayed, 0);
    }

    #[tokio::test]
    async fn test_final_failure_is_exhausted() {
        let queue = InMemoryJobQueue::new(RetryPolicy {
            attempts: 1,
            backoff_base: Duration::from_millis(10),
        });
        queue.enqueue(job("e1")).await.unwrap();

        let delivery = queue.next().await.unwrap();
        assert!(delivery.attempt_info().is_final());
        assert_eq!(queue.fail(delivery, &failure()).await, RetryDecision::Exhausted);
        assert_eq!(queue.exhausted()[0].0, "e1");
        assert_eq!(queue.stats().in_flight, 0);
        assert_eq!(queue.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_exhausted_records_are_bounded() {
        let queue = InMemoryJobQueue::new(RetryPolicy {
            attempts: 1,
            backoff_base: Duration::from_millis(10),
        });
        for i in 0..EXHAUSTED_HISTORY + 5 {
            queue.enqueue(job(&format!("e{}", i))).await.unwrap();
            let delivery = queue.next().await.unwrap();
            queue.fail(delivery, &failure()).await;
        }

        let recent = queue.exhausted();
        assert_eq!(recent.len(), EXHAUSTED_HISTORY);
        assert_eq!(recent[0].0, "e5");
        assert_eq!(queue.stats().exhausted, (EXHAUSTED_HISTORY + 5) as u64);
    }

    #[tokio::test]
    async fn test_parked_delivery_waits_for_unpark() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(job("e1")).await.unwrap();

        let delivery = queue.next().await.unwrap();
        queue.park(delivery).await;
        let stats = queue.stats();
        assert_eq!((stats.parked, stats.in_flight, stats.waiting), (1, 0, 0));

        assert!(queue.unpark("e1").await);
        assert!(!queue.unpark("e1").await);
        let resumed = queue.next().await.unwrap();
        assert_eq!(resumed.job.execution_id, "e1");
        assert_eq!(resumed.attempt, 1);

        queue.park(resumed).await;
        assert!(queue.discard_parked("e1").await);
        assert!(!queue.unpark("e1").await);
        assert_eq!(queue.stats().parked, 0);
    }

    #[tokio::test]
    async fn test_one_delivery_per_execution_in_flight() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(job("e1")).await.unwrap();
        queue.enqueue(job("e1")).await.unwrap();
        queue.enqueue(job("e2")).await.unwrap();

        let first = queue.next().await.unwrap();
        let second = queue.next().await.unwrap();
        assert_eq!(first.job.execution_id, "e1");
        assert_eq!(second.job.execution_id, "e2");

        queue.complete(&first).await;
        let third = queue.next().await.unwrap();
        assert_eq!(third.job.execution_id, "e1");
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = InMemoryJobQueue::default();
        queue.enqueue(job("e1")).await.unwrap();
        queue.close();

        assert!(queue.enqueue(job("e2")).await.is_err());
        let delivery = queue.next().await.unwrap();
        queue.complete(&delivery).await;
        assert!(queue.next().await.is_none());
    }
}
