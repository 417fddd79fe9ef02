//! Job delivery.
//!
//! [`JobQueue`] is the producer side the processor uses to schedule follow-up
//! jobs. [`MemoryQueue`] is an in-process at-least-once substrate: workers
//! pull [`Delivery`] values, then either [`ack`](MemoryQueue::ack) them or
//! hand them back through [`retry`](MemoryQueue::retry), which reschedules
//! with exponential backoff per [`RetryPolicy`] until attempts run out.
//!
//! A job enqueued with a [`job_key`](EnqueueOptions::job_key) is dropped
//! while another pending job carries the same key.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::state_machine::{Job, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// How long to wait before the job becomes deliverable.
    pub delay: Duration,
    /// Deduplication key. Only one pending job per key is kept.
    pub job_key: Option<String>,
}

impl EnqueueOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            job_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job, options: EnqueueOptions) -> Result<(), QueueError>;
}

/// One delivery attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub job: Job,
    /// 1 on first delivery.
    pub attempt: u32,
}

/// What happened to a delivery handed back with [`MemoryQueue::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// A job waiting in the queue, as seen by [`MemoryQueue::scheduled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job: Job,
    pub delay: Duration,
    pub attempt: u32,
}

/// A job that used up all its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub job: Job,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug)]
struct Entry {
    ready_at: Instant,
    seq: u64,
    delay: Duration,
    key: Option<String>,
    delivery: Delivery,
}

// Min-heap on (ready_at, seq).
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.ready_at, other.seq).cmp(&(self.ready_at, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<Entry>,
    next_seq: u64,
    next_id: u64,
    in_flight: usize,
    completed: usize,
    failed: Vec<FailedJob>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, delivery: Delivery, delay: Duration, key: Option<String>) {
        self.next_seq += 1;
        self.pending.push(Entry {
            ready_at: Instant::now() + delay,
            seq: self.next_seq,
            delay,
            key,
            delivery,
        });
    }

    fn has_pending_key(&self, key: &str) -> bool {
        self.pending.iter().any(|e| e.key.as_deref() == Some(key))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next deliverable job. Returns `None` once the queue is
    /// closed; jobs still pending at that point are never delivered.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                match state.pending.peek().map(|e| e.ready_at) {
                    Some(ready_at) if ready_at <= now => {
                        let entry = state.pending.pop()?;
                        state.in_flight += 1;
                        return Some(entry.delivery);
                    }
                    Some(ready_at) => Some(ready_at - now),
                    None => None,
                }
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a delivery as done.
    pub async fn ack(&self, _delivery: &Delivery) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.completed += 1;
    }

    /// Hand a failed delivery back for redelivery according to its job
    /// type's retry policy.
    pub async fn retry(&self, delivery: Delivery, error: &str) -> RetryDecision {
        let policy = RetryPolicy::for_job(delivery.job.job_type());
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);

        if !policy.allows_retry(delivery.attempt) {
            warn!(
                bot_id = %delivery.job.bot_id,
                job_type = %delivery.job.job_type(),
                attempts = delivery.attempt,
                error,
                "Job exhausted its retries"
            );
            let attempts = delivery.attempt;
            state.failed.push(FailedJob {
                job: delivery.job,
                attempts,
                error: error.to_string(),
            });
            return RetryDecision::Exhausted { attempts };
        }

        let delay = Duration::from_millis(policy.delay_for_attempt(delivery.attempt));
        let attempt = delivery.attempt + 1;
        debug!(
            bot_id = %delivery.job.bot_id,
            job_type = %delivery.job.job_type(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling redelivery"
        );
        state.push(
            Delivery {
                attempt,
                ..delivery
            },
            delay,
            None,
        );
        drop(state);
        self.notify.notify_one();
        RetryDecision::Scheduled { attempt, delay }
    }

    /// Stop handing out deliveries and wake every waiting consumer.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Jobs not yet delivered, earliest first.
    pub async fn scheduled(&self) -> Vec<ScheduledJob> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.pending.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| ScheduledJob {
                job: e.delivery.job.clone(),
                delay: e.delay,
                attempt: e.delivery.attempt,
            })
            .collect()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    pub async fn completed(&self) -> usize {
        self.state.lock().await.completed
    }

    pub async fn failed(&self) -> Vec<FailedJob> {
        self.state.lock().await.failed.clone()
    }

    /// Drop every pending job. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let n = state.pending.len();
        state.pending.clear();
        n
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job, options: EnqueueOptions) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(key) = options.job_key.as_deref()
            && state.has_pending_key(key)
        {
            debug!(bot_id = %job.bot_id, job_key = key, "Job with this key already pending, dropping");
            return Ok(());
        }
        state.next_id += 1;
        let id = state.next_id;
        debug!(
            bot_id = %job.bot_id,
            job_type = %job.job_type(),
            delay_ms = options.delay.as_millis() as u64,
            "Enqueued job"
        );
        state.push(
            Delivery {
                id,
                job,
                attempt: 1,
            },
            options.delay,
            options.job_key,
        );
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}
