//! Worker pool pulling deliveries off the [`MemoryQueue`].
//!
//! Each worker handles one job at a time. A job that fails retryably goes
//! back to the queue, which applies the job type's
//! [`RetryPolicy`](crate::state_machine::RetryPolicy). Shutdown closes the
//! queue, so idle workers exit at once and busy ones exit after their
//! current job.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::processor::JobProcessor;
use crate::queue::{Delivery, MemoryQueue, RetryDecision};

pub struct WorkerPool {
    queue: MemoryQueue,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers on the current runtime.
    pub fn start(queue: MemoryQueue, processor: Arc<JobProcessor>, concurrency: usize) -> Self {
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency.max(1) {
            let queue = queue.clone();
            let processor = processor.clone();
            workers.spawn(async move {
                run_worker(worker_id, queue, processor).await;
            });
        }
        info!(concurrency = workers.len(), "Worker pool started");
        Self { queue, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking deliveries and wait for in-flight jobs to finish.
    pub async fn shutdown(mut self) {
        info!("Worker pool shutting down");
        self.queue.close().await;
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, queue: MemoryQueue, processor: Arc<JobProcessor>) {
    debug!(worker_id, "Worker started");
    while let Some(delivery) = queue.next().await {
        handle_delivery(&queue, &processor, delivery).await;
    }
    debug!(worker_id, "Worker stopped");
}

/// Process one delivery and settle it with the queue.
pub async fn handle_delivery(queue: &MemoryQueue, processor: &JobProcessor, delivery: Delivery) {
    match processor.process(&delivery.job).await {
        Ok(()) => queue.ack(&delivery).await,
        Err(err) => {
            let bot_id = delivery.job.bot_id.clone();
            let job_type = delivery.job.job_type();
            match queue.retry(delivery, &err.to_string()).await {
                RetryDecision::Scheduled { attempt, delay } => {
                    warn!(
                        %bot_id,
                        %job_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Job will be retried"
                    );
                }
                RetryDecision::Exhausted { attempts } => {
                    error!(%bot_id, %job_type, attempts, error = %err, "Job gave up");
                }
            }
        }
    }
}
