//! Worker loop that feeds queued jobs to one backend instance.

use std::sync::Arc;
use std::time::Duration;

use modelgate_backends::ModelBackend;
use modelgate_common::Record;

use super::queue::{Job, JobQueue};
use super::PoolError;
use crate::metrics::Metrics;

/// Polling interval used alongside queue notifications.
const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// One worker. It owns its backend instance exclusively; jobs it takes are
/// started in the order they were queued.
pub struct Worker {
    pub id: usize,
    pub pool: String,
    pub queue: Arc<JobQueue>,
    pub backend: Arc<dyn ModelBackend>,
    /// Largest batch this worker assembles; 1 disables batching.
    pub batch_limit: usize,
    pub batch_window: Duration,
    pub metrics: Arc<Metrics>,
}

impl Worker {
    /// Run until the queue is closed.
    pub async fn run(self) {
        tracing::debug!(pool = %self.pool, worker = self.id, "Worker started");

        loop {
            if self.queue.is_closed() {
                break;
            }

            let jobs = if self.batch_limit > 1 {
                self.next_batch().await
            } else {
                self.queue.take_one().into_iter().collect()
            };

            if jobs.is_empty() {
                // Wait for notification or timeout (for periodic re-checks)
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                }
                continue;
            }

            self.execute(jobs).await;
        }

        self.backend.close();
        tracing::debug!(pool = %self.pool, worker = self.id, "Worker stopped");
    }

    /// Wait up to the batch window for the front run of same-shape jobs to
    /// fill, then take it.
    async fn next_batch(&self) -> Vec<Job> {
        loop {
            let Some((run, age)) = self.queue.ready_run(self.batch_limit) else {
                return Vec::new();
            };
            if run >= self.batch_limit || age >= self.batch_window || self.queue.is_closed() {
                break;
            }
            let wait = (self.batch_window - age).min(CHECK_INTERVAL);
            tokio::select! {
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.queue.take_batch(self.batch_limit)
    }

    async fn execute(&self, jobs: Vec<Job>) {
        let size = jobs.len();
        self.metrics.record_batch(&self.pool, size);

        let (inputs, waiters): (Vec<Record>, Vec<_>) =
            jobs.into_iter().map(|job| (job.input, job.respond)).unzip();

        let backend = self.backend.clone();
        let outcome = tokio::task::spawn_blocking(move || backend.run(&inputs)).await;

        let results: Vec<Result<Record, PoolError>> = match outcome {
            Ok(Ok(outputs)) if outputs.len() == size => outputs.into_iter().map(Ok).collect(),
            Ok(Ok(outputs)) => {
                let detail = format!("backend returned {} outputs for {} inputs", outputs.len(), size);
                vec![Err(PoolError::Backend(detail)); size]
            }
            Ok(Err(e)) => vec![Err(PoolError::Backend(e.to_string())); size],
            Err(e) => vec![Err(PoolError::Backend(format!("backend task panicked: {}", e))); size],
        };

        for (waiter, result) in waiters.into_iter().zip(results) {
            // Send response back to caller (ignore if receiver dropped)
            let _ = waiter.send(result);
        }
    }
}
