//! Backend pools.
//!
//! A pool owns the backend instances of one model stage and decides who may
//! run them. SEQUENTIAL and BATCHED pools put jobs on a bounded queue that
//! `workers` tasks drain, each with its own backend instance. INPLACE pools
//! share one reentrant instance and run it on the caller's task, gated by a
//! semaphore.

pub mod queue;
pub mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use modelgate_backends::{BackendError, BackendRegistry, ModelBackend};
use modelgate_common::Record;

use crate::config::{InferenceMode, ParallelInferenceConfig};
use crate::metrics::Metrics;

use self::queue::JobQueue;
use self::worker::Worker;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("backend queue is full")]
    Overloaded,

    #[error("deadline exceeded while waiting for the backend")]
    DeadlineExceeded,

    #[error("backend pool is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

enum Mode {
    Queued {
        queue: Arc<JobQueue>,
        workers: Mutex<Vec<JoinHandle<()>>>,
    },
    Inplace {
        backend: Arc<dyn ModelBackend>,
        permits: Arc<Semaphore>,
        /// Callers waiting for a permit; bounded by `queue_limit`.
        waiting: Arc<AtomicUsize>,
        queue_limit: usize,
    },
}

pub struct BackendPool {
    name: String,
    kind: String,
    mode: Mode,
}

/// Create `count` instances of `kind` and load each off the async runtime.
async fn load_instances(
    registry: &BackendRegistry,
    kind: &str,
    model_path: Option<&Path>,
    count: usize,
) -> Result<Vec<Box<dyn ModelBackend>>, BackendError> {
    let mut loaded = Vec::with_capacity(count);
    for _ in 0..count {
        let mut backend = registry.create(kind)?;
        let path = model_path.map(Path::to_path_buf);
        let backend = tokio::task::spawn_blocking(move || {
            backend.load(path.as_deref())?;
            Ok::<_, BackendError>(backend)
        })
        .await
        .map_err(|e| BackendError::LoadFailed(format!("load task panicked: {}", e)))??;
        loaded.push(backend);
    }
    Ok(loaded)
}

impl BackendPool {
    /// Load the backend instances and start the workers. `name` labels the
    /// pool in logs and metrics.
    pub async fn start(
        name: &str,
        registry: &BackendRegistry,
        kind: &str,
        model_path: Option<&Path>,
        settings: &ParallelInferenceConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BackendError> {
        let depth = metrics.queue_gauge(name);

        let mode = match settings.inference_mode {
            InferenceMode::Inplace => {
                let backend: Arc<dyn ModelBackend> = load_instances(registry, kind, model_path, 1)
                    .await?
                    .pop()
                    .map(Arc::from)
                    .ok_or_else(|| BackendError::LoadFailed(format!("no '{}' instance was created", kind)))?;
                if !backend.reentrant() && settings.workers > 1 {
                    return Err(BackendError::LoadFailed(format!(
                        "backend '{}' is not reentrant; INPLACE mode needs workers = 1",
                        kind
                    )));
                }
                depth.store(0, Ordering::Relaxed);
                Mode::Inplace {
                    backend,
                    permits: Arc::new(Semaphore::new(settings.workers)),
                    waiting: depth,
                    queue_limit: settings.queue_limit,
                }
            }
            InferenceMode::Sequential | InferenceMode::Batched => {
                let instances = load_instances(registry, kind, model_path, settings.workers).await?;
                let queue = Arc::new(JobQueue::new(settings.queue_limit, depth));
                let batch_limit = match settings.inference_mode {
                    InferenceMode::Batched => settings.batch_limit.max(1),
                    _ => 1,
                };

                let workers = instances
                    .into_iter()
                    .enumerate()
                    .map(|(id, backend)| {
                        let backend: Arc<dyn ModelBackend> = Arc::from(backend);
                        let batch_limit = backend
                            .max_batch_hint()
                            .map(|hint| batch_limit.min(hint.max(1)))
                            .unwrap_or(batch_limit);
                        let worker = Worker {
                            id,
                            pool: name.to_string(),
                            queue: queue.clone(),
                            backend,
                            batch_limit,
                            batch_window: Duration::from_millis(settings.batch_window_ms),
                            metrics: metrics.clone(),
                        };
                        tokio::spawn(worker.run())
                    })
                    .collect();

                Mode::Queued {
                    queue,
                    workers: Mutex::new(workers),
                }
            }
        };

        tracing::info!(
            pool = %name,
            backend = %kind,
            mode = ?settings.inference_mode,
            workers = settings.workers,
            queue_limit = settings.queue_limit,
            "Backend pool started"
        );

        Ok(Self {
            name: name.to_string(),
            kind: kind.to_string(),
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        match &self.mode {
            Mode::Queued { queue, .. } => queue.len(),
            Mode::Inplace { waiting, .. } => waiting.load(Ordering::Relaxed),
        }
    }

    /// Run one record through the backend. Waiting stops at `deadline`; a
    /// job still queued at that point is removed so it never reaches the
    /// backend.
    pub async fn submit(&self, input: Record, deadline: Instant) -> Result<Record, PoolError> {
        match &self.mode {
            Mode::Queued { queue, .. } => {
                let (id, rx) = queue.enqueue(input, deadline)?;
                let _slot = QueueSlot { queue, id };
                match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(PoolError::Closed),
                    Err(_) => Err(PoolError::DeadlineExceeded),
                }
            }
            Mode::Inplace {
                backend,
                permits,
                waiting,
                queue_limit,
            } => {
                let permit = match permits.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        if waiting.fetch_add(1, Ordering::AcqRel) >= *queue_limit {
                            waiting.fetch_sub(1, Ordering::AcqRel);
                            return Err(PoolError::Overloaded);
                        }
                        let _waiting = WaitingSlot(waiting);
                        match tokio::time::timeout_at(deadline, permits.clone().acquire_owned()).await {
                            Ok(Ok(permit)) => permit,
                            Ok(Err(_)) => return Err(PoolError::Closed),
                            Err(_) => return Err(PoolError::DeadlineExceeded),
                        }
                    }
                };

                let backend = backend.clone();
                let task = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    backend.run(std::slice::from_ref(&input))
                });
                match tokio::time::timeout_at(deadline, task).await {
                    Ok(Ok(Ok(mut outputs))) if outputs.len() == 1 => Ok(outputs.remove(0)),
                    Ok(Ok(Ok(outputs))) => Err(PoolError::Backend(format!(
                        "backend returned {} outputs for 1 input",
                        outputs.len()
                    ))),
                    Ok(Ok(Err(e))) => Err(PoolError::Backend(e.to_string())),
                    Ok(Err(e)) => Err(PoolError::Backend(format!("backend task panicked: {}", e))),
                    Err(_) => Err(PoolError::DeadlineExceeded),
                }
            }
        }
    }

    /// Stop the workers and release the backends. Pending jobs fail with
    /// `Closed`; a job already running finishes first.
    pub async fn close(&self) {
        match &self.mode {
            Mode::Queued { queue, workers } => {
                queue.close();
                let handles: Vec<_> = workers.lock().drain(..).collect();
                for handle in handles {
                    if let Err(e) = handle.await {
                        tracing::warn!(pool = %self.name, "Worker ended abnormally: {}", e);
                    }
                }
            }
            Mode::Inplace { backend, permits, .. } => {
                permits.close();
                backend.close();
            }
        }
        tracing::info!(pool = %self.name, "Backend pool closed");
    }
}

/// Removes the caller's job from the queue if it is still pending when the
/// caller stops waiting (deadline, disconnect, or completion).
struct QueueSlot<'a> {
    queue: &'a JobQueue,
    id: u64,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.queue.remove(self.id) {
            tracing::debug!(job = self.id, "Removed abandoned job from queue");
        }
    }
}

struct WaitingSlot<'a>(&'a AtomicUsize);

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{counting_registry, slow_registry};
    use modelgate_common::{Tensor, Value};

    fn settings(mode: InferenceMode, workers: usize, queue_limit: usize, batch_limit: usize) -> ParallelInferenceConfig {
        ParallelInferenceConfig {
            workers,
            queue_limit,
            batch_limit,
            inference_mode: mode,
            batch_window_ms: 20,
        }
    }

    fn input(v: f32) -> Record {
        Record::new()
            .with("x", Tensor::from_f32(vec![1], &[v]).unwrap())
            .unwrap()
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&[]))
    }

    #[tokio::test]
    async fn test_sequential_runs_job() {
        let registry = BackendRegistry::with_builtin();
        let pool = BackendPool::start(
            "echo",
            &registry,
            "identity",
            None,
            &settings(InferenceMode::Sequential, 1, 4, 1),
            metrics(),
        )
        .await
        .unwrap();

        let output = pool.submit(input(1.5), in_secs(5)).await.unwrap();
        assert_eq!(output.get("x"), input(1.5).get("x"));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_unknown_backend_kind() {
        let registry = BackendRegistry::with_builtin();
        let result = BackendPool::start(
            "m",
            &registry,
            "onnx",
            None,
            &settings(InferenceMode::Sequential, 1, 4, 1),
            metrics(),
        )
        .await;
        assert!(matches!(result, Err(BackendError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn test_overload_when_queue_full() {
        let registry = slow_registry(Duration::from_millis(300));
        let pool = Arc::new(
            BackendPool::start(
                "slow",
                &registry,
                "slow",
                None,
                &settings(InferenceMode::Sequential, 1, 1, 1),
                metrics(),
            )
            .await
            .unwrap(),
        );

        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(input(1.0), in_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(input(2.0), in_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(pool.submit(input(3.0), in_secs(5)).await, Err(PoolError::Overloaded)));
        assert!(running.await.unwrap().is_ok());
        assert!(queued.await.unwrap().is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_deadline_releases_queue_slot() {
        let metrics = metrics();
        let registry = slow_registry(Duration::from_millis(300));
        let pool = BackendPool::start(
            "slow",
            &registry,
            "slow",
            None,
            &settings(InferenceMode::Sequential, 1, 4, 1),
            metrics.clone(),
        )
        .await
        .unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let (a, b) = tokio::join!(pool.submit(input(1.0), deadline), pool.submit(input(2.0), deadline));
        assert!(matches!(a, Err(PoolError::DeadlineExceeded)));
        assert!(matches!(b, Err(PoolError::DeadlineExceeded)));
        assert_eq!(pool.pending(), 0);
        assert_eq!(metrics.queue_depth("slow"), Some(0));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_batched_mode_coalesces_same_shape() {
        let metrics = metrics();
        let (registry, calls) = counting_registry();
        let pool = Arc::new(
            BackendPool::start(
                "batch",
                &registry,
                "counting",
                None,
                &settings(InferenceMode::Batched, 1, 16, 4),
                metrics.clone(),
            )
            .await
            .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(input(i as f32), in_secs(5)).await })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let output = handle.await.unwrap().unwrap();
            // results fan out in submission order
            assert_eq!(output.get("x"), Some(&Value::Tensor(Tensor::from_f32(vec![1], &[i as f32]).unwrap())));
        }
        assert!(calls.load(Ordering::SeqCst) < 4);
        assert!(metrics.render().contains("modelgate_batch_size"));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_inplace_rejects_non_reentrant_with_many_workers() {
        let registry = slow_registry(Duration::from_millis(1));
        let result = BackendPool::start(
            "slow",
            &registry,
            "slow",
            None,
            &settings(InferenceMode::Inplace, 2, 4, 1),
            metrics(),
        )
        .await;
        assert!(matches!(result, Err(BackendError::LoadFailed(_))));
    }

    #[tokio::test]
    async fn test_inplace_overload() {
        let registry = slow_registry(Duration::from_millis(200));
        let pool = Arc::new(
            BackendPool::start(
                "slow",
                &registry,
                "slow",
                None,
                &settings(InferenceMode::Inplace, 1, 1, 1),
                metrics(),
            )
            .await
            .unwrap(),
        );
        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(input(1.0), in_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(input(2.0), in_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(pool.submit(input(3.0), in_secs(5)).await, Err(PoolError::Overloaded)));
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }
}
