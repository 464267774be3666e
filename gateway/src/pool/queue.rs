//! Bounded job queue shared by the workers of one backend pool.
//!
//! Callers enqueue a record and wait on a oneshot receiver; workers take
//! jobs from the front, either one at a time or as a run of jobs whose
//! inputs have the same shape.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use modelgate_common::{Record, Value};

use super::PoolError;

pub type JobResult = Result<Record, PoolError>;

/// Identifies inputs that can share one backend invocation: field names,
/// kinds, and tensor shapes, in record order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey(Vec<(String, String, Vec<usize>)>);

impl ShapeKey {
    pub fn of(record: &Record) -> Self {
        Self(
            record
                .iter()
                .map(|(name, value)| {
                    let shape = match value {
                        Value::Tensor(t) => t.shape().to_vec(),
                        Value::Image(i) => vec![i.height() as usize, i.width() as usize],
                        _ => Vec::new(),
                    };
                    (name.to_string(), value.kind().to_string(), shape)
                })
                .collect(),
        )
    }
}

/// A queued backend invocation.
pub struct Job {
    pub id: u64,
    pub input: Record,
    pub key: ShapeKey,
    pub deadline: Instant,
    pub enqueued_at: StdInstant,
    pub respond: oneshot::Sender<JobResult>,
}

impl Job {
    /// Nobody is waiting for this job anymore.
    fn is_abandoned(&self, now: Instant) -> bool {
        self.respond.is_closed() || now >= self.deadline
    }
}

pub struct JobQueue {
    limit: usize,
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
    /// Mirrors the number of pending jobs for the metrics endpoint.
    depth: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn new(limit: usize, depth: Arc<AtomicUsize>) -> Self {
        depth.store(0, Ordering::Relaxed);
        Self {
            limit,
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            depth,
        }
    }

    /// Enqueue a job. Fails fast when `limit` jobs are already pending.
    pub fn enqueue(
        &self,
        input: Record,
        deadline: Instant,
    ) -> Result<(u64, oneshot::Receiver<JobResult>), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut jobs = self.jobs.lock();
            // abandoned jobs do not hold a slot
            let now = Instant::now();
            self.discard_abandoned(&mut jobs, now);
            if jobs.len() >= self.limit {
                return Err(PoolError::Overloaded);
            }
            jobs.push_back(Job {
                id,
                key: ShapeKey::of(&input),
                input,
                deadline,
                enqueued_at: StdInstant::now(),
                respond: tx,
            });
            self.depth.store(jobs.len(), Ordering::Relaxed);
        }

        // Notify a worker that a new job is available
        self.notify.notify_one();

        Ok((id, rx))
    }

    /// Remove a job that is still pending. Returns false when a worker has
    /// already taken it.
    pub fn remove(&self, id: u64) -> bool {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        self.depth.store(jobs.len(), Ordering::Relaxed);
        jobs.len() != before
    }

    fn discard_abandoned(&self, jobs: &mut VecDeque<Job>, now: Instant) {
        let (dead, live): (VecDeque<Job>, VecDeque<Job>) =
            jobs.drain(..).partition(|job| job.is_abandoned(now));
        *jobs = live;
        for job in dead {
            let _ = job.respond.send(Err(PoolError::DeadlineExceeded));
        }
    }

    /// Take the oldest live job. Expired jobs are answered with
    /// `DeadlineExceeded` and dropped without reaching the backend.
    pub fn take_one(&self) -> Option<Job> {
        self.take_batch(1).into_iter().next()
    }

    /// Take up to `max` live jobs from the front, stopping at the first job
    /// whose shape differs from the front job's.
    pub fn take_batch(&self, max: usize) -> Vec<Job> {
        let mut jobs = self.jobs.lock();
        let now = Instant::now();
        let mut batch: Vec<Job> = Vec::new();
        while batch.len() < max.max(1) {
            let Some(front) = jobs.front() else { break };
            if front.is_abandoned(now) {
                if let Some(job) = jobs.pop_front() {
                    tracing::debug!(job = job.id, "Discarding abandoned job");
                    let _ = job.respond.send(Err(PoolError::DeadlineExceeded));
                }
                continue;
            }
            if batch.first().is_some_and(|first| first.key != front.key) {
                break;
            }
            match jobs.pop_front() {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        self.depth.store(jobs.len(), Ordering::Relaxed);
        batch
    }

    /// Length of the run of live jobs at the front sharing the front job's
    /// shape, capped at `max`, together with the front job's age.
    pub fn ready_run(&self, max: usize) -> Option<(usize, Duration)> {
        let jobs = self.jobs.lock();
        let now = Instant::now();
        let mut live = jobs.iter().filter(|job| !job.is_abandoned(now));
        let first = live.next()?;
        let run = 1 + live.take_while(|job| job.key == first.key).take(max.saturating_sub(1)).count();
        Some((run, first.enqueued_at.elapsed()))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Refuse new jobs and fail the pending ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Job> = self.jobs.lock().drain(..).collect();
        self.depth.store(0, Ordering::Relaxed);
        for job in drained {
            let _ = job.respond.send(Err(PoolError::Closed));
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
