use crate::{solve, VdfChallenge, VdfError, VdfProof};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Producer-side handle to a submitted job. Dropping the handle does not
/// cancel the job; call `cancel` to make the worker discard partial state.
pub struct JobHandle {
    cancel: Arc<AtomicBool>,
    receiver: oneshot::Receiver<Result<VdfProof, VdfError>>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn proof(self) -> Result<VdfProof, VdfError> {
        self.receiver.await.map_err(|_| VdfError::PoolClosed)?
    }
}

struct QueuedJob {
    challenge: VdfChallenge,
    priority: u8,
    sequence: u64,
    submitted: Instant,
    cancel: Arc<AtomicBool>,
    respond: oneshot::Sender<Result<VdfProof, VdfError>>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: higher priority first, then older submissions
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Fixed pool of CPU-bound solver workers fed from a priority queue.
/// Workers run solves on the blocking pool and yield only between jobs;
/// queued jobs expire if no worker picks them up within the timeout.
pub struct WorkerPool {
    queue: Arc<Mutex<BinaryHeap<QueuedJob>>>,
    notify: Arc<Notify>,
    sequence: AtomicU64,
    max_pending: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, max_pending: usize, job_timeout: Duration) -> Self {
        let queue: Arc<Mutex<BinaryHeap<QueuedJob>>> = Arc::new(Mutex::new(BinaryHeap::new()));
        let notify = Arc::new(Notify::new());
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let queue = Arc::clone(&queue);
                let notify = Arc::clone(&notify);
                tokio::spawn(worker_loop(index, queue, notify, job_timeout))
            })
            .collect();
        Self {
            queue,
            notify,
            sequence: AtomicU64::new(0),
            max_pending,
            workers,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn submit(&self, challenge: VdfChallenge, priority: u8) -> Result<JobHandle, VdfError> {
        let (tx, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_pending {
                return Err(VdfError::QueueFull);
            }
            queue.push(QueuedJob {
                challenge,
                priority,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                submitted: Instant::now(),
                cancel: Arc::clone(&cancel),
                respond: tx,
            });
        }
        self.notify.notify_one();
        Ok(JobHandle {
            cancel,
            receiver: rx,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<Mutex<BinaryHeap<QueuedJob>>>,
    notify: Arc<Notify>,
    job_timeout: Duration,
) {
    loop {
        let job = { queue.lock().pop() };
        let Some(job) = job else {
            notify.notified().await;
            continue;
        };

        if job.submitted.elapsed() > job_timeout {
            warn!(worker = index, id = %job.challenge.id, "vdf job expired in queue");
            let _ = job.respond.send(Err(VdfError::Expired));
            continue;
        }
        if job.cancel.load(Ordering::Relaxed) {
            let _ = job.respond.send(Err(VdfError::Cancelled));
            continue;
        }

        debug!(worker = index, id = %job.challenge.id, "vdf job started");
        let challenge = job.challenge;
        let cancel = Arc::clone(&job.cancel);
        let result =
            tokio::task::spawn_blocking(move || solve(&challenge, &cancel)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(VdfError::PoolClosed),
        };
        let _ = job.respond.send(outcome);
    }
}
