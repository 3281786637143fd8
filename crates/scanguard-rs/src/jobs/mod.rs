use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};

use tokio::{
    sync::{mpsc, Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info};

use crate::{
    error::QueueError,
    models::{ScanId, ScanRequest},
};

/// Opaque id handed out by the queue for one delivery of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub scan_id: ScanId,
    pub target: String,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, scan_id: ScanId, request: &ScanRequest) -> Result<JobHandle, QueueError>;

    /// Best effort: a job already handed to a worker still runs.
    async fn revoke(&self, handle: &JobHandle);
}

/// Consumer side of a queue; the worker pool drains it.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: QueuedJob);
}

/// Handles still sitting in the channel, and the subset of them revoked.
#[derive(Default)]
struct Ledger {
    pending: HashSet<JobHandle>,
    revoked: HashSet<JobHandle>,
}

/// Bounded in-process queue. Jobs are delivered in FIFO order.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::Sender<QueuedJob>,
    ledger: Arc<Mutex<Ledger>>,
}

pub struct JobReceiver {
    rx: mpsc::Receiver<QueuedJob>,
    ledger: Arc<Mutex<Ledger>>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        (
            Self {
                tx,
                ledger: ledger.clone(),
            },
            JobReceiver { rx, ledger },
        )
    }
}

#[async_trait::async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, scan_id: ScanId, request: &ScanRequest) -> Result<JobHandle, QueueError> {
        let handle = JobHandle::generate();
        let job = QueuedJob {
            handle: handle.clone(),
            scan_id,
            target: request.target.clone(),
        };
        let mut ledger = self.ledger.lock().await;
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        ledger.pending.insert(handle.clone());
        debug!(scan_id, job = %handle, "job enqueued");
        Ok(handle)
    }

    async fn revoke(&self, handle: &JobHandle) {
        let mut ledger = self.ledger.lock().await;
        // a job already handed out has nothing left to skip
        if ledger.pending.contains(handle) {
            ledger.revoked.insert(handle.clone());
        }
    }
}

impl JobReceiver {
    /// Next job that has not been revoked; `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<QueuedJob> {
        while let Some(job) = self.rx.recv().await {
            let mut ledger = self.ledger.lock().await;
            ledger.pending.remove(&job.handle);
            if ledger.revoked.remove(&job.handle) {
                debug!(scan_id = job.scan_id, job = %job.handle, "skipping revoked job");
                continue;
            }
            return Some(job);
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
    pub finished: usize,
}

/// Drains `jobs`, running at most `max_concurrent` at once. Jobs beyond the
/// ceiling wait in the queue. Returns after the queue closes and every
/// started job has finished.
pub async fn worker_loop(
    mut jobs: JobReceiver,
    runner: Arc<dyn JobRunner>,
    runner_state: Arc<Mutex<JobRunnerState>>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    info!(max_concurrent, "worker pool started");
    while let Some(job) = jobs.next().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        runner_state.lock().await.running += 1;

        let runner = runner.clone();
        let state = runner_state.clone();
        tasks.spawn(async move {
            runner.run_job(job).await;
            drop(permit);
            let mut lock = state.lock().await;
            lock.running = lock.running.saturating_sub(1);
            lock.finished += 1;
        });

        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "scan worker task failed");
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "scan worker task failed");
        }
    }
    info!("worker pool stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::profiles::ProfileKind;

    struct SlowRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
        seen: std::sync::Mutex<Vec<ScanId>>,
    }

    #[async_trait::async_trait]
    impl JobRunner for SlowRunner {
        async fn run_job(&self, job: QueuedJob) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.seen.lock().unwrap().push(job.scan_id);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn request() -> ScanRequest {
        ScanRequest::new("192.168.1.5", ProfileKind::Quick)
    }

    #[tokio::test]
    async fn full_queue_rejects_enqueue() {
        let (queue, _rx) = LocalQueue::new(1);
        queue.enqueue(1, &request()).await.unwrap();
        assert!(matches!(
            queue.enqueue(2, &request()).await,
            Err(QueueError::Full)
        ));
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let (queue, rx) = LocalQueue::new(4);
        drop(rx);
        assert!(matches!(
            queue.enqueue(1, &request()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn revoked_jobs_are_skipped() {
        let (queue, mut rx) = LocalQueue::new(4);
        let first = queue.enqueue(1, &request()).await.unwrap();
        queue.enqueue(2, &request()).await.unwrap();
        queue.revoke(&first).await;
        drop(queue);

        let job = rx.next().await.unwrap();
        assert_eq!(job.scan_id, 2);
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn revoking_a_delivered_job_leaves_nothing_behind() {
        let (queue, mut rx) = LocalQueue::new(4);
        let handle = queue.enqueue(1, &request()).await.unwrap();
        let job = rx.next().await.unwrap();
        assert_eq!(job.handle, handle);

        queue.revoke(&handle).await;
        let ledger = queue.ledger.lock().await;
        assert!(ledger.pending.is_empty());
        assert!(ledger.revoked.is_empty());
    }

    #[tokio::test]
    async fn pool_respects_concurrency_ceiling() {
        let (queue, rx) = LocalQueue::new(16);
        for id in 1..=6 {
            queue.enqueue(id, &request()).await.unwrap();
        }
        drop(queue);

        let runner = Arc::new(SlowRunner {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: std::sync::Mutex::new(vec![]),
        });
        let state = Arc::new(Mutex::new(JobRunnerState::default()));
        worker_loop(rx, runner.clone(), state.clone(), 2).await;

        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        let mut seen = runner.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        let state = state.lock().await;
        assert_eq!(state.running, 0);
        assert_eq!(state.finished, 6);
    }
}
