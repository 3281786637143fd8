use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    db::ScanStore,
    engine::ScanEngine,
    error::{ExecutionError, LifecycleError, ScanError},
    jobs::{JobHandle, JobQueue, JobRunner, QueuedJob},
    models::{ScanId, ScanRecord, ScanRequest, ScanStatus, TransitionRejected},
};

/// Bounds for the failed-scan sweep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_age: chrono::Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::hours(24),
            max_attempts: 3,
        }
    }
}

struct InFlight {
    cancel: CancellationToken,
    /// Fired once the final state of the run has been committed.
    finished: CancellationToken,
}

type InFlightMap = Mutex<HashMap<ScanId, InFlight>>;

struct InFlightGuard<'a> {
    map: &'a InFlightMap,
    id: ScanId,
    finished: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        self.finished.cancel();
    }
}

/// Owns every status change of every scan record. Writes go through
/// `ScanStore::commit` with the status the change was computed from, so a
/// lost race shows up as a failed commit instead of a clobbered record.
pub struct ScanManager {
    store: Arc<dyn ScanStore>,
    queue: Arc<dyn JobQueue>,
    engine: Arc<ScanEngine>,
    in_flight: InFlightMap,
}

impl ScanManager {
    pub fn new(store: Arc<dyn ScanStore>, queue: Arc<dyn JobQueue>, engine: Arc<ScanEngine>) -> Self {
        Self {
            store,
            queue,
            engine,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn submit_scan(&self, owner: &str, request: ScanRequest) -> Result<ScanRecord, LifecycleError> {
        let mut record = self.store.insert(owner, &request, Utc::now()).await?;
        info!(scan_id = record.id, owner, target = %request.target, profile = %request.profile, "scan submitted");
        self.dispatch(&mut record).await?;
        Ok(record)
    }

    pub async fn get_scan(&self, id: ScanId) -> Result<ScanRecord, LifecycleError> {
        self.store.get(id).await?.ok_or(LifecycleError::NotFound(id))
    }

    /// Queued scans are cancelled and revoked from the queue. Running scans
    /// are signalled and the call returns once the run has committed its
    /// final state.
    pub async fn cancel_scan(&self, id: ScanId) -> Result<ScanRecord, LifecycleError> {
        loop {
            let mut record = self.get_scan(id).await?;
            let from = record.status;
            match from {
                ScanStatus::Queued => {
                    record.cancel(Utc::now()).map_err(|e| rejected(id, e))?;
                    if !self.store.commit(&record, from).await? {
                        continue;
                    }
                    if let Some(handle) = &record.job_handle {
                        self.queue.revoke(&JobHandle::from(handle.clone())).await;
                    }
                    info!(scan_id = id, "queued scan cancelled");
                    return Ok(record);
                }
                ScanStatus::Running => {
                    let tokens = self
                        .in_flight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&id)
                        .map(|f| (f.cancel.clone(), f.finished.clone()));

                    if let Some((cancel, finished)) = tokens {
                        info!(scan_id = id, "cancelling running scan");
                        cancel.cancel();
                        finished.cancelled().await;
                        let record = self.get_scan(id).await?;
                        return match record.status {
                            ScanStatus::Cancelled => Ok(record),
                            status => Err(LifecycleError::InvalidTransition {
                                id,
                                from: status,
                                to: ScanStatus::Cancelled,
                            }),
                        };
                    }

                    // no run of this scan lives in this process
                    record.cancel(Utc::now()).map_err(|e| rejected(id, e))?;
                    if self.store.commit(&record, from).await? {
                        warn!(scan_id = id, "cancelled running scan with no live process");
                        return Ok(record);
                    }
                }
                status => {
                    return Err(LifecycleError::InvalidTransition {
                        id,
                        from: status,
                        to: ScanStatus::Cancelled,
                    })
                }
            }
        }
    }

    /// Failed → queued, then back onto the queue.
    pub async fn retry_scan(&self, id: ScanId) -> Result<ScanRecord, LifecycleError> {
        let mut record = self.get_scan(id).await?;
        record.requeue(Utc::now()).map_err(|e| rejected(id, e))?;
        if !self.store.commit(&record, ScanStatus::Failed).await? {
            let current = self.get_scan(id).await?;
            return Err(LifecycleError::InvalidTransition {
                id,
                from: current.status,
                to: ScanStatus::Queued,
            });
        }
        info!(scan_id = id, attempts = record.attempts, "scan re-queued");
        self.dispatch(&mut record).await?;
        Ok(record)
    }

    /// Re-queues failed scans that are recent enough and still have attempts
    /// left. Returns the ids that went back onto the queue.
    pub async fn retry_failed(&self, policy: RetryPolicy) -> Result<Vec<ScanId>, LifecycleError> {
        let since = Utc::now()
            .checked_sub_signed(policy.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut requeued = vec![];
        for record in self.store.list_failed(since).await? {
            if record.attempts >= policy.max_attempts {
                debug!(scan_id = record.id, attempts = record.attempts, "retry budget exhausted");
                continue;
            }
            match self.retry_scan(record.id).await {
                Ok(_) => requeued.push(record.id),
                Err(LifecycleError::InvalidTransition { .. }) => {}
                Err(LifecycleError::Queue(e)) => {
                    warn!(scan_id = record.id, error = %e, "could not re-queue failed scan");
                }
                Err(e) => return Err(e),
            }
        }
        info!(count = requeued.len(), "failed-scan sweep done");
        Ok(requeued)
    }

    pub async fn check_tool(&self) -> Result<String, ExecutionError> {
        self.engine.tool_version().await
    }

    /// Runs one delivery of a job to a terminal state. Deliveries for records
    /// that are already terminal, or already running in this process, are
    /// dropped.
    pub async fn run_scan(&self, job: QueuedJob) -> Result<(), LifecycleError> {
        let id = job.scan_id;
        let Some(mut record) = self.store.get(id).await? else {
            warn!(scan_id = id, job = %job.handle, "job refers to unknown scan");
            return Ok(());
        };
        let from = record.status;
        if from.is_terminal() {
            debug!(scan_id = id, status = %from, "skipping delivery for finished scan");
            return Ok(());
        }

        let prepared = match self.engine.prepare(&record.request) {
            Ok(prepared) => prepared,
            Err(e) => {
                let e = ScanError::from(e);
                warn!(scan_id = id, error = %e, "scan rejected");
                record
                    .fail(Utc::now(), e.to_string(), None)
                    .map_err(|t| rejected(id, t))?;
                self.commit_final(&record, from).await?;
                return Ok(());
            }
        };

        let Some((cancel, _guard)) = self.register(id) else {
            debug!(scan_id = id, "scan already running in this process");
            return Ok(());
        };

        record.job_handle = Some(job.handle.to_string());
        record.begin_running(Utc::now()).map_err(|t| rejected(id, t))?;
        if !self.store.commit(&record, from).await? {
            debug!(scan_id = id, "scan changed state before it started");
            return Ok(());
        }
        info!(scan_id = id, command = %prepared.command, "scan running");

        let outcome = AssertUnwindSafe(self.engine.execute(&prepared, &cancel))
            .catch_unwind()
            .await;
        let now = Utc::now();
        let transition = match outcome {
            Ok(Ok(outcome)) => {
                let raw = outcome.raw_output();
                match outcome.parsed {
                    Ok(parsed) => record.complete(now, raw, parsed),
                    Err(e) => record.fail(now, ScanError::from(e).to_string(), Some(raw)),
                }
            }
            Ok(Err(ExecutionError::Cancelled { .. })) => record.cancel(now),
            Ok(Err(e)) => record.fail(now, ScanError::from(e).to_string(), None),
            Err(panic) => {
                let message = format!("unexpected fault: {}", panic_message(panic.as_ref()));
                error!(scan_id = id, %message, "scan pipeline panicked");
                record.fail(now, message, None)
            }
        };
        transition.map_err(|t| rejected(id, t))?;
        self.commit_final(&record, ScanStatus::Running).await
    }

    async fn commit_final(&self, record: &ScanRecord, from: ScanStatus) -> Result<(), LifecycleError> {
        if self.store.commit(record, from).await? {
            info!(
                scan_id = record.id,
                status = %record.status,
                duration_seconds = ?record.duration_seconds,
                hosts_up = record.hosts_up,
                ports_found = record.ports_found,
                error = ?record.error_message,
                "scan finished"
            );
        } else {
            warn!(scan_id = record.id, status = %record.status, "scan state changed underneath; result dropped");
        }
        Ok(())
    }

    /// Enqueues a queued record. A queue failure fails the record.
    async fn dispatch(&self, record: &mut ScanRecord) -> Result<(), LifecycleError> {
        match self.queue.enqueue(record.id, &record.request).await {
            Ok(handle) => {
                record.job_handle = Some(handle.to_string());
                // a worker that already picked the job up records the same handle
                if !self.store.commit(record, ScanStatus::Queued).await? {
                    debug!(scan_id = record.id, "scan left queued before its handle was stored");
                }
                Ok(())
            }
            Err(e) => {
                error!(scan_id = record.id, error = %e, "failed to enqueue scan");
                record
                    .fail(Utc::now(), format!("failed to queue scan: {e}"), None)
                    .map_err(|t| rejected(record.id, t))?;
                self.store.commit(record, ScanStatus::Queued).await?;
                Err(e.into())
            }
        }
    }

    fn register(&self, id: ScanId) -> Option<(CancellationToken, InFlightGuard<'_>)> {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            return None;
        }
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        map.insert(
            id,
            InFlight {
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );
        Some((
            cancel,
            InFlightGuard {
                map: &self.in_flight,
                id,
                finished,
            },
        ))
    }
}

#[async_trait::async_trait]
impl JobRunner for ScanManager {
    async fn run_job(&self, job: QueuedJob) {
        let id = job.scan_id;
        if let Err(e) = self.run_scan(job).await {
            error!(scan_id = id, error = %e, "scan run aborted");
        }
    }
}

fn rejected(id: ScanId, t: TransitionRejected) -> LifecycleError {
    LifecycleError::InvalidTransition {
        id,
        from: t.from,
        to: t.to,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
