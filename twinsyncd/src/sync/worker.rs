use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::Reconciler;
use super::job::{SyncJob, SyncOutcome};
use super::queue::{JobQueue, QueueError};
use super::retry::RetryPolicy;

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Resizable set of tasks that take jobs from the queue and reconcile them.
pub struct WorkerPool {
    queue: JobQueue,
    engine: Arc<Reconciler>,
    policy: RetryPolicy,
    workers: Vec<Worker>,
    retiring: Vec<JoinHandle<()>>,
    next_id: usize,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, engine: Arc<Reconciler>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            engine,
            policy,
            workers: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Grows or shrinks to `target` workers. Shrinking lets in-flight jobs finish.
    pub fn resize(&mut self, target: usize) {
        while self.workers.len() < target {
            let cancel = CancellationToken::new();
            let id = self.next_id;
            self.next_id += 1;
            let handle = tokio::spawn(run_worker(
                id,
                self.queue.clone(),
                self.engine.clone(),
                self.policy,
                cancel.clone(),
            ));
            self.workers.push(Worker { cancel, handle });
        }
        while self.workers.len() > target {
            if let Some(worker) = self.workers.pop() {
                worker.cancel.cancel();
                self.retiring.push(worker.handle);
            }
        }
        self.retiring.retain(|handle| !handle.is_finished());
        info!(workers = self.workers.len(), "worker pool resized");
    }

    /// Stops every worker and waits for in-flight jobs.
    pub async fn shutdown(&mut self) {
        self.resize(0);
        for result in join_all(self.retiring.drain(..)).await {
            if let Err(err) = result {
                warn!("worker task ended abnormally: {err}");
            }
        }
    }
}

async fn run_worker(
    id: usize,
    queue: JobQueue,
    engine: Arc<Reconciler>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    debug!(worker = id, "worker started");
    while let Some(mut job) = queue.take_cancellable(&cancel).await {
        let outcome = engine.sync(&mut job).await;
        report(&queue, &policy, job, outcome).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Hands the attempt's outcome back to the queue.
async fn report(
    queue: &JobQueue,
    policy: &RetryPolicy,
    mut job: SyncJob,
    outcome: SyncOutcome,
) {
    let result = match outcome {
        SyncOutcome::Done | SyncOutcome::Invalid => queue.complete(job.path),
        SyncOutcome::Retry => {
            job.retry_count += 1;
            match policy.retry_delay(job.retry_count) {
                Some(delay) => {
                    job.ready_at = Some(Instant::now() + delay);
                    requeue(queue, job).await
                }
                None => {
                    warn!(job = %job, retries = job.retry_count - 1, "giving up on job");
                    queue.complete(job.path)
                }
            }
        }
        SyncOutcome::Postpone => {
            job.postpone_count += 1;
            debug!(job = %job, postponed = job.postpone_count, "postponing job");
            job.ready_at = Some(Instant::now() + policy.postpone_delay);
            requeue(queue, job).await
        }
    };
    if let Err(err) = result {
        warn!("could not report job outcome: {err}");
    }
}

async fn requeue(queue: &JobQueue, job: SyncJob) -> Result<(), QueueError> {
    let label = job.to_string();
    if !queue.requeue(job).await? {
        debug!(job = %label, "requeue merged into an equivalent job");
    }
    Ok(())
}
