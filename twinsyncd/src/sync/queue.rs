use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use twinsync_core::ElementPath;

use super::job::SyncJob;

pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Delayed jobs move on only after this long without a newly accepted job.
    pub quiet_window: Duration,
    pub promote_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            quiet_window: DEFAULT_QUIET_WINDOW,
            promote_interval: DEFAULT_PROMOTE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub delayed: usize,
    pub ready: usize,
    pub held: usize,
    pub active: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.delayed == 0 && self.ready == 0 && self.held == 0 && self.active == 0
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delayed={} ready={} held={} active={}",
            self.delayed, self.ready, self.held, self.active
        )
    }
}

/// Heap entry: lowest sequence number pops first.
struct Ready(SyncJob);

impl Ready {
    fn seq(&self) -> u64 {
        self.0.seq.unwrap_or(u64::MAX)
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.seq() == other.seq()
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        other.seq().cmp(&self.seq())
    }
}

/// All queue bookkeeping. Only the actor task touches it.
///
/// A job moves delayed -> ready (or held) -> active. Held jobs are parked
/// under the path they conflict with and are re-placed when that path is
/// released. No two active paths ever overlap.
pub struct QueueState {
    delayed: Vec<SyncJob>,
    ready: BinaryHeap<Ready>,
    held: HashMap<ElementPath, Vec<SyncJob>>,
    active: HashSet<ElementPath>,
    next_seq: u64,
    last_accepted: Option<Instant>,
    quiet_window: Duration,
}

impl QueueState {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            delayed: Vec::new(),
            ready: BinaryHeap::new(),
            held: HashMap::new(),
            active: HashSet::new(),
            next_seq: 0,
            last_accepted: None,
            quiet_window,
        }
    }

    pub fn submit(&mut self, job: SyncJob, now: Instant) -> bool {
        if !job.is_forced() && (self.active.contains(&job.path) || self.has_equivalent(&job)) {
            return false;
        }
        self.accept(job);
        self.last_accepted = Some(now);
        true
    }

    /// Puts a finished attempt back through dedup and delay without extending the quiet window.
    pub fn requeue(&mut self, job: SyncJob) -> bool {
        self.active.remove(&job.path);
        self.release(&job.path);
        if !job.is_forced() && self.has_equivalent(&job) {
            return false;
        }
        self.accept(job);
        true
    }

    pub fn complete(&mut self, path: &ElementPath) {
        self.active.remove(path);
        self.release(path);
    }

    /// Returns a handed-out job that never reached a worker.
    pub fn restore(&mut self, job: SyncJob) {
        self.active.remove(&job.path);
        self.place(job);
    }

    pub fn promote(&mut self, now: Instant) -> usize {
        if let Some(last) = self.last_accepted
            && now.saturating_duration_since(last) < self.quiet_window
        {
            return 0;
        }
        let (mut due, waiting): (Vec<SyncJob>, Vec<SyncJob>) = self
            .delayed
            .drain(..)
            .partition(|job| job.is_ready(now));
        self.delayed = waiting;
        due.sort_by_key(|job| job.seq);
        let promoted = due.len();
        for job in due {
            self.place(job);
        }
        promoted
    }

    pub fn take(&mut self) -> Option<SyncJob> {
        while let Some(Ready(job)) = self.ready.pop() {
            if let Some(blocker) = self.overlapping_active(&job.path) {
                trace!(path = %job.path, blocker = %blocker, "holding job behind active path");
                self.held.entry(blocker).or_default().push(job);
                continue;
            }
            self.active.insert(job.path.clone());
            return Some(job);
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delayed: self.delayed.len(),
            ready: self.ready.len(),
            held: self.held.values().map(Vec::len).sum(),
            active: self.active.len(),
        }
    }

    pub fn active_paths(&self) -> impl Iterator<Item = &ElementPath> {
        self.active.iter()
    }

    fn accept(&mut self, mut job: SyncJob) {
        if job.seq.is_none() {
            job.seq = Some(self.next_seq);
            self.next_seq += 1;
        }
        self.delayed.push(job);
    }

    fn has_equivalent(&self, job: &SyncJob) -> bool {
        self.delayed
            .iter()
            .chain(self.ready.iter().map(|entry| &entry.0))
            .chain(self.held.values().flatten())
            .any(|queued| queued.is_equivalent(job))
    }

    fn overlapping_active(&self, path: &ElementPath) -> Option<ElementPath> {
        self.active
            .iter()
            .find(|active| active.overlaps(path))
            .cloned()
    }

    fn dependency(&self, path: &ElementPath) -> Option<ElementPath> {
        self.overlapping_active(path).or_else(|| {
            self.ready
                .iter()
                .find(|entry| entry.0.path.overlaps(path))
                .map(|entry| entry.0.path.clone())
        })
    }

    fn place(&mut self, job: SyncJob) {
        match self.dependency(&job.path) {
            Some(dependency) => self.held.entry(dependency).or_default().push(job),
            None => self.ready.push(Ready(job)),
        }
    }

    fn release(&mut self, path: &ElementPath) {
        let Some(mut jobs) = self.held.remove(path) else {
            return;
        };
        jobs.sort_by_key(|job| job.seq);
        for job in jobs {
            self.place(job);
        }
    }
}

enum Command {
    Submit(SyncJob, oneshot::Sender<bool>),
    Requeue(SyncJob, oneshot::Sender<bool>),
    Take(oneshot::Sender<SyncJob>),
    Complete(ElementPath),
    Restore(SyncJob),
    Stats(oneshot::Sender<QueueStats>),
}

/// Handle to the queue actor. Cheap to clone; the actor stops once every handle is gone.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl JobQueue {
    pub fn spawn(config: QueueConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = QueueActor {
            state: QueueState::new(config.quiet_window),
            waiters: VecDeque::new(),
            promote_interval: config.promote_interval,
        };
        let handle = tokio::spawn(actor.run(rx));
        (Self { tx }, handle)
    }

    pub async fn submit(&self, job: SyncJob) -> Result<bool, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit(job, reply))?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    pub async fn requeue(&self, job: SyncJob) -> Result<bool, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Requeue(job, reply))?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Waits for the next job and marks its path active.
    pub async fn take(&self) -> Result<SyncJob, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Take(reply))?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Like [`take`](Self::take), but gives up when `cancel` fires.
    ///
    /// A job already handed out at that moment goes back to the queue.
    pub async fn take_cancellable(&self, cancel: &CancellationToken) -> Option<SyncJob> {
        if cancel.is_cancelled() {
            return None;
        }
        let (reply, mut rx) = oneshot::channel();
        self.send(Command::Take(reply)).ok()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                rx.close();
                if let Ok(job) = rx.try_recv() {
                    let _ = self.send(Command::Restore(job));
                }
                None
            }
            job = &mut rx => job.ok(),
        }
    }

    pub fn complete(&self, path: ElementPath) -> Result<(), QueueError> {
        self.send(Command::Complete(path))
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        self.tx.send(command).map_err(|_| QueueError::Closed)
    }
}

struct QueueActor {
    state: QueueState,
    waiters: VecDeque<oneshot::Sender<SyncJob>>,
    promote_interval: Duration,
}

impl QueueActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.promote_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => {
                    let promoted = self.state.promote(Instant::now());
                    if promoted > 0 {
                        debug!(promoted, stats = %self.state.stats(), "promoted delayed jobs");
                    }
                }
            }
            self.dispatch();
        }
        debug!("job queue stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(job, reply) => {
                let accepted = self.state.submit(job, Instant::now());
                let _ = reply.send(accepted);
            }
            Command::Requeue(job, reply) => {
                let accepted = self.state.requeue(job);
                let _ = reply.send(accepted);
            }
            Command::Take(reply) => self.waiters.push_back(reply),
            Command::Complete(path) => self.state.complete(&path),
            Command::Restore(job) => self.state.restore(job),
            Command::Stats(reply) => {
                let _ = reply.send(self.state.stats());
            }
        }
    }

    /// Hands ready jobs to waiting workers in arrival order.
    fn dispatch(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
        while !self.waiters.is_empty() {
            let Some(job) = self.state.take() else {
                break;
            };
            let Some(waiter) = self.waiters.pop_front() else {
                self.state.restore(job);
                break;
            };
            if let Err(job) = waiter.send(job) {
                self.state.restore(job);
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
