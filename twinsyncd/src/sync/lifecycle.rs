use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};
use twinsync_core::{
    ElementPath, Notification, NotificationSender, ProviderStatus, SubscriptionId,
};

use super::job::{Side, SyncJob};
use super::queue::JobQueue;
use super::scanner::Scanner;
use super::sides::Sides;
use super::worker::WorkerPool;

/// Readiness of one provider slot as seen by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideState {
    Disconnected,
    Connected,
    Ready,
}

impl From<ProviderStatus> for SideState {
    fn from(status: ProviderStatus) -> Self {
        match status {
            ProviderStatus::Disconnected => SideState::Disconnected,
            // Reachable but refused: connected, never ready.
            ProviderStatus::Connected | ProviderStatus::Unauthorized => SideState::Connected,
            ProviderStatus::Ready => SideState::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Side(Side),
    Scratch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStates {
    pub a: SideState,
    pub b: SideState,
    pub scratch: SideState,
}

impl Default for SlotStates {
    fn default() -> Self {
        Self {
            a: SideState::Disconnected,
            b: SideState::Disconnected,
            scratch: SideState::Disconnected,
        }
    }
}

impl SlotStates {
    fn set(&mut self, slot: Slot, state: SideState) {
        match slot {
            Slot::Side(Side::A) => self.a = state,
            Slot::Side(Side::B) => self.b = state,
            Slot::Scratch => self.scratch = state,
        }
    }
}

/// The module runs exactly when both peers and the scratch side are ready.
pub fn next_run_state(states: &SlotStates) -> RunState {
    let all_ready = [states.a, states.b, states.scratch]
        .iter()
        .all(|state| *state == SideState::Ready);
    if all_ready {
        RunState::Running
    } else {
        RunState::Stopped
    }
}

/// Starts and stops subscriptions, workers and catch-up scans on readiness edges.
pub struct SyncModule {
    sides: Sides,
    scanner: Scanner,
    pool: WorkerPool,
    workers: usize,
    states: SlotStates,
    run_state: RunState,
    run_tx: watch::Sender<RunState>,
    listeners: [NotificationSender; 2],
    forwarders: Vec<JoinHandle<()>>,
    subscriptions: Vec<(Side, SubscriptionId)>,
}

impl SyncModule {
    pub fn new(sides: Sides, scanner: Scanner, pool: WorkerPool, workers: usize) -> Self {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let forwarders = vec![
            tokio::spawn(forward_notifications(Side::A, rx_a, scanner.queue().clone())),
            tokio::spawn(forward_notifications(Side::B, rx_b, scanner.queue().clone())),
        ];
        let (run_tx, _) = watch::channel(RunState::Stopped);
        Self {
            sides,
            scanner,
            pool,
            workers,
            states: SlotStates::default(),
            run_state: RunState::Stopped,
            run_tx,
            listeners: [tx_a, tx_b],
            forwarders,
            subscriptions: Vec::new(),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn subscribe_run_state(&self) -> watch::Receiver<RunState> {
        self.run_tx.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    pub fn queue(&self) -> &JobQueue {
        self.scanner.queue()
    }

    /// Records a slot's new state and applies the resulting transition, if any.
    pub async fn set_state(&mut self, slot: Slot, state: SideState) -> RunState {
        self.states.set(slot, state);
        let next = next_run_state(&self.states);
        if next != self.run_state {
            match next {
                RunState::Running => self.start().await,
                RunState::Stopped => self.stop().await,
            }
            info!(
                from = self.run_state.as_str(),
                to = next.as_str(),
                "sync module state changed"
            );
            self.run_state = next;
            self.run_tx.send_replace(next);
        }
        self.run_state
    }

    pub async fn shutdown(mut self) {
        if self.run_state == RunState::Running {
            self.stop().await;
            self.run_tx.send_replace(RunState::Stopped);
        }
        self.pool.shutdown().await;
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }

    async fn start(&mut self) {
        let root = ElementPath::root();
        for side in [Side::A, Side::B] {
            let listener = self.listeners[listener_index(side)].clone();
            match self.sides.get(side).subscribe(&root, true, listener).await {
                Ok(id) => self.subscriptions.push((side, id)),
                Err(err) => warn!(side = %side, "failed to subscribe to changes: {err}"),
            }
        }
        self.pool.resize(self.workers);
        for side in [Side::A, Side::B] {
            if let Err(err) = self.scanner.catch_up(side).await {
                warn!(side = %side, "catch-up scan failed: {err}");
            }
        }
    }

    async fn stop(&mut self) {
        for (side, id) in self.subscriptions.drain(..) {
            if let Err(err) = self.sides.get(side).unsubscribe(id).await {
                warn!(side = %side, "failed to unsubscribe: {err}");
            }
        }
        self.pool.resize(0);
    }
}

fn listener_index(side: Side) -> usize {
    match side {
        Side::A => 0,
        Side::B => 1,
    }
}

async fn forward_notifications(
    side: Side,
    mut rx: mpsc::UnboundedReceiver<Notification>,
    queue: JobQueue,
) {
    while let Some(notification) = rx.recv().await {
        let job = SyncJob::from_notification(side, notification);
        let label = job.to_string();
        match queue.submit(job).await {
            Ok(true) => trace!(job = %label, "queued notification"),
            Ok(false) => trace!(job = %label, "notification merged into queued job"),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::sync::baseline::BaselineStore;
    use crate::sync::engine::Reconciler;
    use crate::sync::queue::QueueConfig;
    use crate::sync::retry::RetryPolicy;
    use crate::sync::settings::SyncSettings;
    use crate::sync::transfer::TransferClient;
    use twinsync_core::MemoryProvider;

    fn ready() -> SlotStates {
        SlotStates {
            a: SideState::Ready,
            b: SideState::Ready,
            scratch: SideState::Ready,
        }
    }

    #[test]
    fn runs_only_when_every_slot_is_ready() {
        assert_eq!(next_run_state(&ready()), RunState::Running);
        assert_eq!(next_run_state(&SlotStates::default()), RunState::Stopped);
        let mut partial = ready();
        partial.scratch = SideState::Connected;
        assert_eq!(next_run_state(&partial), RunState::Stopped);
    }

    #[test]
    fn unauthorized_provider_is_never_ready() {
        assert_eq!(
            SideState::from(ProviderStatus::Unauthorized),
            SideState::Connected
        );
        assert_eq!(SideState::from(ProviderStatus::Ready), SideState::Ready);
    }

    #[tokio::test]
    async fn transitions_start_and_stop_workers() {
        let a = Arc::new(MemoryProvider::new("a"));
        let b = Arc::new(MemoryProvider::new("b"));
        let baseline = BaselineStore::in_memory().await.unwrap();
        let (queue, _handle) = JobQueue::spawn(QueueConfig {
            quiet_window: Duration::from_millis(20),
            promote_interval: Duration::from_millis(10),
        });
        let sides = Sides::new(a.clone(), b.clone());
        let scanner = Scanner::new(sides.clone(), baseline.clone(), queue.clone());
        let engine = Arc::new(Reconciler::new(
            sides.clone(),
            baseline,
            TransferClient::new(Arc::new(MemoryProvider::new("scratch"))),
            scanner.clone(),
            Arc::new(SyncSettings::default()),
        ));
        let pool = WorkerPool::new(queue.clone(), engine, RetryPolicy::default());
        let mut module = SyncModule::new(sides, scanner, pool, 3);
        let mut run_state = module.subscribe_run_state();

        module.set_state(Slot::Side(Side::A), SideState::Ready).await;
        module.set_state(Slot::Side(Side::B), SideState::Ready).await;
        assert_eq!(module.run_state(), RunState::Stopped);
        assert_eq!(module.worker_count(), 0);

        module.set_state(Slot::Scratch, SideState::Ready).await;
        assert_eq!(module.run_state(), RunState::Running);
        assert_eq!(module.worker_count(), 3);
        assert_eq!(*run_state.borrow_and_update(), RunState::Running);

        module
            .set_state(Slot::Side(Side::B), SideState::Disconnected)
            .await;
        assert_eq!(module.run_state(), RunState::Stopped);
        assert_eq!(module.worker_count(), 0);

        module.shutdown().await;
    }
}
