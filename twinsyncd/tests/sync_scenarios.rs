use std::sync::Arc;
use std::time::Duration;

use twinsync_core::{ElementPath, MemoryProvider, Provider};
use twinsyncd::sync::baseline::BaselineStore;
use twinsyncd::sync::engine::Reconciler;
use twinsyncd::sync::job::Side;
use twinsyncd::sync::lifecycle::{RunState, SideState, Slot, SyncModule};
use twinsyncd::sync::queue::{JobQueue, QueueConfig};
use twinsyncd::sync::retry::RetryPolicy;
use twinsyncd::sync::scanner::Scanner;
use twinsyncd::sync::settings::SyncSettings;
use twinsyncd::sync::sides::Sides;
use twinsyncd::sync::transfer::TransferClient;
use twinsyncd::sync::worker::WorkerPool;

struct Harness {
    a: Arc<MemoryProvider>,
    b: Arc<MemoryProvider>,
    baseline: BaselineStore,
    queue: JobQueue,
    module: SyncModule,
}

impl Harness {
    async fn start() -> Self {
        let a = Arc::new(MemoryProvider::new("a"));
        let b = Arc::new(MemoryProvider::new("b"));
        let baseline = BaselineStore::in_memory().await.unwrap();
        let (queue, _handle) = JobQueue::spawn(QueueConfig {
            quiet_window: Duration::from_millis(30),
            promote_interval: Duration::from_millis(10),
        });
        let sides = Sides::new(a.clone(), b.clone());
        let scanner = Scanner::new(sides.clone(), baseline.clone(), queue.clone());
        let engine = Arc::new(Reconciler::new(
            sides.clone(),
            baseline.clone(),
            TransferClient::new(Arc::new(MemoryProvider::new("scratch"))),
            scanner.clone(),
            Arc::new(SyncSettings::default()),
        ));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            jitter: false,
            max_retries: 1_000,
            postpone_delay: Duration::from_millis(10),
        };
        let pool = WorkerPool::new(queue.clone(), engine, policy);
        let mut harness = Self {
            a,
            b,
            baseline,
            queue,
            module: SyncModule::new(sides, scanner, pool, 4),
        };
        harness.set_ready(true).await;
        harness
    }

    async fn set_ready(&mut self, ready: bool) {
        let state = if ready {
            SideState::Ready
        } else {
            SideState::Disconnected
        };
        for slot in [Slot::Side(Side::A), Slot::Side(Side::B), Slot::Scratch] {
            self.module.set_state(slot, state).await;
        }
        let expected = if ready {
            RunState::Running
        } else {
            RunState::Stopped
        };
        assert_eq!(self.module.run_state(), expected);
    }

    /// Waits until the queue has stayed empty across several polls.
    async fn settle(&self) {
        let mut quiet_polls = 0;
        for _ in 0..1_000 {
            if self.queue.stats().await.unwrap().is_idle() {
                quiet_polls += 1;
                if quiet_polls >= 8 {
                    return;
                }
            } else {
                quiet_polls = 0;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue never settled");
    }

    async fn assert_same_trees(&self) {
        let paths = self.a.paths().await;
        assert_eq!(paths, self.b.paths().await);
        for path in &paths {
            assert_eq!(self.a.contents(path).await, self.b.contents(path).await, "{path}");
        }
    }

    async fn has_baseline(&self, side: Side, path: &str) -> bool {
        self.baseline
            .get_element(side.domain(), &ElementPath::parse(path).unwrap())
            .await
            .unwrap()
            .is_some()
    }
}

async fn paths_containing(provider: &MemoryProvider, marker: &str) -> Vec<String> {
    provider
        .paths()
        .await
        .into_iter()
        .filter(|path| path.contains(marker))
        .collect()
}

async fn modified(provider: &MemoryProvider, path: &str) -> i64 {
    provider
        .get_element(&ElementPath::parse(path).unwrap())
        .await
        .unwrap()
        .unwrap()
        .modified
}

#[tokio::test]
async fn added_file_is_created_then_deleted_on_the_other_side() {
    let harness = Harness::start().await;
    harness
        .a
        .put_file("/docs/readme.txt", b"hello", 1_000)
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(
        harness.b.contents("/docs/readme.txt").await.unwrap(),
        b"hello"
    );
    assert!(harness.has_baseline(Side::A, "/docs/readme.txt").await);
    assert!(harness.has_baseline(Side::B, "/docs/readme.txt").await);

    harness
        .a
        .delete(&ElementPath::parse("/docs/readme.txt").unwrap())
        .await
        .unwrap();
    harness.settle().await;

    assert!(harness.b.contents("/docs/readme.txt").await.is_none());
    assert!(!harness.has_baseline(Side::A, "/docs/readme.txt").await);
    assert!(!harness.has_baseline(Side::B, "/docs/readme.txt").await);
    harness.assert_same_trees().await;
    harness.module.shutdown().await;
}

#[tokio::test]
async fn independent_edits_on_both_sides_converge() {
    let harness = Harness::start().await;
    harness.a.put_file("/left/one.txt", b"1", 1_000).await.unwrap();
    harness.a.put_file("/left/deep/two.txt", b"2", 1_000).await.unwrap();
    harness.b.put_file("/right/three.txt", b"3", 1_000).await.unwrap();
    harness.b.put_folder("/right/empty").await.unwrap();
    harness.settle().await;

    harness.assert_same_trees().await;
    assert_eq!(harness.a.contents("/right/three.txt").await.unwrap(), b"3");
    assert_eq!(harness.b.contents("/left/deep/two.txt").await.unwrap(), b"2");
    assert!(harness.a.paths().await.contains(&"/right/empty".to_string()));
    harness.module.shutdown().await;
}

#[tokio::test]
async fn concurrent_edits_keep_both_versions_on_both_sides() {
    let mut harness = Harness::start().await;
    harness.a.put_file("/n.txt", b"base", 1_000).await.unwrap();
    harness.settle().await;
    harness.assert_same_trees().await;

    harness.set_ready(false).await;
    let a_before = modified(&harness.a, "/n.txt").await;
    let b_before = modified(&harness.b, "/n.txt").await;
    harness
        .a
        .put_file("/n.txt", b"a-edit", a_before + 100)
        .await
        .unwrap();
    harness
        .b
        .put_file("/n.txt", b"b-edit", b_before + 200)
        .await
        .unwrap();
    harness.set_ready(true).await;
    harness.settle().await;

    harness.assert_same_trees().await;
    assert_eq!(harness.a.contents("/n.txt").await.unwrap(), b"b-edit");
    let conflicts = paths_containing(&harness.a, "(conflict").await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(harness.a.contents(&conflicts[0]).await.unwrap(), b"a-edit");
    assert_eq!(harness.b.contents(&conflicts[0]).await.unwrap(), b"a-edit");
    harness.module.shutdown().await;
}

#[tokio::test]
async fn edit_racing_a_delete_survives_on_both_sides() {
    let mut harness = Harness::start().await;
    harness.a.put_file("/d.txt", b"base", 1_000).await.unwrap();
    harness.settle().await;

    harness.set_ready(false).await;
    harness
        .a
        .delete(&ElementPath::parse("/d.txt").unwrap())
        .await
        .unwrap();
    let b_before = modified(&harness.b, "/d.txt").await;
    harness
        .b
        .put_file("/d.txt", b"b-edit", b_before + 50)
        .await
        .unwrap();
    harness.set_ready(true).await;
    harness.settle().await;

    harness.assert_same_trees().await;
    let mut survivors = Vec::new();
    for path in harness.a.paths().await {
        if harness.a.contents(&path).await.as_deref() == Some(b"b-edit".as_slice()) {
            survivors.push(path);
        }
    }
    assert_eq!(survivors.len(), 1, "{survivors:?}");
    harness.module.shutdown().await;
}

#[tokio::test]
async fn relays_through_scratch_without_direct_transfer() {
    let harness = Harness::start().await;
    harness.a.set_direct_transfer(false);
    harness.a.put_file("/r.bin", &[7u8; 100_000], 1_000).await.unwrap();
    harness.settle().await;

    assert_eq!(harness.b.contents("/r.bin").await.unwrap(), vec![7u8; 100_000]);
    harness.module.shutdown().await;
}

#[tokio::test]
async fn offline_side_catches_up_once_it_returns() {
    let harness = Harness::start().await;
    harness.b.set_offline(true);
    harness.a.put_file("/late.txt", b"late", 1_000).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!harness.queue.stats().await.unwrap().is_idle());

    harness.b.set_offline(false);
    harness.settle().await;
    assert_eq!(harness.b.contents("/late.txt").await.unwrap(), b"late");
    harness.assert_same_trees().await;
    harness.module.shutdown().await;
}
