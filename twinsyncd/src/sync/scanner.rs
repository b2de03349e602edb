use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info};
use twinsync_core::{ElementPath, MAX_PATH_DEPTH, ProviderError};

use super::baseline::{BaselineError, BaselineStore};
use super::job::{JobKind, Side, SyncJob};
use super::queue::{JobQueue, QueueError};
use super::sides::Sides;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("baseline error: {0}")]
    Baseline(#[from] BaselineError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Turns provider subtrees and stale baselines into queued jobs.
#[derive(Clone)]
pub struct Scanner {
    sides: Sides,
    baseline: BaselineStore,
    queue: JobQueue,
}

impl Scanner {
    pub fn new(sides: Sides, baseline: BaselineStore, queue: JobQueue) -> Self {
        Self {
            sides,
            baseline,
            queue,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queues one job per element below `path` on `side`. Returns how many were accepted.
    pub async fn enqueue_subtree(
        &self,
        side: Side,
        path: &ElementPath,
        kind: JobKind,
    ) -> Result<usize, ScanError> {
        let elements = self
            .sides
            .get(side)
            .get_child_elements(path, true)
            .await?;
        let mut accepted = 0;
        for element in elements {
            let mut job = SyncJob::init(side, element);
            job.kind = kind;
            if self.queue.submit(job).await? {
                accepted += 1;
            }
        }
        debug!(side = %side, path = %path, accepted, "queued subtree");
        Ok(accepted)
    }

    /// Startup re-scan of one side.
    ///
    /// Every live element is queued, and so is every baseline entry that no
    /// longer has a live counterpart, so deletions made while the module was
    /// stopped still propagate.
    pub async fn catch_up(&self, side: Side) -> Result<usize, ScanError> {
        let root = ElementPath::root();
        let live = self.sides.get(side).get_child_elements(&root, true).await?;
        let live_paths: HashSet<ElementPath> =
            live.iter().map(|element| element.path.clone()).collect();

        let mut queued = 0;
        for element in live {
            if self.queue.submit(SyncJob::init(side, element)).await? {
                queued += 1;
            }
        }

        let mut stale = 0;
        let mut stack = vec![root];
        while let Some(folder) = stack.pop() {
            for entry in self
                .baseline
                .get_child_elements(side.domain(), &folder)
                .await?
            {
                if entry.is_folder() && entry.path.depth() < MAX_PATH_DEPTH {
                    stack.push(entry.path.clone());
                }
                if live_paths.contains(&entry.path) {
                    continue;
                }
                let job = SyncJob::new(side, entry.path, JobKind::Init);
                if self.queue.submit(job).await? {
                    stale += 1;
                }
            }
        }

        info!(side = %side, queued, stale, "catch-up scan queued jobs");
        Ok(queued + stale)
    }
}
