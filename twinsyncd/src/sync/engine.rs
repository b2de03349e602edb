use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use twinsync_core::{
    DataElement, ElementPath, PathError, ProviderError, ResultCode, same_snapshot,
};

use super::baseline::{BaselineError, BaselineStore};
use super::job::{JobKind, Side, SyncJob, SyncOutcome};
use super::queue::QueueError;
use super::scanner::{ScanError, Scanner};
use super::settings::SyncSettings;
use super::sides::Sides;
use super::transfer::{TransferClient, TransferError};

mod delete;
mod propagate;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("baseline error: {0}")]
    Baseline(#[from] BaselineError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("{path} is locked on side {side}")]
    LockContention { side: Side, path: ElementPath },
    #[error("{op} on {path} answered {code}")]
    Rejected {
        op: &'static str,
        path: ElementPath,
        code: ResultCode,
    },
    #[error("{0} changed while the job was waiting")]
    StillChanging(ElementPath),
    #[error("the root path is never reconciled")]
    RootPath,
}

/// Failure classes and the outcome each one maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientProvider,
    LockContention,
    SourceStillChanging,
    SemanticallyInvalid,
    PersistedMetadata,
}

impl ErrorKind {
    pub fn outcome(self) -> SyncOutcome {
        match self {
            ErrorKind::TransientProvider
            | ErrorKind::LockContention
            | ErrorKind::PersistedMetadata => SyncOutcome::Retry,
            ErrorKind::SourceStillChanging => SyncOutcome::Postpone,
            ErrorKind::SemanticallyInvalid => SyncOutcome::Invalid,
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Provider(err) if !err.is_transient() => ErrorKind::SemanticallyInvalid,
            EngineError::Provider(_) | EngineError::Queue(_) | EngineError::Rejected { .. } => {
                ErrorKind::TransientProvider
            }
            EngineError::Transfer(err) if !err.is_transient() => ErrorKind::SemanticallyInvalid,
            EngineError::Transfer(_) => ErrorKind::TransientProvider,
            EngineError::Scan(ScanError::Baseline(_)) => ErrorKind::PersistedMetadata,
            EngineError::Scan(ScanError::Provider(err)) if !err.is_transient() => {
                ErrorKind::SemanticallyInvalid
            }
            EngineError::Scan(_) => ErrorKind::TransientProvider,
            EngineError::Baseline(_) => ErrorKind::PersistedMetadata,
            EngineError::LockContention { .. } => ErrorKind::LockContention,
            EngineError::StillChanging(_) => ErrorKind::SourceStillChanging,
            EngineError::Path(_) | EngineError::RootPath => ErrorKind::SemanticallyInvalid,
        }
    }
}

/// Advisory locks taken during one reconciliation, released together.
#[derive(Default)]
struct LockSet {
    held: Vec<(Side, ElementPath)>,
}

impl LockSet {
    async fn acquire(
        &mut self,
        sides: &Sides,
        side: Side,
        path: &ElementPath,
    ) -> Result<(), EngineError> {
        match sides.get(side).check_and_lock(path).await? {
            ResultCode::Ok => {
                self.held.push((side, path.clone()));
                Ok(())
            }
            // Providers without locking are treated as always granting the lock.
            ResultCode::Unsupported => Ok(()),
            _ => Err(EngineError::LockContention {
                side,
                path: path.clone(),
            }),
        }
    }

    /// Releases in reverse order; every lock is attempted even after a failure.
    async fn release_all(self, sides: &Sides) -> Result<(), EngineError> {
        let mut first_error = None;
        for (side, path) in self.held.into_iter().rev() {
            let result = match sides.get(side).unlock(&path).await {
                Ok(ResultCode::Ok) => Ok(()),
                Ok(code) => Err(EngineError::Rejected {
                    op: "unlock",
                    path: path.clone(),
                    code,
                }),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                warn!(side = %side, path = %path, "failed to release lock: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Decides and performs the work for one job.
pub struct Reconciler {
    sides: Sides,
    baseline: BaselineStore,
    transfer: TransferClient,
    scanner: Scanner,
    settings: Arc<SyncSettings>,
}

impl Reconciler {
    pub fn new(
        sides: Sides,
        baseline: BaselineStore,
        transfer: TransferClient,
        scanner: Scanner,
        settings: Arc<SyncSettings>,
    ) -> Self {
        Self {
            sides,
            baseline,
            transfer,
            scanner,
            settings,
        }
    }

    /// Runs one attempt. Never fails: errors are folded into the outcome.
    pub async fn sync(&self, job: &mut SyncJob) -> SyncOutcome {
        match self.reconcile(job).await {
            Ok(outcome) => {
                debug!(job = %job, outcome = outcome.as_str(), "reconciled");
                outcome
            }
            Err(err) => {
                let kind = err.kind();
                match kind {
                    ErrorKind::SourceStillChanging => {
                        debug!(job = %job, "source still changing, postponing");
                    }
                    ErrorKind::SemanticallyInvalid => {
                        warn!(job = %job, "dropping invalid job: {err}");
                    }
                    _ => warn!(job = %job, attempt = job.retry_count, "sync attempt failed: {err}"),
                }
                kind.outcome()
            }
        }
    }

    async fn reconcile(&self, job: &mut SyncJob) -> Result<SyncOutcome, EngineError> {
        if job.path.is_root() {
            return Err(EngineError::RootPath);
        }
        let mut locks = LockSet::default();
        locks.acquire(&self.sides, job.source, &job.path).await?;
        let result = self.reconcile_locked(job, &mut locks).await;
        let released = locks.release_all(&self.sides).await;
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn reconcile_locked(
        &self,
        job: &mut SyncJob,
        locks: &mut LockSet,
    ) -> Result<SyncOutcome, EngineError> {
        let live = self.sides.get(job.source).get_element(&job.path).await?;
        if job.from_notification && !same_snapshot(job.element.as_ref(), live.as_ref()) {
            job.element = live;
            return Err(EngineError::StillChanging(job.path.clone()));
        }

        let source_base = self
            .baseline
            .get_element(job.source.domain(), &job.path)
            .await?;

        match (live, source_base) {
            (None, None) => {
                debug!(job = %job, "nothing live and nothing known");
                Ok(SyncOutcome::Invalid)
            }
            (Some(live), Some(base)) if live.same_state(&base) && !job.is_forced() => {
                Ok(SyncOutcome::Done)
            }
            (Some(live), base) => self.propagate(job, live, base, locks).await,
            (None, Some(_)) => self.delete(job, locks).await,
        }
    }

    /// Recreates `element` (found at `src_path` on `src`) at `dst_path` on `dst`.
    ///
    /// Files are streamed. Folders are created and their contents are queued
    /// from the source side.
    async fn copy_over(
        &self,
        src: Side,
        src_path: &ElementPath,
        dst: Side,
        dst_path: &ElementPath,
        element: &DataElement,
        subtree_kind: JobKind,
    ) -> Result<(), EngineError> {
        if element.is_file() {
            self.transfer
                .copy_file(
                    self.sides.get(src).as_ref(),
                    src_path,
                    self.sides.get(dst).as_ref(),
                    dst_path,
                )
                .await?;
            return Ok(());
        }
        let code = self.sides.get(dst).create_folder(dst_path).await?;
        expect_ok("create_folder", dst_path, code)?;
        self.scanner
            .enqueue_subtree(src, src_path, subtree_kind)
            .await?;
        Ok(())
    }

    /// Records what `side` currently holds at `path` as its baseline.
    async fn store_fresh(&self, side: Side, path: &ElementPath) -> Result<(), EngineError> {
        match self.sides.get(side).get_element(path).await? {
            Some(element) => {
                self.baseline
                    .store_element(side.domain(), path, &element)
                    .await?
            }
            None => self.baseline.delete_element(side.domain(), path).await?,
        }
        Ok(())
    }
}

fn expect_ok(op: &'static str, path: &ElementPath, code: ResultCode) -> Result<(), EngineError> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(EngineError::Rejected {
            op,
            path: path.clone(),
            code,
        })
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
