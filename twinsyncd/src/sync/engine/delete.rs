use tracing::{debug, info};
use twinsync_core::{DataElement, ElementPath};

use super::{EngineError, LockSet, Reconciler, expect_ok};
use crate::sync::conflict::{Mark, Marker, marked_path};
use crate::sync::job::{JobKind, Side, SyncJob, SyncOutcome};

impl Reconciler {
    /// Source no longer has the element it had at the last sync.
    pub(super) async fn delete(
        &self,
        job: &SyncJob,
        locks: &mut LockSet,
    ) -> Result<SyncOutcome, EngineError> {
        let path = &job.path;
        if !self.settings.sync_delete() {
            self.baseline
                .delete_element(job.source.domain(), path)
                .await?;
            debug!(job = %job, "deletion not propagated, baseline dropped");
            return Ok(SyncOutcome::Done);
        }

        let dest_side = job.source.other();
        locks.acquire(&self.sides, dest_side, path).await?;
        let dest = self.sides.get(dest_side);

        if let Some(dest_live) = dest.get_element(path).await? {
            if self.unchanged_since_sync(dest_side, &dest_live).await? {
                let code = dest.delete(path).await?;
                if !code.is_delete_success() {
                    return Err(EngineError::Rejected {
                        op: "delete",
                        path: path.clone(),
                        code,
                    });
                }
                debug!(job = %job, "deleted on the other side");
            } else {
                self.preserve_deleted(job.source, path, &dest_live, locks)
                    .await?;
            }
        }

        self.baseline
            .delete_element(job.source.domain(), path)
            .await?;
        if dest.get_element(path).await?.is_none() {
            self.baseline.delete_element(dest_side.domain(), path).await?;
        }
        Ok(SyncOutcome::Done)
    }

    /// `true` when deleting `element` loses nothing that was never synced.
    ///
    /// Folders qualify when empty or when every descendant still matches its
    /// baseline.
    async fn unchanged_since_sync(
        &self,
        side: Side,
        element: &DataElement,
    ) -> Result<bool, EngineError> {
        let base = self.baseline.get_element(side.domain(), &element.path).await?;
        if element.is_file() {
            return Ok(base.is_some_and(|base| base.same_state(element)));
        }
        let children = self
            .sides
            .get(side)
            .get_child_elements(&element.path, true)
            .await?;
        if children.is_empty() {
            return Ok(true);
        }
        if !base.is_some_and(|base| base.same_state(element)) {
            return Ok(false);
        }
        for child in &children {
            let child_base = self.baseline.get_element(side.domain(), &child.path).await?;
            if !child_base.is_some_and(|base| base.same_state(child)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The other side edited what the source deleted: keep the edit under a
    /// deletion-marked name on both sides.
    async fn preserve_deleted(
        &self,
        source: Side,
        path: &ElementPath,
        dest_live: &DataElement,
        locks: &mut LockSet,
    ) -> Result<(), EngineError> {
        let dest_side = source.other();
        let marked = marked_path(path, Marker::Deleted, &Mark::fresh())?;
        locks.acquire(&self.sides, dest_side, &marked).await?;
        locks.acquire(&self.sides, source, &marked).await?;

        let code = self
            .sides
            .get(dest_side)
            .move_element(path, &marked)
            .await?;
        expect_ok("move", path, code)?;
        self.copy_over(dest_side, &marked, source, &marked, dest_live, JobKind::Init)
            .await?;

        self.store_fresh(dest_side, &marked).await?;
        self.store_fresh(source, &marked).await?;
        info!(path = %path, kept_as = %marked, "kept edited version of deleted element");
        Ok(())
    }
}
