use tracing::{debug, info};
use twinsync_core::{DataElement, ElementPath};

use super::{EngineError, LockSet, Reconciler, expect_ok};
use crate::sync::conflict::{Mark, Marker, marked_path, newer_side};
use crate::sync::job::{JobKind, Side, SyncJob, SyncOutcome};

impl Reconciler {
    /// Source holds `live` and it is new, changed or forced: bring the other side in line.
    pub(super) async fn propagate(
        &self,
        job: &SyncJob,
        live: DataElement,
        source_base: Option<DataElement>,
        locks: &mut LockSet,
    ) -> Result<SyncOutcome, EngineError> {
        let path = &job.path;
        let dest_side = job.source.other();
        locks.acquire(&self.sides, dest_side, path).await?;

        let dest_live = self.sides.get(dest_side).get_element(path).await?;
        let dest_base = self.baseline.get_element(dest_side.domain(), path).await?;

        let Some(dest_live) = dest_live else {
            if dest_side.is_secondary() && self.settings.sync_only_existing_on_secondary() {
                debug!(job = %job, "secondary side lacks the element, skipping");
                return Ok(SyncOutcome::Done);
            }
            return self.propagate_simple(job, &live, source_base.as_ref()).await;
        };

        let dest_unchanged = dest_base
            .as_ref()
            .is_some_and(|base| base.same_state(&dest_live));
        if dest_unchanged && dest_live.element_type == live.element_type {
            return self.propagate_simple(job, &live, source_base.as_ref()).await;
        }

        if dest_base.is_none() {
            if live.is_folder() && dest_live.is_folder() {
                debug!(job = %job, "both sides created the folder, merging contents");
                self.store_fresh(job.source, path).await?;
                self.store_fresh(dest_side, path).await?;
                self.scanner
                    .enqueue_subtree(job.source, path, JobKind::Init)
                    .await?;
                self.scanner
                    .enqueue_subtree(dest_side, path, JobKind::Init)
                    .await?;
                return Ok(SyncOutcome::Done);
            }
            if self.settings.compare_content()
                && live.is_file()
                && dest_live.is_file()
                && live.size == dest_live.size
                && self
                    .transfer
                    .same_content(
                        self.sides.get(job.source).as_ref(),
                        path,
                        self.sides.get(dest_side).as_ref(),
                        path,
                    )
                    .await?
            {
                debug!(job = %job, "both sides hold identical content");
                self.store_fresh(job.source, path).await?;
                self.store_fresh(dest_side, path).await?;
                return Ok(SyncOutcome::Done);
            }
        }

        let newer = newer_side(
            job.source,
            &live,
            source_base.as_ref(),
            &dest_live,
            dest_base.as_ref(),
        );
        let (newer_element, older_element) = if newer == job.source {
            (live, dest_live)
        } else {
            (dest_live, live)
        };
        self.resolve_conflict(path, newer, &newer_element, &older_element, locks)
            .await
    }

    async fn propagate_simple(
        &self,
        job: &SyncJob,
        live: &DataElement,
        source_base: Option<&DataElement>,
    ) -> Result<SyncOutcome, EngineError> {
        let path = &job.path;
        let dest_side = job.source.other();
        let subtree_kind = if job.is_forced() {
            JobKind::ForceTransfer
        } else {
            JobKind::Init
        };
        self.copy_over(job.source, path, dest_side, path, live, subtree_kind)
            .await?;

        self.store_fresh(job.source, path).await?;
        self.store_fresh(dest_side, path).await?;
        if live.is_file() && source_base.is_some_and(DataElement::is_folder) {
            self.baseline
                .purge_children(job.source.domain(), path)
                .await?;
            self.baseline.purge_children(dest_side.domain(), path).await?;
        }
        debug!(job = %job, "propagated");
        Ok(SyncOutcome::Done)
    }

    /// Keeps both versions: the newer one at `path` on both sides, the older
    /// one next to it under a conflict name on both sides.
    async fn resolve_conflict(
        &self,
        path: &ElementPath,
        newer: Side,
        newer_element: &DataElement,
        older_element: &DataElement,
        locks: &mut LockSet,
    ) -> Result<SyncOutcome, EngineError> {
        let older = newer.other();
        let conflict = marked_path(path, Marker::Conflict, &Mark::fresh())?;
        locks.acquire(&self.sides, newer, &conflict).await?;
        locks.acquire(&self.sides, older, &conflict).await?;

        let code = self
            .sides
            .get(older)
            .move_element(path, &conflict)
            .await?;
        expect_ok("move", path, code)?;
        // Children are re-discovered from the subtree jobs below.
        self.baseline.purge_children(older.domain(), path).await?;
        self.baseline.purge_children(newer.domain(), path).await?;

        self.copy_over(newer, path, older, path, newer_element, JobKind::Init)
            .await?;
        self.copy_over(older, &conflict, newer, &conflict, older_element, JobKind::Init)
            .await?;

        self.store_fresh(newer, path).await?;
        self.store_fresh(older, path).await?;
        self.store_fresh(older, &conflict).await?;
        self.store_fresh(newer, &conflict).await?;

        info!(path = %path, newer = %newer, conflict = %conflict, "resolved conflict");
        Ok(SyncOutcome::Done)
    }
}
