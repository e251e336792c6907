use tracing::{debug, error, info, warn};

use strata_store::Backend;

use crate::error::{CoreError, CoreResult};
use crate::events::StoreEvent;

/// Nesting counter around the backend transaction.
///
/// Only the outermost `start` opens a transaction and only the matching
/// outermost `end` commits it. Attribute writes made inside the batch go to
/// the staging area; the outermost `end` flushes staging into permanent
/// storage inside the same transaction, and only when something was staged.
///
/// Change events raised inside a batch are held back until the outermost
/// level commits, and dropped if it rolls back.
#[derive(Debug, Default)]
pub(crate) struct BatchController {
    depth: usize,
    staging_dirty: bool,
    pending: Vec<StoreEvent>,
    committed: Vec<StoreEvent>,
}

impl BatchController {
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn is_open(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn start(&mut self, backend: &mut dyn Backend) -> CoreResult<()> {
        if self.depth == 0 {
            backend.begin()?;
        }
        self.depth += 1;
        debug!(depth = self.depth, "batch started");
        Ok(())
    }

    /// Close one nesting level. Returns the number of rows flushed, which is
    /// zero for every level but the outermost.
    pub(crate) fn end(&mut self, backend: &mut dyn Backend) -> CoreResult<usize> {
        if self.depth == 0 {
            error!("batch ended without being started");
            return Err(CoreError::protocol("batch ended without being started"));
        }
        self.depth -= 1;
        debug!(depth = self.depth, "batch ended");
        if self.depth > 0 {
            return Ok(0);
        }

        match Self::finish(backend, self.staging_dirty) {
            Ok(flushed) => {
                self.staging_dirty = false;
                self.committed.append(&mut self.pending);
                Ok(flushed)
            }
            Err(err) => {
                self.staging_dirty = false;
                self.pending.clear();
                if backend.in_transaction() {
                    if let Err(rollback) = backend.rollback() {
                        warn!(error = %rollback, "rollback after failed commit also failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn finish(backend: &mut dyn Backend, flush: bool) -> CoreResult<usize> {
        let flushed = if flush {
            let rows = backend.flush_staging()?;
            info!(rows, "flushed staging");
            rows
        } else {
            0
        };
        backend.commit()?;
        Ok(flushed)
    }

    /// Close one nesting level after a failure. At the outermost level the
    /// transaction and everything staged in it are rolled back.
    pub(crate) fn abort(&mut self, backend: &mut dyn Backend) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.staging_dirty = false;
            let dropped = self.pending.len();
            self.pending.clear();
            if dropped > 0 {
                debug!(dropped, "discarded events of rolled back batch");
            }
            match backend.rollback() {
                Ok(()) => warn!("batch rolled back"),
                Err(err) => warn!(error = %err, "batch rollback failed"),
            }
        }
    }

    /// Record that a write was staged. Writes need an open batch.
    pub(crate) fn note_write(&mut self) -> CoreResult<()> {
        if self.depth == 0 {
            error!("write attempted outside a batch");
            return Err(CoreError::protocol("write attempted outside a batch"));
        }
        self.staging_dirty = true;
        Ok(())
    }

    /// Hold `event` until the outermost level commits.
    pub(crate) fn defer(&mut self, event: StoreEvent) -> Result<(), StoreEvent> {
        if self.depth == 0 {
            return Err(event);
        }
        self.pending.push(event);
        Ok(())
    }

    /// Events of batches that have committed since the last call.
    pub(crate) fn take_committed(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.committed)
    }

    /// Forget all nesting state. Used after the backend was reset.
    pub(crate) fn clear(&mut self) {
        self.depth = 0;
        self.staging_dirty = false;
        self.pending.clear();
        self.committed.clear();
    }
}
