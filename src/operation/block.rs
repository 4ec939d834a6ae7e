//! Block Operation
//!
//! Runs an arbitrary closure as a queued operation.

use log::{debug, error};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::lifecycle::{CancelOutcome, Lifecycle};
use super::{OperationId, QueuedOperation};

type Work = Box<dyn FnOnce() + Send>;

/// Queued operation wrapping a closure
pub struct BlockOperation {
    id: OperationId,
    label: String,
    lifecycle: Lifecycle,
    work: Mutex<Option<Work>>,
}

impl BlockOperation {
    pub fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self::named("block", work)
    }

    pub fn named(label: impl Into<String>, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: OperationId::new(),
            label: label.into(),
            lifecycle: Lifecycle::new(),
            work: Mutex::new(Some(Box::new(work))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    pub async fn finished(&self) {
        self.lifecycle.finished().await
    }

    fn run(self: Arc<Self>) {
        let work = self.work.lock().take();
        if let Some(work) = work.filter(|_| !self.lifecycle.is_cancelled()) {
            if catch_unwind(AssertUnwindSafe(work)).is_err() {
                error!("Block operation {} panicked", self.label);
            }
        }
        self.lifecycle.finish(|| debug!("Block operation {} finished", self.label));
    }
}

impl QueuedOperation for BlockOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn execute(self: Arc<Self>) {
        if let Err(e) = self.lifecycle.begin() {
            debug!("Block operation {} not started: {}", self.label, e);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || self.run());
            }
            Err(_) => {
                let op = Arc::clone(&self);
                if let Err(e) = std::thread::Builder::new()
                    .name(format!("netops.{}", self.label))
                    .spawn(move || op.run())
                {
                    error!("Failed to spawn thread for {}: {}", self.label, e);
                    self.lifecycle.finish(|| {});
                }
            }
        }
    }

    fn abort(self: Arc<Self>) {
        // a running closure cannot be interrupted; it finishes on its own
        if self.lifecycle.mark_cancelled() == CancelOutcome::WasPending {
            self.work.lock().take();
            self.lifecycle.finish(|| debug!("Block operation {} cancelled", self.label));
        }
    }

    fn name(&self) -> String {
        format!("{} {}", self.label, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_block_runs_and_finishes() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let op = Arc::new(BlockOperation::new(move || flag.store(true, Ordering::SeqCst)));

        Arc::clone(&op).execute();
        op.finished().await;

        assert!(ran.load(Ordering::SeqCst));
        assert!(op.is_finished());
    }

    #[test]
    fn test_block_without_runtime() {
        let op = Arc::new(BlockOperation::named("plain", || {}));
        Arc::clone(&op).execute();

        for _ in 0..200 {
            if op.is_finished() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(op.is_finished());
        assert!(!op.is_cancelled());
    }

    #[test]
    fn test_cancel_pending_block_skips_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let op = Arc::new(BlockOperation::new(move || flag.store(true, Ordering::SeqCst)));

        Arc::clone(&op).abort();
        Arc::clone(&op).execute();

        assert!(op.is_finished());
        assert!(op.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_block_still_finishes() {
        let op = Arc::new(BlockOperation::new(|| panic!("boom")));
        Arc::clone(&op).execute();
        op.finished().await;
        assert!(op.is_finished());
    }
}
