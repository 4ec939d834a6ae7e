//! Operation Lifecycle
//!
//! The state machine shared by every queued operation:
//!
//! ```text
//! Pending → Executing → Finished
//!    └──── cancelled ────┘
//! ```
//!
//! Cancellation is a flag, not a state; a cancelled operation still ends in
//! `Finished`. `finish` is the only way into `Finished` and only its first
//! caller wins.

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::OperationError;

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Created, not yet started
    Pending,
    /// Started and occupying a queue slot
    Executing,
    /// Terminal
    Finished,
}

impl Default for OperationState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executing => write!(f, "executing"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// What a cancel request found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// First cancel, before start; the caller must synthesize the finish
    WasPending,
    /// First cancel, while running; the caller must abort the work
    WasExecuting,
    /// Already cancelled or finished; nothing to do
    NoEffect,
}

/// Callback run once when an operation reaches `Finished`
pub type FinishHook = Box<dyn FnOnce() + Send>;

struct LifecycleInner {
    state: OperationState,
    cancelled: bool,
    /// Owned by an execution queue; only the queue may start it
    queued: bool,
    hooks: Vec<FinishHook>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle state machine with finish notification
pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
    state_tx: watch::Sender<OperationState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(OperationState::Pending);
        Self {
            inner: Mutex::new(LifecycleInner {
                state: OperationState::Pending,
                cancelled: false,
                queued: false,
                hooks: Vec::new(),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
            state_tx,
        }
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn is_executing(&self) -> bool {
        self.state() == OperationState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == OperationState::Finished
    }

    /// Pending → Executing. Rejected once started, cancelled or finished.
    pub fn begin(&self) -> Result<(), OperationError> {
        self.begin_checked(false)
    }

    /// Like [`begin`](Self::begin), for callers other than the owning queue.
    /// Rejected with [`OperationError::Queued`] once a queue owns the operation.
    pub fn begin_unqueued(&self) -> Result<(), OperationError> {
        self.begin_checked(true)
    }

    fn begin_checked(&self, reject_queued: bool) -> Result<(), OperationError> {
        {
            let mut inner = self.inner.lock();
            if reject_queued && inner.queued && inner.state == OperationState::Pending {
                return Err(OperationError::Queued);
            }
            match inner.state {
                OperationState::Pending if inner.cancelled => {
                    return Err(OperationError::CancelledBeforeStart);
                }
                OperationState::Pending => {
                    inner.state = OperationState::Executing;
                    inner.started_at = Some(Utc::now());
                }
                state => {
                    return Err(OperationError::InvalidTransition {
                        state,
                        action: "start",
                    });
                }
            }
        }
        self.state_tx.send_replace(OperationState::Executing);
        Ok(())
    }

    /// Set the cancelled flag and report what the caller has to do about it
    pub fn mark_cancelled(&self) -> CancelOutcome {
        let mut inner = self.inner.lock();
        if inner.cancelled || inner.state == OperationState::Finished {
            return CancelOutcome::NoEffect;
        }
        inner.cancelled = true;
        match inner.state {
            OperationState::Pending => CancelOutcome::WasPending,
            _ => CancelOutcome::WasExecuting,
        }
    }

    /// Hand the operation to a queue. Returns false if it already finished.
    pub fn mark_queued(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == OperationState::Finished {
            return false;
        }
        inner.queued = true;
        true
    }

    pub fn is_queued(&self) -> bool {
        self.inner.lock().queued
    }

    /// Set the cancelled flag only if the operation never started.
    /// Returns true if this call cancelled it.
    pub fn cancel_if_pending(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == OperationState::Pending && !inner.cancelled {
            inner.cancelled = true;
            true
        } else {
            false
        }
    }

    /// Move to `Finished`. Returns false if another caller already did.
    ///
    /// `on_commit` runs after the transition is committed and before the
    /// finish hooks, only for the winning caller.
    pub fn finish(&self, on_commit: impl FnOnce()) -> bool {
        let hooks = {
            let mut inner = self.inner.lock();
            if inner.state == OperationState::Finished {
                return false;
            }
            inner.state = OperationState::Finished;
            inner.finished_at = Some(Utc::now());
            std::mem::take(&mut inner.hooks)
        };

        self.state_tx.send_replace(OperationState::Finished);
        on_commit();

        debug!("Lifecycle finished, running {} hook(s)", hooks.len());
        for hook in hooks {
            hook();
        }
        true
    }

    /// Run `hook` when the operation finishes, or now if it already has
    pub fn on_finish(&self, hook: FinishHook) {
        let mut inner = self.inner.lock();
        if inner.state == OperationState::Finished {
            drop(inner);
            hook();
        } else {
            inner.hooks.push(hook);
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.state_tx.subscribe()
    }

    /// Wait until the operation is finished
    pub async fn finished(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == OperationState::Finished).await;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.lock().created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().finished_at
    }

    /// Time spent executing, in milliseconds
    pub fn duration_ms(&self) -> Option<u64> {
        let inner = self.inner.lock();
        let start = inner.started_at?;
        let end = inner.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Lifecycle")
            .field("state", &inner.state)
            .field("cancelled", &inner.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), OperationState::Pending);

        lifecycle.begin().unwrap();
        assert!(lifecycle.is_executing());
        assert!(lifecycle.started_at().is_some());
        assert!(matches!(
            lifecycle.begin(),
            Err(OperationError::InvalidTransition { action: "start", .. })
        ));

        assert!(lifecycle.finish(|| {}));
        assert!(lifecycle.is_finished());
        assert!(!lifecycle.finish(|| panic!("second finish must not commit")));
    }

    #[test]
    fn test_cancel_outcomes() {
        let pending = Lifecycle::new();
        assert_eq!(pending.mark_cancelled(), CancelOutcome::WasPending);
        assert_eq!(pending.mark_cancelled(), CancelOutcome::NoEffect);
        assert!(matches!(pending.begin(), Err(OperationError::CancelledBeforeStart)));

        let running = Lifecycle::new();
        running.begin().unwrap();
        assert_eq!(running.mark_cancelled(), CancelOutcome::WasExecuting);
        assert!(running.is_cancelled());

        let done = Lifecycle::new();
        done.finish(|| {});
        assert_eq!(done.mark_cancelled(), CancelOutcome::NoEffect);
        assert!(!done.is_cancelled());
    }

    #[test]
    fn test_queued_lifecycle_rejects_outside_start() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_unqueued().unwrap();
        assert!(lifecycle.is_executing());

        let queued = Lifecycle::new();
        assert!(queued.mark_queued());
        assert!(queued.is_queued());
        assert!(matches!(queued.begin_unqueued(), Err(OperationError::Queued)));
        assert_eq!(queued.state(), OperationState::Pending);
        queued.begin().unwrap();
        assert!(queued.is_executing());

        let done = Lifecycle::new();
        done.finish(|| {});
        assert!(!done.mark_queued());
    }

    #[test]
    fn test_cancel_if_pending() {
        let pending = Lifecycle::new();
        assert!(pending.cancel_if_pending());
        assert!(pending.is_cancelled());
        assert!(!pending.cancel_if_pending());

        let running = Lifecycle::new();
        running.begin().unwrap();
        assert!(!running.cancel_if_pending());
        assert!(!running.is_cancelled());
    }

    #[test]
    fn test_hooks_run_once() {
        let lifecycle = Lifecycle::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        lifecycle.on_finish(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        lifecycle.finish(|| {});
        lifecycle.finish(|| {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // late hooks run immediately
        let counter = Arc::clone(&calls);
        lifecycle.on_finish(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_finish_has_one_winner() {
        let lifecycle = Arc::new(Lifecycle::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if lifecycle.finish(|| {}) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finished_waiter() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.finished().await })
        };
        lifecycle.begin().unwrap();
        lifecycle.finish(|| {});
        waiter.await.unwrap();
    }
}
