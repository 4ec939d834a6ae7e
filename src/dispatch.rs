//! Completion Dispatcher
//!
//! Execution contexts onto which user-visible callbacks are marshalled, so
//! callback code never runs on a transport's delivery context. Queue-backed
//! dispatchers run jobs one at a time in submission order, which keeps the
//! callbacks of one task from overlapping.

use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

enum DispatcherKind {
    /// Run on the caller's thread
    Inline,
    /// Serial queue drained by a dedicated thread or runtime task
    Queue {
        label: String,
        tx: mpsc::UnboundedSender<Job>,
    },
}

/// Cloneable handle to a callback execution context
#[derive(Clone)]
pub struct CompletionDispatcher {
    kind: Arc<DispatcherKind>,
}

static MAIN: OnceLock<CompletionDispatcher> = OnceLock::new();

impl CompletionDispatcher {
    /// The process-wide "main" serial queue used when nothing else is configured
    pub fn main() -> Self {
        MAIN.get_or_init(|| Self::serial("netops.main")).clone()
    }

    /// Serial queue drained by its own thread
    pub fn serial(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_label = label.clone();

        let spawned = std::thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_job(&thread_label, job);
                }
                debug!("Dispatcher {} drained and stopped", thread_label);
            });

        match spawned {
            Ok(_) => Self {
                kind: Arc::new(DispatcherKind::Queue { label, tx }),
            },
            Err(e) => {
                error!("Failed to spawn dispatcher thread {}: {}; running inline", label, e);
                Self::inline()
            }
        }
    }

    /// Serial queue drained by a task on a tokio runtime
    pub fn on_runtime(label: impl Into<String>, runtime: &Handle) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let task_label = label.clone();

        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&task_label, job);
            }
        });

        Self {
            kind: Arc::new(DispatcherKind::Queue { label, tx }),
        }
    }

    /// Run callbacks directly on whichever thread delivers them
    pub fn inline() -> Self {
        Self {
            kind: Arc::new(DispatcherKind::Inline),
        }
    }

    /// Dispatcher label
    pub fn label(&self) -> &str {
        match self.kind.as_ref() {
            DispatcherKind::Inline => "inline",
            DispatcherKind::Queue { label, .. } => label,
        }
    }

    /// Schedule a job
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match self.kind.as_ref() {
            DispatcherKind::Inline => run_job("inline", Box::new(job)),
            DispatcherKind::Queue { label, tx } => {
                if let Err(mpsc::error::SendError(job)) = tx.send(Box::new(job)) {
                    warn!("Dispatcher {} is gone; running callback inline", label);
                    run_job(label, job);
                }
            }
        }
    }

    /// Block until every job dispatched before this call has run.
    ///
    /// Must not be called from a job running on this same dispatcher.
    pub fn wait_idle(&self) {
        let (tx, rx) = std::sync::mpsc::sync_channel::<()>(1);
        self.dispatch(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Wait until every job dispatched before this call has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl Default for CompletionDispatcher {
    fn default() -> Self {
        Self::main()
    }
}

impl std::fmt::Debug for CompletionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionDispatcher")
            .field("label", &self.label())
            .finish()
    }
}

fn run_job(label: &str, job: Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!("Callback panicked on dispatcher {}: {}", label, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_serial_preserves_order() {
        let dispatcher = CompletionDispatcher::serial("test.serial");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            dispatcher.dispatch(move || seen.lock().push(i));
        }
        dispatcher.wait_idle();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_stop_queue() {
        let dispatcher = CompletionDispatcher::serial("test.panic");
        let seen = Arc::new(Mutex::new(false));

        dispatcher.dispatch(|| panic!("boom"));
        let flag = Arc::clone(&seen);
        dispatcher.dispatch(move || *flag.lock() = true);
        dispatcher.wait_idle();

        assert!(*seen.lock());
    }

    #[test]
    fn test_inline_runs_immediately() {
        let dispatcher = CompletionDispatcher::inline();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.dispatch(move || *counter.lock() += 1);
        assert_eq!(*seen.lock(), 1);
        assert_eq!(dispatcher.label(), "inline");
    }

    #[tokio::test]
    async fn test_runtime_dispatcher_flush() {
        let dispatcher = CompletionDispatcher::on_runtime("test.runtime", &Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            dispatcher.dispatch(move || seen.lock().push(i));
        }
        dispatcher.flush().await;
        assert_eq!(seen.lock().len(), 10);
    }
}
