//! Execution Queue
//!
//! Bounded-concurrency queue for operations. An operation holds a slot from
//! the moment it is started until its lifecycle reaches `Finished`.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Notify;

use crate::operation::{OperationId, QueuedOperation};

struct QueueState {
    /// `None` means unbounded
    max_concurrent: Option<usize>,
    suspended: bool,
    waiting: VecDeque<Arc<dyn QueuedOperation>>,
    executing: HashMap<OperationId, Arc<dyn QueuedOperation>>,
    high_water_mark: usize,
}

impl QueueState {
    fn has_free_slot(&self) -> bool {
        self.max_concurrent
            .map_or(true, |max| self.executing.len() < max)
    }

    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.executing.is_empty()
    }
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Shared handle to a queue of operations
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

static SHARED: OnceLock<ExecutionQueue> = OnceLock::new();

impl ExecutionQueue {
    /// Create an unbounded queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    max_concurrent: None,
                    suspended: false,
                    waiting: VecDeque::new(),
                    executing: HashMap::new(),
                    high_water_mark: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Create a queue running at most `max` operations at once
    pub fn with_max_concurrent(name: impl Into<String>, max: usize) -> Self {
        let queue = Self::new(name);
        queue.set_max_concurrent(Some(max));
        queue
    }

    /// The process-wide queue used by managers without a dedicated one
    pub fn shared() -> Self {
        SHARED
            .get_or_init(|| Self::new("netops.shared"))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Change the concurrency cap; raising it starts waiting operations
    pub fn set_max_concurrent(&self, max: Option<usize>) {
        // a zero cap would never drain
        self.inner.state.lock().max_concurrent = max.map(|m| m.max(1));
        self.pump();
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.inner.state.lock().max_concurrent
    }

    /// Submit an operation. Already finished operations are ignored.
    ///
    /// From here on only the queue starts the operation.
    pub fn add(&self, operation: Arc<dyn QueuedOperation>) {
        {
            let mut state = self.inner.state.lock();
            if !operation.lifecycle().mark_queued() {
                debug!("Queue {}: skipping finished {}", self.inner.name, operation.name());
                return;
            }
            state.waiting.push_back(Arc::clone(&operation));
        }
        debug!("Queue {}: added {}", self.inner.name, operation.name());

        // runs at once if the operation finished after it was pushed
        let id = operation.id();
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        operation.lifecycle().on_finish(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                ExecutionQueue { inner }.release(id);
            }
        }));
        self.pump();
    }

    /// Stop starting new operations; running ones are unaffected
    pub fn suspend(&self) {
        self.inner.state.lock().suspended = true;
        info!("Queue {} suspended", self.inner.name);
    }

    pub fn resume(&self) {
        self.inner.state.lock().suspended = false;
        info!("Queue {} resumed", self.inner.name);
        self.pump();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Cancel every waiting and executing operation
    pub fn cancel_all(&self) {
        let operations: Vec<Arc<dyn QueuedOperation>> = {
            let state = self.inner.state.lock();
            state
                .waiting
                .iter()
                .cloned()
                .chain(state.executing.values().cloned())
                .collect()
        };
        info!("Queue {}: cancelling {} operation(s)", self.inner.name, operations.len());
        for operation in operations {
            operation.abort();
        }
    }

    pub fn executing_count(&self) -> usize {
        self.inner.state.lock().executing.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Most operations ever executing at once
    pub fn high_water_mark(&self) -> usize {
        self.inner.state.lock().high_water_mark
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Wait until nothing is waiting or executing
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, id: OperationId) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.executing.remove(&id).is_none() {
                state.waiting.retain(|op| op.id() != id);
            }
            state.is_idle()
        };
        debug!("Queue {}: released slot of {}", self.inner.name, id);
        if idle {
            self.inner.idle.notify_waiters();
        }
        self.pump();
    }

    /// Start waiting operations while slots are free
    fn pump(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if state.suspended || !state.has_free_slot() {
                    break;
                }
                let Some(operation) = state.waiting.pop_front() else {
                    break;
                };
                if operation.lifecycle().is_finished() {
                    continue;
                }
                state.executing.insert(operation.id(), Arc::clone(&operation));
                state.high_water_mark = state.high_water_mark.max(state.executing.len());
                operation
            };

            debug!("Queue {}: starting {}", self.inner.name, next.name());
            next.execute();
        }

        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExecutionQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &state.max_concurrent)
            .field("executing", &state.executing.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}
