//! Operations
//!
//! Cancellable units of work that run on an [`ExecutionQueue`]:
//! - `TaskOperation`: wraps one transport task and its callbacks
//! - `DataTaskOperation`: adds response streaming and accumulation
//! - `BlockOperation`: wraps an arbitrary closure
//!
//! [`ExecutionQueue`]: crate::manager::ExecutionQueue

pub mod block;
pub mod data;
pub mod lifecycle;
pub mod task;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub use block::BlockOperation;
pub use data::{DataProgress, DataTaskHandlers, DataTaskOperation};
pub use lifecycle::{CancelOutcome, FinishHook, Lifecycle, OperationState};
pub use task::{Completion, TaskHandlers, TaskOperation};

/// Process-unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work the execution queue can schedule.
///
/// `execute` must eventually drive the lifecycle to `Finished`; the queue
/// holds the operation's slot until it does.
pub trait QueuedOperation: Send + Sync {
    fn id(&self) -> OperationId;

    fn lifecycle(&self) -> &Lifecycle;

    /// Begin executing
    fn execute(self: Arc<Self>);

    /// Request cancellation
    fn abort(self: Arc<Self>);

    /// Name for logging
    fn name(&self) -> String {
        format!("operation {}", self.id())
    }
}
