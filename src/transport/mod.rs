//! Transport Abstraction
//!
//! The core never performs I/O itself. A transport creates tasks, starts and
//! cancels them, and reports everything that happens to a task through a
//! [`SessionDelegate`]:
//! - `http`: reqwest-backed transport running on a tokio runtime
//! - `memory`: scriptable transport for driving the core by hand

pub mod challenge;
pub mod events;
pub mod http;
pub mod memory;
pub mod responder;
pub mod types;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

pub use challenge::{
    AuthenticationMethod, Challenge, ChallengeDisposition, ChallengeReply, Credential,
    ProtectionSpace, ServerTrust,
};
pub use events::TaskEvent;
pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::{MemoryTransport, TransportCommand};
pub use responder::{BackgroundCompletion, Responder};
pub use types::{
    CacheStoragePolicy, CachedResponse, Request, Response, ResponseDisposition, SendProgress,
    TaskKind, UNKNOWN_LENGTH,
};

use crate::error::{TransportError, TransportResult};

/// Transport-assigned task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to invalidate a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
    /// Let running tasks finish, then invalidate
    FinishTasks,
    /// Cancel all tasks, then invalidate
    CancelTasks,
}

/// Transport trait - the commands the core needs from a network session
pub trait Transport: Send + Sync {
    /// Attach the delegate that receives every event for this session
    fn attach(&self, delegate: Weak<dyn SessionDelegate>);

    /// Create a suspended task for a request
    fn create_task(&self, request: &Request, kind: TaskKind) -> TransportResult<TaskId>;

    /// Begin running a created task
    fn start_task(&self, task: TaskId) -> TransportResult<()>;

    /// Abort a task; the transport still reports its completion
    fn cancel_task(&self, task: TaskId);

    /// Forget a task that was never started. No events are reported for it.
    fn discard_task(&self, task: TaskId);

    /// Stop accepting tasks and report invalidation once drained
    fn invalidate(&self, mode: InvalidationMode);

    /// Get transport type name
    fn transport_type(&self) -> &'static str;
}

/// Receiver of transport events, implemented by the session manager
pub trait SessionDelegate: Send + Sync {
    /// An event for one task
    fn task_event(&self, task: TaskId, event: TaskEvent);

    /// A challenge not tied to any task
    fn session_challenge(&self, challenge: Challenge, reply: Responder<ChallengeReply>);

    /// The session became invalid; no further events follow
    fn session_invalidated(&self, error: Option<TransportError>);

    /// All queued background events have been delivered
    fn background_events_finished(&self);
}

/// Non-owning reference to a transport task.
///
/// Holding a handle never keeps the transport (or its task) alive.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    transport: Weak<dyn Transport>,
}

impl TaskHandle {
    pub fn new(id: TaskId, transport: Weak<dyn Transport>) -> Self {
        Self { id, transport }
    }

    /// Handle for a task of a live transport
    pub fn for_transport(id: TaskId, transport: &Arc<dyn Transport>) -> Self {
        Self::new(id, Arc::downgrade(transport))
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Ask the transport to start the task
    pub fn start(&self) -> TransportResult<()> {
        match self.transport.upgrade() {
            Some(transport) => transport.start_task(self.id),
            None => Err(TransportError::SessionInvalidated),
        }
    }

    /// Ask the transport to cancel the task
    pub fn cancel(&self) -> TransportResult<()> {
        match self.transport.upgrade() {
            Some(transport) => {
                transport.cancel_task(self.id);
                Ok(())
            }
            None => Err(TransportError::SessionInvalidated),
        }
    }

    /// Release a task that will never start; a gone transport is ignored
    pub fn discard(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.discard_task(self.id);
        }
    }

    /// Whether the owning transport is still alive
    pub fn is_attached(&self) -> bool {
        self.transport.strong_count() > 0
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_does_not_own_transport() {
        let transport: Arc<dyn Transport> = MemoryTransport::new();
        let handle = TaskHandle::for_transport(TaskId(1), &transport);
        assert!(handle.is_attached());

        drop(transport);
        assert!(!handle.is_attached());
        assert_eq!(handle.start(), Err(TransportError::SessionInvalidated));
        assert_eq!(handle.cancel(), Err(TransportError::SessionInvalidated));
    }
}
