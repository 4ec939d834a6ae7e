//! netops
//!
//! Cancellable, queryable task operations over an event-driven network
//! transport, routed through a session manager with a bounded execution queue.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod operation;
pub mod security;
pub mod transport;

pub use config::{SecurityConfig, SessionConfig};
pub use dispatch::CompletionDispatcher;
pub use error::{
    ConfigError, OperationError, OperationResult, TaskError, TransportError, TransportResult,
};
pub use manager::{
    ExecutionQueue, ManagerOptions, OperationEvent, OperationInfo, RegisteredOperation,
    SessionManager,
};
pub use operation::{
    BlockOperation, Completion, DataProgress, DataTaskHandlers, DataTaskOperation, OperationId,
    OperationState, QueuedOperation, TaskHandlers, TaskOperation,
};
pub use security::{PinningMode, SecurityPolicy, TrustDecision, TrustEvaluator};
pub use transport::{
    Challenge, ChallengeReply, Credential, HttpTransport, HttpTransportConfig, MemoryTransport,
    Request, Response, TaskHandle, TaskId, Transport,
};
