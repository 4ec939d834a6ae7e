//! Operation Events
//!
//! Broadcast notifications about operations owned by a session manager.

use serde::{Deserialize, Serialize};

use super::registry::OperationInfo;
use crate::operation::OperationId;
use crate::transport::TaskId;

/// Events broadcast by a session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationEvent {
    /// Operation registered and queued
    Created(OperationInfo),

    /// Operation reached `Finished`
    Finished {
        operation_id: OperationId,
        task_id: TaskId,
        cancelled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The transport session became invalid
    SessionInvalidated {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OperationEvent {
    /// Get event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created(_) => "operation-created",
            Self::Finished { .. } => "operation-finished",
            Self::SessionInvalidated { .. } => "session-invalidated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = OperationEvent::Finished {
            operation_id: OperationId::new(),
            task_id: TaskId(4),
            cancelled: true,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["task_id"], 4);
        assert!(json.get("error").is_none());
        assert_eq!(event.name(), "operation-finished");
    }
}
