//! Operation Registry
//!
//! Maps transport task ids to the operation that owns them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{OperationError, OperationResult};
use crate::operation::{
    DataTaskOperation, OperationId, OperationState, QueuedOperation, TaskOperation,
};
use crate::transport::TaskId;

/// An operation registered under a task id
#[derive(Clone, Debug)]
pub enum RegisteredOperation {
    Task(Arc<TaskOperation>),
    Data(Arc<DataTaskOperation>),
}

impl RegisteredOperation {
    /// The base task operation
    pub fn task(&self) -> &Arc<TaskOperation> {
        match self {
            Self::Task(op) => op,
            Self::Data(op) => op.task(),
        }
    }

    pub fn as_data(&self) -> Option<&Arc<DataTaskOperation>> {
        match self {
            Self::Data(op) => Some(op),
            Self::Task(_) => None,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.task().id()
    }

    /// The operation as the execution queue sees it
    pub fn as_queued(&self) -> Arc<dyn QueuedOperation> {
        match self {
            Self::Task(op) => Arc::clone(op) as Arc<dyn QueuedOperation>,
            Self::Data(op) => Arc::clone(op) as Arc<dyn QueuedOperation>,
        }
    }

    pub fn cancel(&self) {
        self.task().cancel();
    }

    /// Serializable snapshot
    pub fn info(&self) -> OperationInfo {
        let task = self.task();
        let lifecycle = task.lifecycle();
        let progress = self.as_data().map(|op| op.progress());

        OperationInfo {
            operation_id: task.id(),
            task_id: task.task_id(),
            kind: match self {
                Self::Task(_) => "upload".to_string(),
                Self::Data(_) => "data".to_string(),
            },
            method: task.request().method.to_string(),
            url: task.request().url.to_string(),
            state: task.state(),
            cancelled: task.is_cancelled(),
            status: task.response().map(|r| r.status.as_u16()),
            bytes_received: progress.map(|p| p.received),
            bytes_expected: progress.map(|p| p.expected),
            error: task.error().map(|e| e.to_string()),
            created_at: lifecycle.created_at().to_rfc3339(),
            started_at: lifecycle.started_at().map(|t| t.to_rfc3339()),
            finished_at: lifecycle.finished_at().map(|t| t.to_rfc3339()),
            duration_ms: lifecycle.duration_ms(),
        }
    }
}

/// Operation snapshot for listings and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub operation_id: OperationId,
    pub task_id: TaskId,
    pub kind: String,
    pub method: String,
    pub url: String,
    pub state: OperationState,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_expected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Task id → operation map
#[derive(Default)]
pub struct Registry {
    operations: DashMap<TaskId, RegisteredOperation>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation; a task id can have only one owner
    pub fn insert(&self, task_id: TaskId, operation: RegisteredOperation) -> OperationResult<()> {
        match self.operations.entry(task_id) {
            Entry::Occupied(_) => Err(OperationError::DuplicateTask(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                debug!("Registered task {}", task_id);
                Ok(())
            }
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<RegisteredOperation> {
        self.operations.get(&task_id).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `task_id` only if `operation_id` still owns it
    pub fn remove(&self, task_id: TaskId, operation_id: OperationId) -> bool {
        let removed = self
            .operations
            .remove_if(&task_id, |_, op| op.operation_id() == operation_id)
            .is_some();
        if removed {
            debug!("Unregistered task {}", task_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Every registered operation
    pub fn operations(&self) -> Vec<RegisteredOperation> {
        self.operations.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshots ordered by task id
    pub fn snapshot(&self) -> Vec<OperationInfo> {
        let mut infos: Vec<OperationInfo> = self.operations.iter().map(|e| e.value().info()).collect();
        infos.sort_by_key(|info| info.task_id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CompletionDispatcher;
    use crate::operation::TaskHandlers;
    use crate::transport::{MemoryTransport, Request, TaskKind, Transport};

    fn make_task(transport: &Arc<MemoryTransport>) -> Arc<TaskOperation> {
        let request = Request::parse(reqwest::Method::POST, "https://example.com/a").unwrap();
        let id = transport.create_task(&request, TaskKind::Upload).unwrap();
        Arc::new(TaskOperation::new(
            transport.handle(id),
            request,
            TaskHandlers::new(),
            CompletionDispatcher::inline(),
        ))
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let transport = MemoryTransport::new();
        let registry = Registry::new();
        let op = make_task(&transport);

        registry
            .insert(op.task_id(), RegisteredOperation::Task(Arc::clone(&op)))
            .unwrap();
        let again = registry.insert(op.task_id(), RegisteredOperation::Task(Arc::clone(&op)));
        assert!(matches!(again, Err(OperationError::DuplicateTask(id)) if id == op.task_id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_requires_owner() {
        let transport = MemoryTransport::new();
        let registry = Registry::new();
        let op = make_task(&transport);
        registry
            .insert(op.task_id(), RegisteredOperation::Task(Arc::clone(&op)))
            .unwrap();

        assert!(!registry.remove(op.task_id(), OperationId::new()));
        assert!(registry.get(op.task_id()).is_some());
        assert!(registry.remove(op.task_id(), op.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let transport = MemoryTransport::new();
        let registry = Registry::new();
        let op = make_task(&transport);
        registry
            .insert(op.task_id(), RegisteredOperation::Task(Arc::clone(&op)))
            .unwrap();

        let infos = registry.snapshot();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].state, OperationState::Pending);
        assert_eq!(infos[0].method, "POST");

        let json = serde_json::to_value(&infos[0]).unwrap();
        assert_eq!(json["kind"], "upload");
        assert!(json.get("startedAt").is_none());
    }
}
