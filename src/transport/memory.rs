//! In-memory Transport
//!
//! Records every command it receives and emits whatever events the caller
//! scripts, so the routing core can be driven deterministically.

use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use super::challenge::{Challenge, ChallengeReply};
use super::events::TaskEvent;
use super::responder::Responder;
use super::types::{CachedResponse, Request, Response, ResponseDisposition, SendProgress, TaskKind};
use super::{InvalidationMode, SessionDelegate, TaskHandle, TaskId, Transport};
use crate::error::{TransportError, TransportResult};

/// A command the core sent to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Create { task: TaskId, url: String, kind: TaskKind },
    Start(TaskId),
    Cancel(TaskId),
    Discard(TaskId),
    Invalidate(InvalidationMode),
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskRecord {
    started: bool,
    completed: bool,
}

/// Scriptable transport
pub struct MemoryTransport {
    self_ref: Weak<MemoryTransport>,
    delegate: RwLock<Option<Weak<dyn SessionDelegate>>>,
    next_id: AtomicU64,
    commands: Mutex<Vec<TransportCommand>>,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    invalidating: AtomicBool,
    invalidated: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            delegate: RwLock::new(None),
            next_id: AtomicU64::new(1),
            commands: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            invalidating: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        })
    }

    /// Handle to one of this transport's tasks
    pub fn handle(&self, task: TaskId) -> TaskHandle {
        let transport: Weak<dyn Transport> = self.self_ref.clone();
        TaskHandle::new(task, transport)
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands.lock().clone()
    }

    pub fn was_started(&self, task: TaskId) -> bool {
        self.tasks.lock().get(&task).is_some_and(|t| t.started)
    }

    pub fn was_cancelled(&self, task: TaskId) -> bool {
        self.cancel_count(task) > 0
    }

    pub fn was_discarded(&self, task: TaskId) -> bool {
        self.commands.lock().contains(&TransportCommand::Discard(task))
    }

    /// Tasks created and not yet discarded
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn cancel_count(&self, task: TaskId) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| **c == TransportCommand::Cancel(task))
            .count()
    }

    /// Tasks started and not yet completed
    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut running: Vec<TaskId> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.started && !t.completed)
            .map(|(id, _)| *id)
            .collect();
        running.sort();
        running
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.read().as_ref().and_then(|d| d.upgrade())
    }

    /// Deliver an event for a task
    pub fn emit(&self, task: TaskId, event: TaskEvent) {
        let terminal = event.is_terminal();
        debug!("Memory transport emitting {} for task {}", event.name(), task);
        if let Some(delegate) = self.delegate() {
            delegate.task_event(task, event);
        }
        if terminal {
            if let Some(record) = self.tasks.lock().get_mut(&task) {
                record.completed = true;
            }
            self.report_invalidated_when_drained();
        }
    }

    pub fn respond(&self, task: TaskId, response: Response) -> oneshot::Receiver<ResponseDisposition> {
        let (reply, rx) = Responder::channel("response-received", ResponseDisposition::Cancel);
        self.emit(task, TaskEvent::ResponseReceived { response, reply });
        rx
    }

    pub fn send_data(&self, task: TaskId, chunk: impl Into<Bytes>) {
        self.emit(task, TaskEvent::DataReceived { chunk: chunk.into() });
    }

    pub fn send_body(&self, task: TaskId, progress: SendProgress) {
        self.emit(task, TaskEvent::SentBodyData(progress));
    }

    pub fn request_body(&self, task: TaskId) -> oneshot::Receiver<Option<Bytes>> {
        let (reply, rx) = Responder::channel("need-new-body-stream", None);
        self.emit(task, TaskEvent::NeedNewBodyStream { reply });
        rx
    }

    pub fn redirect(
        &self,
        task: TaskId,
        response: Response,
        request: Request,
    ) -> oneshot::Receiver<Option<Request>> {
        let (reply, rx) = Responder::channel("will-redirect", None);
        self.emit(task, TaskEvent::WillRedirect { response, request, reply });
        rx
    }

    pub fn propose_cache(
        &self,
        task: TaskId,
        proposed: CachedResponse,
    ) -> oneshot::Receiver<Option<CachedResponse>> {
        let (reply, rx) = Responder::channel("will-cache-response", None);
        self.emit(task, TaskEvent::WillCacheResponse { proposed, reply });
        rx
    }

    /// Convert a task into a new download task and return its id
    pub fn become_download(&self, task: TaskId) -> TaskId {
        let download = self.allocate(String::new(), TaskKind::Data);
        if let Some(record) = self.tasks.lock().get_mut(&download) {
            record.started = true;
        }
        self.emit(task, TaskEvent::BecameDownload { download: self.handle(download) });
        // the original task never reports again
        if let Some(record) = self.tasks.lock().get_mut(&task) {
            record.completed = true;
        }
        download
    }

    pub fn challenge(&self, task: TaskId, challenge: Challenge) -> oneshot::Receiver<ChallengeReply> {
        let (reply, rx) = Responder::channel("challenge", ChallengeReply::cancel());
        self.emit(task, TaskEvent::Challenge { challenge, reply });
        rx
    }

    pub fn session_challenge(&self, challenge: Challenge) -> oneshot::Receiver<ChallengeReply> {
        let (reply, rx) = Responder::channel("session-challenge", ChallengeReply::cancel());
        if let Some(delegate) = self.delegate() {
            delegate.session_challenge(challenge, reply);
        }
        rx
    }

    pub fn complete(&self, task: TaskId, error: Option<TransportError>) {
        self.emit(task, TaskEvent::Completed { error });
    }

    /// Report that the session became invalid
    pub fn report_invalidated(&self, error: Option<TransportError>) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.invalidating.store(true, Ordering::SeqCst);
        if let Some(delegate) = self.delegate() {
            delegate.session_invalidated(error);
        }
    }

    pub fn finish_background_events(&self) {
        if let Some(delegate) = self.delegate() {
            delegate.background_events_finished();
        }
    }

    fn allocate(&self, url: String, kind: TaskKind) -> TaskId {
        let task = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().insert(task, TaskRecord::default());
        self.commands
            .lock()
            .push(TransportCommand::Create { task, url, kind });
        task
    }

    fn report_invalidated_when_drained(&self) {
        if self.invalidating.load(Ordering::SeqCst) && self.running_tasks().is_empty() {
            self.report_invalidated(None);
        }
    }
}

impl Transport for MemoryTransport {
    fn attach(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    fn create_task(&self, request: &Request, kind: TaskKind) -> TransportResult<TaskId> {
        if self.invalidating.load(Ordering::SeqCst) {
            return Err(TransportError::SessionInvalidated);
        }
        match request.url.scheme() {
            "http" | "https" => Ok(self.allocate(request.url.to_string(), kind)),
            other => Err(TransportError::UnsupportedUrl(format!(
                "scheme '{}' in {}",
                other, request.url
            ))),
        }
    }

    fn start_task(&self, task: TaskId) -> TransportResult<()> {
        if self.invalidated.load(Ordering::SeqCst) {
            return Err(TransportError::SessionInvalidated);
        }
        let mut tasks = self.tasks.lock();
        let record = tasks.get_mut(&task).ok_or(TransportError::UnknownTask(task))?;
        record.started = true;
        drop(tasks);
        self.commands.lock().push(TransportCommand::Start(task));
        Ok(())
    }

    fn cancel_task(&self, task: TaskId) {
        self.commands.lock().push(TransportCommand::Cancel(task));
    }

    fn discard_task(&self, task: TaskId) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&task).is_some_and(|t| !t.started) {
            tasks.remove(&task);
        }
        drop(tasks);
        self.commands.lock().push(TransportCommand::Discard(task));
    }

    fn invalidate(&self, mode: InvalidationMode) {
        self.commands.lock().push(TransportCommand::Invalidate(mode));
        self.invalidating.store(true, Ordering::SeqCst);

        if mode == InvalidationMode::CancelTasks {
            for task in self.running_tasks() {
                self.complete(task, Some(TransportError::Cancelled));
            }
        }
        self.report_invalidated_when_drained();
    }

    fn transport_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_scheme() {
        let transport = MemoryTransport::new();
        let request = Request::parse(reqwest::Method::GET, "ftp://example.com/file").unwrap();
        assert!(matches!(
            transport.create_task(&request, TaskKind::Data),
            Err(TransportError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_records_commands() {
        let transport = MemoryTransport::new();
        let request = Request::parse(reqwest::Method::GET, "https://example.com").unwrap();
        let task = transport.create_task(&request, TaskKind::Data).unwrap();

        transport.start_task(task).unwrap();
        transport.cancel_task(task);

        assert!(transport.was_started(task));
        assert!(transport.was_cancelled(task));
        assert_eq!(transport.running_tasks(), vec![task]);
        assert_eq!(transport.commands().len(), 3);
        assert_eq!(
            transport.start_task(TaskId(99)),
            Err(TransportError::UnknownTask(TaskId(99)))
        );
    }

    #[test]
    fn test_discard_forgets_unstarted_task() {
        let transport = MemoryTransport::new();
        let request = Request::parse(reqwest::Method::GET, "https://example.com").unwrap();
        let idle = transport.create_task(&request, TaskKind::Data).unwrap();
        let running = transport.create_task(&request, TaskKind::Data).unwrap();
        transport.start_task(running).unwrap();

        transport.discard_task(idle);
        transport.discard_task(running);

        assert!(transport.was_discarded(idle));
        assert_eq!(transport.task_count(), 1);
        assert_eq!(transport.running_tasks(), vec![running]);
        assert_eq!(
            transport.start_task(idle),
            Err(TransportError::UnknownTask(idle))
        );
    }

    #[test]
    fn test_invalidate_without_tasks_rejects_new_work() {
        let transport = MemoryTransport::new();
        transport.invalidate(InvalidationMode::FinishTasks);
        assert!(transport.is_invalidated());

        let request = Request::parse(reqwest::Method::GET, "https://example.com").unwrap();
        assert_eq!(
            transport.create_task(&request, TaskKind::Data),
            Err(TransportError::SessionInvalidated)
        );
    }
}
