//! Task Operation
//!
//! Base operation wrapping one transport task: the callback slots every task
//! supports and the start/cancel/complete rules of the lifecycle.

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::lifecycle::{CancelOutcome, Lifecycle, OperationState};
use super::{OperationId, QueuedOperation};
use crate::dispatch::CompletionDispatcher;
use crate::error::{OperationResult, TaskError, TransportError};
use crate::transport::{
    Challenge, ChallengeReply, Credential, Request, Responder, Response, SendProgress, TaskHandle,
    TaskId,
};

/// Final outcome delivered to a completion handler
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Accumulated body, if the operation collected one
    pub data: Option<Bytes>,
    /// Last response headers received
    pub response: Option<Response>,
    pub error: Option<TaskError>,
}

impl Completion {
    pub fn cancelled() -> Self {
        Self {
            error: Some(TaskError::Cancelled),
            ..Default::default()
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(TaskError::Cancelled))
    }

    /// Body on success, error otherwise
    pub fn into_result(self) -> Result<Option<Bytes>, TaskError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

pub type CompletionHandler = Box<dyn FnOnce(&TaskOperation, Completion) + Send>;
pub type ChallengeHandler =
    Arc<dyn Fn(&TaskOperation, &Challenge, Responder<ChallengeReply>) + Send + Sync>;
pub type SendProgressHandler = Arc<dyn Fn(&TaskOperation, SendProgress) + Send + Sync>;
pub type NewBodyStreamHandler =
    Arc<dyn Fn(&TaskOperation, Responder<Option<Bytes>>) + Send + Sync>;
pub type RedirectHandler =
    Arc<dyn Fn(&TaskOperation, &Response, Request, Responder<Option<Request>>) + Send + Sync>;

/// Callbacks supplied when a task operation is created
#[derive(Default)]
pub struct TaskHandlers {
    pub completion: Option<CompletionHandler>,
    pub challenge: Option<ChallengeHandler>,
    pub send_progress: Option<SendProgressHandler>,
    pub need_new_body: Option<NewBodyStreamHandler>,
    pub redirect: Option<RedirectHandler>,
}

impl TaskHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(
        mut self,
        handler: impl FnOnce(&TaskOperation, Completion) + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(handler));
        self
    }

    pub fn on_challenge(
        mut self,
        handler: impl Fn(&TaskOperation, &Challenge, Responder<ChallengeReply>) + Send + Sync + 'static,
    ) -> Self {
        self.challenge = Some(Arc::new(handler));
        self
    }

    pub fn on_send_progress(
        mut self,
        handler: impl Fn(&TaskOperation, SendProgress) + Send + Sync + 'static,
    ) -> Self {
        self.send_progress = Some(Arc::new(handler));
        self
    }

    pub fn on_need_new_body(
        mut self,
        handler: impl Fn(&TaskOperation, Responder<Option<Bytes>>) + Send + Sync + 'static,
    ) -> Self {
        self.need_new_body = Some(Arc::new(handler));
        self
    }

    pub fn on_redirect(
        mut self,
        handler: impl Fn(&TaskOperation, &Response, Request, Responder<Option<Request>>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.redirect = Some(Arc::new(handler));
        self
    }
}

#[derive(Clone, Default)]
struct CallbackSlots {
    challenge: Option<ChallengeHandler>,
    send_progress: Option<SendProgressHandler>,
    need_new_body: Option<NewBodyStreamHandler>,
    redirect: Option<RedirectHandler>,
}

/// Operation wrapping one transport task
pub struct TaskOperation {
    id: OperationId,
    handle: TaskHandle,
    request: Request,
    lifecycle: Lifecycle,
    dispatcher: RwLock<CompletionDispatcher>,
    credential: RwLock<Option<Credential>>,
    slots: RwLock<CallbackSlots>,
    completion: Mutex<Option<CompletionHandler>>,
    response: RwLock<Option<Response>>,
    outcome: RwLock<Option<TaskError>>,
}

impl TaskOperation {
    /// Create a pending operation for a task the transport already created
    pub fn new(
        handle: TaskHandle,
        request: Request,
        handlers: TaskHandlers,
        dispatcher: CompletionDispatcher,
    ) -> Self {
        let TaskHandlers {
            completion,
            challenge,
            send_progress,
            need_new_body,
            redirect,
        } = handlers;

        Self {
            id: OperationId::new(),
            handle,
            request,
            lifecycle: Lifecycle::new(),
            dispatcher: RwLock::new(dispatcher),
            credential: RwLock::new(None),
            slots: RwLock::new(CallbackSlots {
                challenge,
                send_progress,
                need_new_body,
                redirect,
            }),
            completion: Mutex::new(completion),
            response: RwLock::new(None),
            outcome: RwLock::new(None),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.handle.id()
    }

    /// Non-owning handle to the transport task
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// The request this operation was created for
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> OperationState {
        self.lifecycle.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    pub fn is_executing(&self) -> bool {
        self.lifecycle.is_executing()
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    /// Last response headers received
    pub fn response(&self) -> Option<Response> {
        self.response.read().clone()
    }

    /// Error the operation finished with, once finished
    pub fn error(&self) -> Option<TaskError> {
        self.outcome.read().clone()
    }

    /// Wait until the operation is finished
    pub async fn finished(&self) {
        self.lifecycle.finished().await
    }

    /// Credential tried when this task is challenged
    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }

    /// Dispatcher this operation's callbacks run on
    pub fn dispatcher(&self) -> CompletionDispatcher {
        self.dispatcher.read().clone()
    }

    pub fn set_dispatcher(&self, dispatcher: CompletionDispatcher) {
        *self.dispatcher.write() = dispatcher;
    }

    /// Replace the completion handler; ignored once the operation has finished
    pub fn set_completion_handler(
        &self,
        handler: impl FnOnce(&TaskOperation, Completion) + Send + 'static,
    ) {
        if self.is_finished() {
            warn!("Completion handler set on finished task {}; ignoring", self.task_id());
            return;
        }
        *self.completion.lock() = Some(Box::new(handler));
    }

    pub fn set_challenge_handler(
        &self,
        handler: impl Fn(&TaskOperation, &Challenge, Responder<ChallengeReply>) + Send + Sync + 'static,
    ) {
        self.slots.write().challenge = Some(Arc::new(handler));
    }

    pub fn set_send_progress_handler(
        &self,
        handler: impl Fn(&TaskOperation, SendProgress) + Send + Sync + 'static,
    ) {
        self.slots.write().send_progress = Some(Arc::new(handler));
    }

    pub fn set_need_new_body_handler(
        &self,
        handler: impl Fn(&TaskOperation, Responder<Option<Bytes>>) + Send + Sync + 'static,
    ) {
        self.slots.write().need_new_body = Some(Arc::new(handler));
    }

    pub fn set_redirect_handler(
        &self,
        handler: impl Fn(&TaskOperation, &Response, Request, Responder<Option<Request>>)
            + Send
            + Sync
            + 'static,
    ) {
        self.slots.write().redirect = Some(Arc::new(handler));
    }

    /// Whether this operation answers its own challenges.
    ///
    /// When false the session manager handles them.
    pub fn can_respond_to_challenge(&self) -> bool {
        self.slots.read().challenge.is_some()
    }

    /// Start the transport task. Only valid from `Pending`.
    ///
    /// Fails with [`OperationError::Queued`](crate::OperationError::Queued)
    /// once an execution queue owns the operation.
    pub fn start(self: &Arc<Self>) -> OperationResult<()> {
        self.lifecycle.begin_unqueued()?;
        self.start_transport();
        Ok(())
    }

    /// Start on behalf of the owning queue
    pub(crate) fn run(self: &Arc<Self>) -> OperationResult<()> {
        self.lifecycle.begin()?;
        self.start_transport();
        Ok(())
    }

    fn start_transport(self: &Arc<Self>) {
        debug!("Starting task {} ({} {})", self.task_id(), self.request.method, self.request.url);

        if let Err(e) = self.handle.start() {
            warn!("Transport refused to start task {}: {}", self.task_id(), e);
            self.finish_with(Completion::failed(TaskError::Transport(e)));
        }
    }

    /// Cancel the operation.
    ///
    /// A running task is aborted through the transport, whose completion
    /// event then finishes the operation. A task that never started finishes
    /// right away without contacting the transport.
    pub fn cancel(self: &Arc<Self>) {
        match self.lifecycle.mark_cancelled() {
            CancelOutcome::WasPending => {
                info!("Cancelled task {} before it started", self.task_id());
                self.handle.discard();
                self.finish_with(Completion::cancelled());
            }
            CancelOutcome::WasExecuting => {
                info!("Cancelling task {}", self.task_id());
                if let Err(e) = self.handle.cancel() {
                    // nobody is left to report completion
                    warn!("Could not reach transport to cancel task {}: {}", self.task_id(), e);
                    self.finish_with(Completion::cancelled());
                }
            }
            CancelOutcome::NoEffect => {
                debug!("Cancel of task {} had no effect", self.task_id());
            }
        }
    }

    /// Finish the operation. Idempotent: only the first call has any effect.
    ///
    /// An operation that never started finishes as cancelled.
    pub fn complete_operation(self: &Arc<Self>) -> bool {
        if self.lifecycle.cancel_if_pending() {
            info!("Completed task {} before it started; finishing as cancelled", self.task_id());
            self.handle.discard();
            return self.finish_with(Completion::cancelled());
        }
        let error = if self.is_cancelled() {
            Some(TaskError::Cancelled)
        } else {
            None
        };
        self.finish_with(Completion {
            data: None,
            response: self.response(),
            error,
        })
    }

    /// Commit the terminal transition and schedule the completion handler
    pub(crate) fn finish_with(self: &Arc<Self>, completion: Completion) -> bool {
        self.lifecycle.finish(|| {
            *self.outcome.write() = completion.error.clone();
            match &completion.error {
                Some(e) => info!("Task {} finished: {}", self.task_id(), e),
                None => info!("Task {} finished", self.task_id()),
            }

            let handler = self.completion.lock().take();
            if let Some(handler) = handler {
                let op = Arc::clone(self);
                self.dispatcher().dispatch(move || handler(&op, completion));
            }
        })
    }

    pub(crate) fn set_response(&self, response: Response) {
        *self.response.write() = Some(response);
    }

    /// Forward a challenge to this operation's handler, or hand it back unclaimed
    pub(crate) fn did_receive_challenge(
        self: &Arc<Self>,
        challenge: Challenge,
        reply: Responder<ChallengeReply>,
    ) -> Result<(), (Challenge, Responder<ChallengeReply>)> {
        let handler = self.slots.read().challenge.clone();
        match handler {
            Some(handler) => {
                let op = Arc::clone(self);
                self.dispatcher()
                    .dispatch(move || handler(&op, &challenge, reply));
                Ok(())
            }
            None => Err((challenge, reply)),
        }
    }

    pub(crate) fn did_send_body_data(self: &Arc<Self>, progress: SendProgress) {
        let handler = self.slots.read().send_progress.clone();
        if let Some(handler) = handler {
            let op = Arc::clone(self);
            self.dispatcher().dispatch(move || handler(&op, progress));
        }
    }

    pub(crate) fn need_new_body_stream(self: &Arc<Self>, reply: Responder<Option<Bytes>>) {
        let handler = self.slots.read().need_new_body.clone();
        match handler {
            Some(handler) => {
                let op = Arc::clone(self);
                self.dispatcher().dispatch(move || handler(&op, reply));
            }
            None => reply.respond(self.request.body.clone()),
        }
    }

    pub(crate) fn will_redirect(
        self: &Arc<Self>,
        response: Response,
        request: Request,
        reply: Responder<Option<Request>>,
    ) {
        let handler = self.slots.read().redirect.clone();
        match handler {
            Some(handler) => {
                let op = Arc::clone(self);
                self.dispatcher()
                    .dispatch(move || handler(&op, &response, request, reply));
            }
            None => {
                debug!("Task {} following redirect to {}", self.task_id(), request.url);
                reply.respond(Some(request));
            }
        }
    }

    /// The transport reported completion
    pub(crate) fn did_complete(
        self: &Arc<Self>,
        data: Option<Bytes>,
        error: Option<TransportError>,
    ) -> bool {
        let error = TaskError::from_completion(error, self.is_cancelled());
        let finished = self.finish_with(Completion {
            data,
            response: self.response(),
            error,
        });
        if !finished {
            debug!("Task {} already finished; ignoring completion", self.task_id());
        }
        finished
    }
}

impl QueuedOperation for TaskOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn execute(self: Arc<Self>) {
        if let Err(e) = self.run() {
            debug!("Task {} not started: {}", self.task_id(), e);
        }
    }

    fn abort(self: Arc<Self>) {
        self.cancel();
    }

    fn name(&self) -> String {
        format!("task {} ({} {})", self.task_id(), self.request.method, self.request.url)
    }
}

impl std::fmt::Debug for TaskOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOperation")
            .field("id", &self.id)
            .field("task", &self.task_id())
            .field("url", &self.request.url.as_str())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
