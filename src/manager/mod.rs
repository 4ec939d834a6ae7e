//! Session Manager
//!
//! Owns one transport session and routes every transport event to the
//! operation that owns the task, or applies a manager-level fallback.
//!
//! Challenge precedence: the operation's own handler, then the manager's
//! challenge handler, then the [`TrustEvaluator`].

pub mod events;
pub mod queue;
pub mod registry;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

pub use events::OperationEvent;
pub use queue::ExecutionQueue;
pub use registry::{OperationInfo, RegisteredOperation, Registry};

use crate::config::SessionConfig;
use crate::dispatch::CompletionDispatcher;
use crate::error::{ConfigError, OperationError, OperationResult, TaskError, TransportError};
use crate::operation::data::ProgressHandler;
use crate::operation::{
    BlockOperation, Completion, DataTaskHandlers, DataTaskOperation, QueuedOperation,
    TaskHandlers, TaskOperation,
};
use crate::security::{SecurityPolicy, TrustDecision, TrustEvaluator};
use crate::transport::{
    BackgroundCompletion, Challenge, ChallengeReply, Credential, InvalidationMode, Request,
    Responder, ResponseDisposition, SessionDelegate, TaskEvent, TaskHandle, TaskId, TaskKind,
    Transport,
};

/// Observer for every task completion the transport reports
pub type ManagerCompletionHandler =
    Arc<dyn Fn(&SessionManager, TaskId, Option<TaskError>) + Send + Sync>;
/// Challenge handler for tasks without their own; `None` task = session-level
pub type ManagerChallengeHandler = Arc<
    dyn Fn(&SessionManager, Option<TaskId>, &Challenge, Responder<ChallengeReply>) + Send + Sync,
>;
pub type InvalidationHandler = Arc<dyn Fn(&SessionManager, Option<TransportError>) + Send + Sync>;
/// Receives the stored background completion; return it to have the manager call it
pub type FinishEventsHandler = Arc<
    dyn Fn(&SessionManager, Option<BackgroundCompletion>) -> Option<BackgroundCompletion>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
struct ManagerHandlers {
    completion: Option<ManagerCompletionHandler>,
    challenge: Option<ManagerChallengeHandler>,
    invalidation: Option<InvalidationHandler>,
    finish_events: Option<FinishEventsHandler>,
}

/// Construction options for a [`SessionManager`]
pub struct ManagerOptions {
    pub identifier: String,
    /// Dedicated queue; `None` uses [`ExecutionQueue::shared`]
    pub queue: Option<ExecutionQueue>,
    /// Callback context; `None` uses [`CompletionDispatcher::main`]
    pub dispatcher: Option<CompletionDispatcher>,
    pub security_policy: Option<Arc<dyn TrustEvaluator>>,
    pub credential: Option<Credential>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            identifier: "netops".to_string(),
            queue: None,
            dispatcher: None,
            security_policy: None,
            credential: None,
        }
    }
}

/// Session manager - owns a transport session and its operations
pub struct SessionManager {
    self_ref: Weak<SessionManager>,
    identifier: String,
    transport: Arc<dyn Transport>,
    registry: Registry,
    queue: ExecutionQueue,
    dispatcher: RwLock<CompletionDispatcher>,
    security_policy: RwLock<Arc<dyn TrustEvaluator>>,
    credential: RwLock<Option<Credential>>,
    handlers: RwLock<ManagerHandlers>,
    background_completion: Mutex<Option<BackgroundCompletion>>,
    invalidated: AtomicBool,
    events: broadcast::Sender<OperationEvent>,
}

impl SessionManager {
    /// Create a manager with default options and attach it to `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_options(transport, ManagerOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ManagerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let ManagerOptions {
            identifier,
            queue,
            dispatcher,
            security_policy,
            credential,
        } = options;

        let manager = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            identifier,
            transport,
            registry: Registry::new(),
            queue: queue.unwrap_or_else(ExecutionQueue::shared),
            dispatcher: RwLock::new(dispatcher.unwrap_or_else(CompletionDispatcher::main)),
            security_policy: RwLock::new(
                security_policy.unwrap_or_else(|| Arc::new(SecurityPolicy::default_policy())),
            ),
            credential: RwLock::new(credential),
            handlers: RwLock::new(ManagerHandlers::default()),
            background_completion: Mutex::new(None),
            invalidated: AtomicBool::new(false),
            events,
        });

        let delegate: Weak<dyn SessionDelegate> = Arc::downgrade(&manager) as Weak<SessionManager>;
        manager.transport.attach(delegate);
        info!(
            "Session manager {} attached to {} transport",
            manager.identifier,
            manager.transport.transport_type()
        );
        manager
    }

    /// Create a manager configured from a [`SessionConfig`]
    pub fn from_config(
        config: &SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ConfigError> {
        let queue = match config.max_concurrent_operations {
            Some(max) => ExecutionQueue::with_max_concurrent(config.identifier.clone(), max),
            None => ExecutionQueue::shared(),
        };
        let options = ManagerOptions {
            identifier: config.identifier.clone(),
            queue: Some(queue),
            security_policy: Some(Arc::new(config.security_policy()?)),
            ..ManagerOptions::default()
        };
        Ok(Self::with_options(transport, options))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> CompletionDispatcher {
        self.dispatcher.read().clone()
    }

    /// Dispatcher for manager callbacks and operations created afterwards
    pub fn set_dispatcher(&self, dispatcher: CompletionDispatcher) {
        *self.dispatcher.write() = dispatcher;
    }

    pub fn set_security_policy(&self, policy: impl TrustEvaluator + 'static) {
        *self.security_policy.write() = Arc::new(policy);
    }

    /// Session credential, tried after an operation's own credential
    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }

    pub fn set_completion_handler(
        &self,
        handler: impl Fn(&SessionManager, TaskId, Option<TaskError>) + Send + Sync + 'static,
    ) {
        self.handlers.write().completion = Some(Arc::new(handler));
    }

    pub fn set_challenge_handler(
        &self,
        handler: impl Fn(&SessionManager, Option<TaskId>, &Challenge, Responder<ChallengeReply>)
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.write().challenge = Some(Arc::new(handler));
    }

    pub fn set_invalidation_handler(
        &self,
        handler: impl Fn(&SessionManager, Option<TransportError>) + Send + Sync + 'static,
    ) {
        self.handlers.write().invalidation = Some(Arc::new(handler));
    }

    pub fn set_finish_events_handler(
        &self,
        handler: impl Fn(&SessionManager, Option<BackgroundCompletion>) -> Option<BackgroundCompletion>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.write().finish_events = Some(Arc::new(handler));
    }

    /// Store the completion to run once background events are drained.
    /// A previously stored completion is run immediately.
    pub fn set_background_completion(&self, completion: BackgroundCompletion) {
        let previous = self.background_completion.lock().replace(completion);
        if let Some(previous) = previous {
            warn!("Replacing pending background completion; running the old one");
            previous.complete();
        }
    }

    pub fn has_background_completion(&self) -> bool {
        self.background_completion.lock().is_some()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Subscribe to operation events
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Create and queue a data operation
    pub fn create_operation(
        &self,
        request: Request,
        handlers: DataTaskHandlers,
    ) -> OperationResult<Arc<DataTaskOperation>> {
        let task_id = self.create_task(&request, TaskKind::Data)?;
        let op = Arc::new(DataTaskOperation::new(
            self.handle(task_id),
            request,
            handlers,
            self.dispatcher(),
        ));
        self.register(RegisteredOperation::Data(Arc::clone(&op)))?;
        Ok(op)
    }

    /// Create a data operation with just a progress observer and a completion
    pub fn data_operation(
        &self,
        request: Request,
        progress: Option<ProgressHandler>,
        completion: impl FnOnce(&TaskOperation, Completion) + Send + 'static,
    ) -> OperationResult<Arc<DataTaskOperation>> {
        let mut handlers = DataTaskHandlers::new().on_complete(completion);
        handlers.progress = progress;
        self.create_operation(request, handlers)
    }

    /// Create a GET data operation for a URL string
    pub fn data_operation_with_url(
        &self,
        url: &str,
        progress: Option<ProgressHandler>,
        completion: impl FnOnce(&TaskOperation, Completion) + Send + 'static,
    ) -> OperationResult<Arc<DataTaskOperation>> {
        let request = Request::parse(reqwest::Method::GET, url)?;
        self.data_operation(request, progress, completion)
    }

    /// Create and queue an upload operation, which reports send progress only
    pub fn create_upload_operation(
        &self,
        request: Request,
        handlers: TaskHandlers,
    ) -> OperationResult<Arc<TaskOperation>> {
        let task_id = self.create_task(&request, TaskKind::Upload)?;
        let op = Arc::new(TaskOperation::new(
            self.handle(task_id),
            request,
            handlers,
            self.dispatcher(),
        ));
        self.register(RegisteredOperation::Task(Arc::clone(&op)))?;
        Ok(op)
    }

    /// Queue arbitrary work on this manager's queue
    pub fn add_operation(&self, operation: Arc<dyn QueuedOperation>) {
        debug!("Manager {} queueing {}", self.identifier, operation.name());
        self.queue.add(operation);
    }

    /// Queue a closure
    pub fn add_block(&self, work: impl FnOnce() + Send + 'static) -> Arc<BlockOperation> {
        let op = Arc::new(BlockOperation::new(work));
        self.add_operation(Arc::clone(&op) as Arc<dyn QueuedOperation>);
        op
    }

    /// Operation owning a task
    pub fn operation(&self, task_id: TaskId) -> Option<RegisteredOperation> {
        self.registry.get(task_id)
    }

    pub fn operation_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshots of every live operation, ordered by task id
    pub fn list_operations(&self) -> Vec<OperationInfo> {
        self.registry.snapshot()
    }

    /// Cancel every operation this manager owns
    pub fn cancel_all(&self) {
        let operations = self.registry.operations();
        info!("Manager {} cancelling {} operation(s)", self.identifier, operations.len());
        for operation in operations {
            operation.cancel();
        }
    }

    /// Cancel everything and invalidate the session
    pub fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.transport.invalidate(InvalidationMode::CancelTasks);
    }

    /// Refuse new operations and invalidate once running tasks finish
    pub fn finish_tasks_and_invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.transport.invalidate(InvalidationMode::FinishTasks);
    }

    fn handle(&self, task_id: TaskId) -> TaskHandle {
        TaskHandle::for_transport(task_id, &self.transport)
    }

    fn create_task(&self, request: &Request, kind: TaskKind) -> OperationResult<TaskId> {
        if self.is_invalidated() {
            return Err(OperationError::SessionInvalidated);
        }
        self.transport
            .create_task(request, kind)
            .map_err(|e| match e {
                TransportError::SessionInvalidated => OperationError::SessionInvalidated,
                e => OperationError::Construction(e),
            })
    }

    /// Register, wire the finish hook, then queue
    fn register(&self, entry: RegisteredOperation) -> OperationResult<()> {
        let task = Arc::clone(entry.task());
        let task_id = task.task_id();
        let operation_id = task.id();

        self.registry.insert(task_id, entry.clone())?;

        let manager = self.self_ref.clone();
        let finished = Arc::downgrade(&task);
        task.lifecycle().on_finish(Box::new(move || {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.registry.remove(task_id, operation_id);
            let (cancelled, error) = finished
                .upgrade()
                .map(|op| (op.is_cancelled(), op.error().map(|e| e.to_string())))
                .unwrap_or((false, None));
            let _ = manager.events.send(OperationEvent::Finished {
                operation_id,
                task_id,
                cancelled,
                error,
            });
        }));

        info!(
            "Manager {} created operation {} for task {} ({})",
            self.identifier,
            operation_id,
            task_id,
            task.request().url
        );
        let _ = self.events.send(OperationEvent::Created(entry.info()));
        self.queue.add(entry.as_queued());
        Ok(())
    }

    fn route_challenge(
        &self,
        owner: Option<Arc<TaskOperation>>,
        task: Option<TaskId>,
        challenge: Challenge,
        reply: Responder<ChallengeReply>,
    ) {
        let (challenge, reply) = match owner.as_ref() {
            Some(op) => match op.did_receive_challenge(challenge, reply) {
                Ok(()) => return,
                Err(unclaimed) => unclaimed,
            },
            None => (challenge, reply),
        };

        let handler = self.handlers.read().challenge.clone();
        if let Some(handler) = handler {
            if let Some(manager) = self.self_ref.upgrade() {
                debug!("Manager challenge handler answering for {:?}", task);
                self.dispatcher()
                    .dispatch(move || handler(&manager, task, &challenge, reply));
                return;
            }
        }

        let answer = self.default_challenge_reply(owner.as_deref(), &challenge);
        reply.respond(answer);
    }

    /// Policy-driven answer for a challenge nobody handled
    fn default_challenge_reply(
        &self,
        owner: Option<&TaskOperation>,
        challenge: &Challenge,
    ) -> ChallengeReply {
        let policy = self.security_policy.read().clone();
        let space = &challenge.protection_space;

        if policy.evaluate_trust(space) == TrustDecision::Reject {
            warn!("Security policy rejected {} challenge for {}", space.protocol, space.host);
            return ChallengeReply::cancel();
        }

        if challenge.is_server_trust() {
            return match space.server_trust.clone() {
                Some(trust) => ChallengeReply::use_credential(Credential::ServerTrust(trust)),
                None => ChallengeReply::default_handling(),
            };
        }

        if challenge.previous_failure_count > 0 {
            warn!(
                "Credential for {} already failed {} time(s); cancelling",
                space.host, challenge.previous_failure_count
            );
            return ChallengeReply::cancel();
        }

        match owner
            .and_then(|op| op.credential())
            .or_else(|| self.credential())
        {
            Some(credential) => ChallengeReply::use_credential(credential),
            None => ChallengeReply::default_handling(),
        }
    }

    fn notify_completion(&self, task: TaskId, error: Option<TaskError>) {
        let handler = self.handlers.read().completion.clone();
        if let (Some(handler), Some(manager)) = (handler, self.self_ref.upgrade()) {
            self.dispatcher()
                .dispatch(move || handler(&manager, task, error));
        }
    }
}

impl SessionDelegate for SessionManager {
    fn task_event(&self, task: TaskId, event: TaskEvent) {
        let owner = self.registry.get(task);
        debug!(
            "Routing {} for task {} ({})",
            event.name(),
            task,
            if owner.is_some() { "owned" } else { "unowned" }
        );

        match event {
            TaskEvent::ResponseReceived { response, reply } => {
                match owner.as_ref().and_then(|o| o.as_data()) {
                    Some(op) => op.did_receive_response(response, reply),
                    None => reply.respond(ResponseDisposition::Allow),
                }
            }
            TaskEvent::DataReceived { chunk } => match owner.as_ref().and_then(|o| o.as_data()) {
                Some(op) => op.did_receive_data(chunk),
                None => debug!("Dropping {} bytes for task {}", chunk.len(), task),
            },
            TaskEvent::SentBodyData(progress) => match owner {
                Some(op) => op.task().did_send_body_data(progress),
                None => debug!("Dropping send progress for task {}", task),
            },
            TaskEvent::NeedNewBodyStream { reply } => match owner {
                Some(op) => op.task().need_new_body_stream(reply),
                None => reply.respond(None),
            },
            TaskEvent::WillRedirect {
                response,
                request,
                reply,
            } => match owner {
                Some(op) => op.task().will_redirect(response, request, reply),
                None => reply.respond(Some(request)),
            },
            TaskEvent::WillCacheResponse { proposed, reply } => {
                match owner.as_ref().and_then(|o| o.as_data()) {
                    Some(op) => op.will_cache_response(proposed, reply),
                    None => reply.respond(Some(proposed)),
                }
            }
            TaskEvent::BecameDownload { download } => {
                match owner.as_ref().and_then(|o| o.as_data()) {
                    Some(op) => op.did_become_download(download),
                    None => debug!("Task {} became download {} with no owner", task, download.id()),
                }
            }
            TaskEvent::Challenge { challenge, reply } => {
                let owner = owner.map(|o| Arc::clone(o.task()));
                self.route_challenge(owner, Some(task), challenge, reply);
            }
            TaskEvent::Completed { error } => {
                let cancelled = owner.as_ref().is_some_and(|o| o.task().is_cancelled());
                let outcome = TaskError::from_completion(error.clone(), cancelled);
                match owner {
                    Some(RegisteredOperation::Data(op)) => {
                        op.did_complete(error);
                    }
                    Some(RegisteredOperation::Task(op)) => {
                        op.did_complete(None, error);
                    }
                    None => debug!("Completion for unowned task {}", task),
                }
                self.notify_completion(task, outcome);
            }
        }
    }

    fn session_challenge(&self, challenge: Challenge, reply: Responder<ChallengeReply>) {
        self.route_challenge(None, None, challenge, reply);
    }

    fn session_invalidated(&self, error: Option<TransportError>) {
        self.invalidated.store(true, Ordering::SeqCst);
        match &error {
            Some(e) => warn!("Session {} invalidated: {}", self.identifier, e),
            None => info!("Session {} invalidated", self.identifier),
        }
        let _ = self.events.send(OperationEvent::SessionInvalidated {
            error: error.as_ref().map(|e| e.to_string()),
        });

        let handler = self.handlers.read().invalidation.clone();
        if let (Some(handler), Some(manager)) = (handler, self.self_ref.upgrade()) {
            self.dispatcher().dispatch(move || handler(&manager, error));
        }
    }

    fn background_events_finished(&self) {
        let completion = self.background_completion.lock().take();
        let handler = self.handlers.read().finish_events.clone();
        let manager = self.self_ref.upgrade();
        debug!(
            "Background events finished for {} (completion stored: {})",
            self.identifier,
            completion.is_some()
        );

        self.dispatcher().dispatch(move || {
            let returned = match (handler, manager) {
                (Some(handler), Some(manager)) => handler(&manager, completion),
                _ => completion,
            };
            if let Some(completion) = returned {
                completion.complete();
            }
        });
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            error!(
                "Session manager {} dropped with {} live operation(s)",
                self.identifier,
                self.registry.len()
            );
        }
    }
}
