//! Data Task Operation
//!
//! Adds response handling on top of [`TaskOperation`]: disposition decisions,
//! body streaming or accumulation, progress accounting, cache decisions and
//! download handoff.

use bytes::{Bytes, BytesMut};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::lifecycle::Lifecycle;
use super::task::{Completion, TaskHandlers, TaskOperation};
use super::{OperationId, QueuedOperation};
use crate::dispatch::CompletionDispatcher;
use crate::error::{OperationResult, TransportError};
use crate::transport::{
    CachedResponse, Request, Responder, Response, ResponseDisposition, TaskHandle,
    UNKNOWN_LENGTH,
};

/// Bytes received so far against the expected total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProgress {
    /// Expected body length, `UNKNOWN_LENGTH` if the server did not say
    pub expected: i64,
    pub received: i64,
}

impl DataProgress {
    /// Completed fraction, when the expected length is known
    pub fn fraction(&self) -> Option<f64> {
        if self.expected > 0 {
            Some((self.received as f64 / self.expected as f64).min(1.0))
        } else {
            None
        }
    }
}

pub type ResponseHandler =
    Arc<dyn Fn(&DataTaskOperation, &Response, Responder<ResponseDisposition>) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&DataTaskOperation, Bytes, DataProgress) + Send + Sync>;
pub type ProgressHandler = Arc<dyn Fn(&DataTaskOperation, DataProgress) + Send + Sync>;
pub type CacheHandler = Arc<
    dyn Fn(&DataTaskOperation, CachedResponse, Responder<Option<CachedResponse>>) + Send + Sync,
>;
pub type DownloadHandler = Arc<dyn Fn(&DataTaskOperation, TaskHandle) + Send + Sync>;

/// Callbacks for a data task, on top of the base task callbacks
#[derive(Default)]
pub struct DataTaskHandlers {
    pub task: TaskHandlers,
    pub response: Option<ResponseHandler>,
    pub data: Option<DataHandler>,
    pub progress: Option<ProgressHandler>,
    pub cache: Option<CacheHandler>,
    pub download: Option<DownloadHandler>,
}

impl DataTaskHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base task callbacks
    pub fn with_task(mut self, task: TaskHandlers) -> Self {
        self.task = task;
        self
    }

    pub fn on_complete(
        mut self,
        handler: impl FnOnce(&TaskOperation, Completion) + Send + 'static,
    ) -> Self {
        self.task = self.task.on_complete(handler);
        self
    }

    pub fn on_response(
        mut self,
        handler: impl Fn(&DataTaskOperation, &Response, Responder<ResponseDisposition>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.response = Some(Arc::new(handler));
        self
    }

    /// Stream chunks to `handler` instead of accumulating them
    pub fn on_data(
        mut self,
        handler: impl Fn(&DataTaskOperation, Bytes, DataProgress) + Send + Sync + 'static,
    ) -> Self {
        self.data = Some(Arc::new(handler));
        self
    }

    pub fn on_progress(
        mut self,
        handler: impl Fn(&DataTaskOperation, DataProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(handler));
        self
    }

    pub fn on_cache(
        mut self,
        handler: impl Fn(&DataTaskOperation, CachedResponse, Responder<Option<CachedResponse>>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.cache = Some(Arc::new(handler));
        self
    }

    pub fn on_download(
        mut self,
        handler: impl Fn(&DataTaskOperation, TaskHandle) + Send + Sync + 'static,
    ) -> Self {
        self.download = Some(Arc::new(handler));
        self
    }
}

#[derive(Clone, Default)]
struct DataSlots {
    response: Option<ResponseHandler>,
    data: Option<DataHandler>,
    progress: Option<ProgressHandler>,
    cache: Option<CacheHandler>,
    download: Option<DownloadHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryMode {
    Accumulate,
    Stream,
}

struct ReceiveState {
    /// Fixed when the first chunk arrives
    mode: Option<DeliveryMode>,
    buffer: BytesMut,
    received: i64,
    expected: i64,
}

/// Task operation for a data task
pub struct DataTaskOperation {
    base: Arc<TaskOperation>,
    slots: RwLock<DataSlots>,
    receive: Mutex<ReceiveState>,
}

impl DataTaskOperation {
    /// Create a pending data operation for a task the transport already created
    pub fn new(
        handle: TaskHandle,
        request: Request,
        handlers: DataTaskHandlers,
        dispatcher: CompletionDispatcher,
    ) -> Self {
        let DataTaskHandlers {
            task,
            response,
            data,
            progress,
            cache,
            download,
        } = handlers;

        Self {
            base: Arc::new(TaskOperation::new(handle, request, task, dispatcher)),
            slots: RwLock::new(DataSlots {
                response,
                data,
                progress,
                cache,
                download,
            }),
            receive: Mutex::new(ReceiveState {
                mode: None,
                buffer: BytesMut::new(),
                received: 0,
                expected: UNKNOWN_LENGTH,
            }),
        }
    }

    /// The underlying task operation
    pub fn task(&self) -> &Arc<TaskOperation> {
        &self.base
    }

    pub fn id(&self) -> OperationId {
        self.base.id()
    }

    pub fn progress(&self) -> DataProgress {
        let receive = self.receive.lock();
        DataProgress {
            expected: receive.expected,
            received: receive.received,
        }
    }

    /// Whether chunks are being kept for the completion payload
    pub fn is_accumulating(&self) -> bool {
        self.delivery_mode() == DeliveryMode::Accumulate
    }

    /// Mode fixed by the first chunk, else the one the handlers imply
    fn delivery_mode(&self) -> DeliveryMode {
        let streaming = self.slots.read().data.is_some();
        self.receive.lock().mode.unwrap_or(if streaming {
            DeliveryMode::Stream
        } else {
            DeliveryMode::Accumulate
        })
    }

    /// See [`TaskOperation::start`]
    pub fn start(&self) -> OperationResult<()> {
        self.base.start()
    }

    pub fn cancel(&self) {
        self.base.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.base.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.base.is_cancelled()
    }

    pub async fn finished(&self) {
        self.base.finished().await
    }

    pub fn set_response_handler(
        &self,
        handler: impl Fn(&DataTaskOperation, &Response, Responder<ResponseDisposition>)
            + Send
            + Sync
            + 'static,
    ) {
        self.slots.write().response = Some(Arc::new(handler));
    }

    /// Install a streaming data handler. Has no effect on the delivery mode
    /// once the first chunk has arrived.
    pub fn set_data_handler(
        &self,
        handler: impl Fn(&DataTaskOperation, Bytes, DataProgress) + Send + Sync + 'static,
    ) {
        self.slots.write().data = Some(Arc::new(handler));
    }

    pub fn set_progress_handler(
        &self,
        handler: impl Fn(&DataTaskOperation, DataProgress) + Send + Sync + 'static,
    ) {
        self.slots.write().progress = Some(Arc::new(handler));
    }

    pub fn set_cache_handler(
        &self,
        handler: impl Fn(&DataTaskOperation, CachedResponse, Responder<Option<CachedResponse>>)
            + Send
            + Sync
            + 'static,
    ) {
        self.slots.write().cache = Some(Arc::new(handler));
    }

    pub fn set_download_handler(
        &self,
        handler: impl Fn(&DataTaskOperation, TaskHandle) + Send + Sync + 'static,
    ) {
        self.slots.write().download = Some(Arc::new(handler));
    }

    pub(crate) fn did_receive_response(
        self: &Arc<Self>,
        response: Response,
        reply: Responder<ResponseDisposition>,
    ) {
        {
            let mut receive = self.receive.lock();
            if receive.expected == UNKNOWN_LENGTH {
                receive.expected = response.expected_content_length;
            }
        }
        debug!(
            "Task {} received response {} (expected {} bytes)",
            self.base.task_id(),
            response.status,
            response.expected_content_length
        );
        self.base.set_response(response.clone());

        let handler = self.slots.read().response.clone();
        match handler {
            Some(handler) => {
                let op = Arc::clone(self);
                self.base
                    .dispatcher()
                    .dispatch(move || handler(&op, &response, reply));
            }
            None => reply.respond(ResponseDisposition::Allow),
        }
    }

    pub(crate) fn did_receive_data(self: &Arc<Self>, chunk: Bytes) {
        let (data, progress_handler) = {
            let slots = self.slots.read();
            (slots.data.clone(), slots.progress.clone())
        };

        let (mode, progress) = {
            let mut receive = self.receive.lock();
            let mode = *receive.mode.get_or_insert(if data.is_some() {
                DeliveryMode::Stream
            } else {
                DeliveryMode::Accumulate
            });
            receive.received += chunk.len() as i64;
            if mode == DeliveryMode::Accumulate {
                receive.buffer.extend_from_slice(&chunk);
            }
            (
                mode,
                DataProgress {
                    expected: receive.expected,
                    received: receive.received,
                },
            )
        };

        let dispatcher = self.base.dispatcher();
        if mode == DeliveryMode::Stream {
            if let Some(data) = data {
                let op = Arc::clone(self);
                dispatcher.dispatch(move || data(&op, chunk, progress));
            }
        }
        if let Some(handler) = progress_handler {
            let op = Arc::clone(self);
            dispatcher.dispatch(move || handler(&op, progress));
        }
    }

    pub(crate) fn will_cache_response(
        self: &Arc<Self>,
        proposed: CachedResponse,
        reply: Responder<Option<CachedResponse>>,
    ) {
        let handler = self.slots.read().cache.clone();
        match handler {
            Some(handler) => {
                let op = Arc::clone(self);
                self.base
                    .dispatcher()
                    .dispatch(move || handler(&op, proposed, reply));
            }
            None => reply.respond(Some(proposed)),
        }
    }

    /// The task turned into a download. No further events arrive for the
    /// original task id, so the operation finishes here without a payload.
    pub(crate) fn did_become_download(self: &Arc<Self>, download: TaskHandle) {
        info!(
            "Task {} handed off to download task {}",
            self.base.task_id(),
            download.id()
        );
        let handler = self.slots.read().download.clone();
        if let Some(handler) = handler {
            let op = Arc::clone(self);
            self.base
                .dispatcher()
                .dispatch(move || handler(&op, download));
        }
        self.base.finish_with(Completion {
            data: None,
            response: self.base.response(),
            error: None,
        });
    }

    pub(crate) fn did_complete(self: &Arc<Self>, error: Option<TransportError>) -> bool {
        let data = match self.delivery_mode() {
            DeliveryMode::Stream => None,
            DeliveryMode::Accumulate => Some(self.receive.lock().buffer.split().freeze()),
        };
        self.base.did_complete(data, error)
    }
}

impl QueuedOperation for DataTaskOperation {
    fn id(&self) -> OperationId {
        self.base.id()
    }

    fn lifecycle(&self) -> &Lifecycle {
        self.base.lifecycle()
    }

    fn execute(self: Arc<Self>) {
        Arc::clone(&self.base).execute();
    }

    fn abort(self: Arc<Self>) {
        self.base.cancel();
    }

    fn name(&self) -> String {
        format!("data {}", QueuedOperation::name(self.base.as_ref()))
    }
}

impl std::fmt::Debug for DataTaskOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTaskOperation")
            .field("task", &self.base)
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::transport::{MemoryTransport, TaskKind, Transport};
    use reqwest::StatusCode;

    fn make_operation(
        transport: &Arc<MemoryTransport>,
        handlers: DataTaskHandlers,
    ) -> Arc<DataTaskOperation> {
        let request = Request::parse(reqwest::Method::GET, "https://example.com/data").unwrap();
        let id = transport.create_task(&request, TaskKind::Data).unwrap();
        Arc::new(DataTaskOperation::new(
            transport.handle(id),
            request,
            handlers,
            CompletionDispatcher::inline(),
        ))
    }

    fn response(length: i64) -> Response {
        Response::new(
            url::Url::parse("https://example.com/data").unwrap(),
            StatusCode::OK,
        )
        .with_expected_length(length)
    }

    #[test]
    fn test_accumulates_chunks_in_order() {
        let transport = MemoryTransport::new();
        let payload = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&payload);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new().on_complete(move |_, completion| {
                *sink.lock() = completion.into_result().ok().flatten();
            }),
        );
        op.start().unwrap();

        let (reply, mut rx) = Responder::channel("response", ResponseDisposition::Cancel);
        op.did_receive_response(response(6), reply);
        assert_eq!(rx.try_recv().unwrap(), ResponseDisposition::Allow);

        for chunk in ["ab", "cd", "ef"] {
            op.did_receive_data(Bytes::from(chunk));
        }
        op.did_complete(None);

        assert_eq!(*payload.lock(), Some(Bytes::from_static(b"abcdef")));
    }

    #[test]
    fn test_streaming_handler_disables_accumulation() {
        let transport = MemoryTransport::new();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let payload = Arc::new(Mutex::new(Some(Bytes::new())));
        let seen = Arc::clone(&chunks);
        let sink = Arc::clone(&payload);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new()
                .on_data(move |_, chunk, _| seen.lock().push(chunk))
                .on_complete(move |_, completion| *sink.lock() = completion.data),
        );
        op.start().unwrap();

        op.did_receive_data(Bytes::from_static(b"ab"));
        op.did_receive_data(Bytes::from_static(b"cd"));
        assert!(!op.is_accumulating());
        op.did_complete(None);

        assert_eq!(chunks.lock().len(), 2);
        assert_eq!(*payload.lock(), None);
    }

    #[test]
    fn test_streaming_handler_without_chunks_has_no_payload() {
        let transport = MemoryTransport::new();
        let payload = Arc::new(Mutex::new(Some(Bytes::new())));
        let sink = Arc::clone(&payload);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new()
                .on_data(|_, _, _| {})
                .on_complete(move |_, completion| *sink.lock() = completion.data),
        );
        op.start().unwrap();
        assert!(!op.is_accumulating());

        op.did_complete(None);

        assert!(op.is_finished());
        assert_eq!(*payload.lock(), None);
    }

    #[test]
    fn test_delivery_mode_fixed_at_first_chunk() {
        let transport = MemoryTransport::new();
        let payload = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&payload);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new().on_complete(move |_, completion| *sink.lock() = completion.data),
        );
        op.start().unwrap();

        op.did_receive_data(Bytes::from_static(b"ab"));
        op.set_data_handler(|_, _, _| {});
        op.did_receive_data(Bytes::from_static(b"cd"));
        op.did_complete(None);

        assert_eq!(*payload.lock(), Some(Bytes::from_static(b"abcd")));
    }

    #[test]
    fn test_progress_monotonic_with_stable_expected() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new().on_progress(move |_, progress| sink.lock().push(progress)),
        );
        op.start().unwrap();

        let (reply, _rx) = Responder::channel("response", ResponseDisposition::Cancel);
        op.did_receive_response(response(10), reply);
        for chunk in ["abc", "defg", "hij"] {
            op.did_receive_data(Bytes::from(chunk));
        }
        // a later response must not change a known expected length
        let (reply, _rx) = Responder::channel("response", ResponseDisposition::Cancel);
        op.did_receive_response(response(99), reply);
        op.did_receive_data(Bytes::from_static(b"k"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|p| p.expected == 10));
        assert!(seen.windows(2).all(|w| w[0].received <= w[1].received));
        assert_eq!(seen.last().map(|p| p.received), Some(11));
        assert!(op.is_accumulating());
    }

    #[test]
    fn test_unknown_expected_length() {
        let transport = MemoryTransport::new();
        let op = make_operation(&transport, DataTaskHandlers::new());
        op.start().unwrap();

        let (reply, _rx) = Responder::channel("response", ResponseDisposition::Cancel);
        op.did_receive_response(response(UNKNOWN_LENGTH), reply);
        op.did_receive_data(Bytes::from_static(b"abc"));

        let progress = op.progress();
        assert_eq!(progress.expected, UNKNOWN_LENGTH);
        assert_eq!(progress.received, 3);
        assert_eq!(progress.fraction(), None);
    }

    #[test]
    fn test_dropped_disposition_reply_cancels() {
        let transport = MemoryTransport::new();
        let op = make_operation(
            &transport,
            DataTaskHandlers::new().on_response(|_, _, reply| drop(reply)),
        );
        op.start().unwrap();

        let (reply, mut rx) = Responder::channel("response", ResponseDisposition::Cancel);
        op.did_receive_response(response(1), reply);
        assert_eq!(rx.try_recv().unwrap(), ResponseDisposition::Cancel);
    }

    #[test]
    fn test_cache_decisions() {
        let transport = MemoryTransport::new();
        let op = make_operation(&transport, DataTaskHandlers::new());
        let proposed = CachedResponse::new(response(2), Bytes::from_static(b"ok"));

        let (reply, mut rx) = Responder::channel("will-cache-response", None);
        op.will_cache_response(proposed.clone(), reply);
        assert!(rx.try_recv().unwrap().is_some());

        op.set_cache_handler(|_, _, reply| reply.respond(None));
        let (reply, mut rx) = Responder::channel("will-cache-response", None);
        op.will_cache_response(proposed, reply);
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_download_handoff_finishes_without_payload() {
        let transport = MemoryTransport::new();
        let handed = Arc::new(Mutex::new(None));
        let outcome = Arc::new(Mutex::new(None));
        let handed_sink = Arc::clone(&handed);
        let outcome_sink = Arc::clone(&outcome);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new()
                .on_download(move |_, handle| *handed_sink.lock() = Some(handle.id()))
                .on_complete(move |_, completion| *outcome_sink.lock() = Some(completion)),
        );
        op.start().unwrap();
        let original = op.task().task_id();

        let download_id = transport
            .create_task(op.task().request(), TaskKind::Data)
            .unwrap();
        op.did_become_download(transport.handle(download_id));

        assert_eq!(*handed.lock(), Some(download_id));
        assert_eq!(op.task().task_id(), original);
        let completion = outcome.lock().take().unwrap();
        assert!(completion.is_success());
        assert!(completion.data.is_none());
        assert!(op.is_finished());
    }

    #[test]
    fn test_cancelled_completion() {
        let transport = MemoryTransport::new();
        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        let op = make_operation(
            &transport,
            DataTaskHandlers::new().on_complete(move |_, completion| *sink.lock() = completion.error),
        );
        op.start().unwrap();
        op.cancel();
        op.did_complete(Some(TransportError::Cancelled));
        assert_eq!(*outcome.lock(), Some(TaskError::Cancelled));
    }
}
