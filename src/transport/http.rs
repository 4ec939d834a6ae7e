//! HTTP Transport
//!
//! reqwest-backed transport. Each started task runs as a tokio task that
//! reports its progress through the attached [`SessionDelegate`] and waits
//! on the replies for events that need a decision.
//!
//! Redirects are followed by hand so every hop can be vetoed, and a 401 with
//! a Basic `WWW-Authenticate` header becomes a challenge event.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::challenge::{
    AuthenticationMethod, Challenge, ChallengeDisposition, ChallengeReply, Credential,
    ProtectionSpace,
};
use super::events::TaskEvent;
use super::responder::Responder;
use super::types::{
    CachedResponse, Request, Response, ResponseDisposition, SendProgress, TaskKind,
    UNKNOWN_LENGTH,
};
use super::{InvalidationMode, SessionDelegate, TaskHandle, TaskId, Transport};
use crate::config::SessionConfig;
use crate::error::{TransportError, TransportResult};

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Offer successful GET responses for caching
    pub cache_responses: bool,
    /// Skip certificate verification in the TLS layer
    pub accept_invalid_certs: bool,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for HttpTransportConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            user_agent: config.user_agent.clone(),
            max_redirects: config.max_redirects,
            cache_responses: config.cache_responses,
            accept_invalid_certs: config.security.allow_invalid_certificates,
        }
    }
}

/// Task table entry
struct HttpTask {
    request: Request,
    kind: TaskKind,
    started: bool,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// How a task run ended
enum TaskOutcome {
    Completed(Option<TransportError>),
    /// The transfer moved to another task id
    HandedOff,
}

/// reqwest-backed transport
pub struct HttpTransport {
    self_ref: Weak<HttpTransport>,
    client: Client,
    config: HttpTransportConfig,
    runtime: Handle,
    delegate: RwLock<Option<Weak<dyn SessionDelegate>>>,
    next_id: AtomicU64,
    tasks: DashMap<TaskId, HttpTask>,
    /// Responses accepted for caching, by URL
    cache: DashMap<String, CachedResponse>,
    invalidating: AtomicBool,
    invalidated: AtomicBool,
}

impl HttpTransport {
    /// Create a transport whose tasks run on `runtime`
    pub fn new(config: HttpTransportConfig, runtime: Handle) -> TransportResult<Arc<Self>> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        info!(
            "HTTP transport ready (timeout {:?}, max redirects {})",
            config.request_timeout, config.max_redirects
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            client,
            config,
            runtime,
            delegate: RwLock::new(None),
            next_id: AtomicU64::new(1),
            tasks: DashMap::new(),
            cache: DashMap::new(),
            invalidating: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        }))
    }

    /// Create a transport on the current tokio runtime
    pub fn current(config: HttpTransportConfig) -> TransportResult<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Other(format!("no tokio runtime: {}", e)))?;
        Self::new(config, runtime)
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    /// Cached response for a URL, if one was accepted
    pub fn cached_response(&self, url: &str) -> Option<CachedResponse> {
        self.cache.get(url).map(|entry| entry.value().clone())
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }

    fn handle(&self, task: TaskId) -> TaskHandle {
        let transport: Weak<dyn Transport> = self.self_ref.clone();
        TaskHandle::new(task, transport)
    }

    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.read().as_ref().and_then(|d| d.upgrade())
    }

    fn emit(&self, task: TaskId, event: TaskEvent) {
        match self.delegate() {
            Some(delegate) => delegate.task_event(task, event),
            None => debug!("No delegate for {} on task {}", event.name(), task),
        }
    }

    /// Emit an event carrying a responder and wait for the reply
    async fn ask<T: Clone + Send + 'static>(
        &self,
        task: TaskId,
        event: &'static str,
        fallback: T,
        make: impl FnOnce(Responder<T>) -> TaskEvent,
    ) -> T {
        let (reply, rx) = Responder::channel(event, fallback.clone());
        self.emit(task, make(reply));
        rx.await.unwrap_or(fallback)
    }

    fn allocate(&self, request: Request, kind: TaskKind) -> TaskId {
        let task = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.tasks.insert(
            task,
            HttpTask {
                request,
                kind,
                started: false,
                cancel_tx: None,
            },
        );
        task
    }

    /// Spawn the run loop for a task
    fn spawn(&self, task: TaskId, request: Request, kind: TaskKind) -> oneshot::Sender<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let weak = self.self_ref.clone();

        self.runtime.spawn(async move {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            let outcome = tokio::select! {
                _ = cancel_rx => TaskOutcome::Completed(Some(TransportError::Cancelled)),
                outcome = Arc::clone(&transport).run(task, request, kind) => outcome,
            };
            if let TaskOutcome::Completed(error) = outcome {
                transport.finish_task(task, error);
            }
        });

        cancel_tx
    }

    async fn run(self: Arc<Self>, task: TaskId, mut request: Request, kind: TaskKind) -> TaskOutcome {
        let mut redirects = 0usize;
        let mut credential: Option<(String, String)> = None;
        let mut failures = 0u32;

        loop {
            let response = match self.send(&request, credential.as_ref()).await {
                Ok(response) => response,
                Err(e) => return TaskOutcome::Completed(Some(e)),
            };

            if let Some(body) = request.body.as_ref() {
                let sent = body.len() as i64;
                self.emit(
                    task,
                    TaskEvent::SentBodyData(SendProgress {
                        bytes_sent: sent,
                        total_sent: sent,
                        total_expected: sent,
                    }),
                );
            }

            let status = response.status();
            let reported = to_response(&response);

            if status.is_redirection() {
                if let Some(next) = self.redirect_target(task, &request, &reported).await {
                    if redirects >= self.config.max_redirects {
                        return TaskOutcome::Completed(Some(TransportError::TooManyRedirects(
                            self.config.max_redirects,
                        )));
                    }
                    let followed = self
                        .ask(task, "will-redirect", None, |reply| TaskEvent::WillRedirect {
                            response: reported.clone(),
                            request: next,
                            reply,
                        })
                        .await;
                    if let Some(next) = followed {
                        debug!("Task {} redirected to {}", task, next.url);
                        redirects += 1;
                        request = next;
                        continue;
                    }
                }
            }

            if status == StatusCode::UNAUTHORIZED {
                if let Some(realm) = basic_realm(&reported) {
                    let challenge = Challenge {
                        protection_space: ProtectionSpace::http(
                            request.url.host_str().unwrap_or_default(),
                            request.url.port_or_known_default().unwrap_or(80),
                            request.url.scheme(),
                            realm,
                            AuthenticationMethod::HttpBasic,
                        ),
                        previous_failure_count: failures,
                        proposed_credential: None,
                    };
                    let reply = self
                        .ask(task, "challenge", ChallengeReply::cancel(), |reply| {
                            TaskEvent::Challenge { challenge, reply }
                        })
                        .await;

                    match (reply.disposition, reply.credential) {
                        (
                            ChallengeDisposition::UseCredential,
                            Some(Credential::Password { user, password }),
                        ) => {
                            credential = Some((user, password));
                            failures += 1;
                            continue;
                        }
                        (ChallengeDisposition::PerformDefaultHandling, _)
                        | (ChallengeDisposition::UseCredential, _) => {}
                        (ChallengeDisposition::CancelAuthenticationChallenge, _)
                        | (ChallengeDisposition::RejectProtectionSpace, _) => {
                            return TaskOutcome::Completed(Some(TransportError::Authentication(
                                format!("challenge for {} was cancelled", request.url),
                            )));
                        }
                    }
                }
            }

            let disposition = self
                .ask(task, "response-received", ResponseDisposition::Cancel, |reply| {
                    TaskEvent::ResponseReceived {
                        response: reported.clone(),
                        reply,
                    }
                })
                .await;

            return match disposition {
                ResponseDisposition::Cancel => {
                    TaskOutcome::Completed(Some(TransportError::Cancelled))
                }
                ResponseDisposition::BecomeDownload => {
                    self.hand_off(task, request, response);
                    TaskOutcome::HandedOff
                }
                ResponseDisposition::Allow => {
                    match self.stream_body(task, response).await {
                        Ok(body) => {
                            if kind == TaskKind::Data {
                                self.offer_cache(task, &request, reported, body).await;
                            }
                            TaskOutcome::Completed(None)
                        }
                        Err(e) => TaskOutcome::Completed(Some(e)),
                    }
                }
            };
        }
    }

    async fn send(
        &self,
        request: &Request,
        credential: Option<&(String, String)>,
    ) -> TransportResult<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some((user, password)) = credential {
            let token = STANDARD.encode(format!("{}:{}", user, password));
            builder = builder.header(AUTHORIZATION, format!("Basic {}", token));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        debug!("Sending {} {}", request.method, request.url);
        builder.send().await.map_err(classify)
    }

    /// Request to follow for a redirect response, before asking the delegate
    async fn redirect_target(
        &self,
        task: TaskId,
        request: &Request,
        response: &Response,
    ) -> Option<Request> {
        let location = response.headers.get(LOCATION)?.to_str().ok()?;
        let url = request.url.join(location).ok()?;
        let status = response.status;

        let keeps_method = matches!(
            status,
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
        );
        let mut next = Request::new(request.method.clone(), url);
        next.headers = request.headers.clone();
        next.timeout = request.timeout;

        if keeps_method {
            if request.body.is_some() {
                next.body = self
                    .ask(task, "need-new-body-stream", None, |reply| {
                        TaskEvent::NeedNewBodyStream { reply }
                    })
                    .await;
            }
        } else if request.method != Method::HEAD {
            next.method = Method::GET;
        }
        Some(next)
    }

    /// Continue the transfer under a new task id
    fn hand_off(&self, task: TaskId, request: Request, response: reqwest::Response) {
        let download = self.allocate(request, TaskKind::Data);
        info!("Task {} became download task {}", task, download);
        self.tasks.remove(&task);
        self.emit(
            task,
            TaskEvent::BecameDownload {
                download: self.handle(download),
            },
        );

        let weak = self.self_ref.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        if let Some(mut entry) = self.tasks.get_mut(&download) {
            entry.started = true;
            entry.cancel_tx = Some(cancel_tx);
        }
        self.runtime.spawn(async move {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            let error = tokio::select! {
                _ = cancel_rx => Some(TransportError::Cancelled),
                result = transport.stream_body(download, response) => result.err(),
            };
            transport.finish_task(download, error);
        });
    }

    async fn stream_body(&self, task: TaskId, response: reqwest::Response) -> TransportResult<Bytes> {
        let mut stream = response.bytes_stream();
        let mut body = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            if self.config.cache_responses {
                body.extend_from_slice(&chunk);
            }
            self.emit(task, TaskEvent::DataReceived { chunk });
        }
        Ok(body.freeze())
    }

    async fn offer_cache(&self, task: TaskId, request: &Request, response: Response, body: Bytes) {
        if !self.config.cache_responses || request.method != Method::GET || !response.is_success() {
            return;
        }
        let key = request.url.to_string();
        let proposed = CachedResponse::new(response, body);
        let accepted = self
            .ask(task, "will-cache-response", None, |reply| {
                TaskEvent::WillCacheResponse { proposed, reply }
            })
            .await;
        if let Some(entry) = accepted {
            debug!("Caching response for {}", key);
            self.cache.insert(key, entry);
        }
    }

    fn finish_task(&self, task: TaskId, error: Option<TransportError>) {
        self.tasks.remove(&task);
        match &error {
            Some(e) => debug!("Task {} completed with error: {}", task, e),
            None => debug!("Task {} completed", task),
        }
        self.emit(task, TaskEvent::Completed { error });
        self.report_invalidated_when_drained();
    }

    fn report_invalidated_when_drained(&self) {
        if !self.invalidating.load(Ordering::SeqCst) {
            return;
        }
        let running = self.tasks.iter().any(|entry| entry.started);
        if running || self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("HTTP transport invalidated");
        if let Some(delegate) = self.delegate() {
            delegate.session_invalidated(None);
        }
    }
}

impl Transport for HttpTransport {
    fn attach(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    fn create_task(&self, request: &Request, kind: TaskKind) -> TransportResult<TaskId> {
        if self.invalidating.load(Ordering::SeqCst) {
            return Err(TransportError::SessionInvalidated);
        }
        match request.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TransportError::UnsupportedUrl(format!(
                    "scheme '{}' in {}",
                    other, request.url
                )))
            }
        }
        let task = self.allocate(request.clone(), kind);
        debug!("Created {:?} task {} for {}", kind, task, request.url);
        Ok(task)
    }

    fn start_task(&self, task: TaskId) -> TransportResult<()> {
        if self.invalidated.load(Ordering::SeqCst) {
            return Err(TransportError::SessionInvalidated);
        }
        let mut entry = self
            .tasks
            .get_mut(&task)
            .ok_or(TransportError::UnknownTask(task))?;
        if entry.started {
            warn!("Task {} already started", task);
            return Ok(());
        }
        let cancel_tx = self.spawn(task, entry.request.clone(), entry.kind);
        entry.started = true;
        entry.cancel_tx = Some(cancel_tx);
        Ok(())
    }

    fn cancel_task(&self, task: TaskId) {
        let started = match self.tasks.get_mut(&task) {
            Some(mut entry) => {
                if let Some(cancel_tx) = entry.cancel_tx.take() {
                    let _ = cancel_tx.send(());
                }
                entry.started
            }
            None => {
                debug!("Cancel for unknown or finished task {}", task);
                return;
            }
        };
        if !started {
            self.finish_task(task, Some(TransportError::Cancelled));
        }
    }

    fn discard_task(&self, task: TaskId) {
        if self.tasks.remove_if(&task, |_, entry| !entry.started).is_some() {
            debug!("Discarded unstarted task {}", task);
        }
    }

    fn invalidate(&self, mode: InvalidationMode) {
        info!("Invalidating HTTP transport ({:?})", mode);
        self.invalidating.store(true, Ordering::SeqCst);

        if mode == InvalidationMode::CancelTasks {
            let tasks: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
            for task in tasks {
                self.cancel_task(task);
            }
        }
        self.report_invalidated_when_drained();
    }

    fn transport_type(&self) -> &'static str {
        "http"
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            error!("HTTP transport dropped with {} task(s) outstanding", self.tasks.len());
        }
    }
}

fn to_response(response: &reqwest::Response) -> Response {
    Response {
        url: response.url().clone(),
        status: response.status(),
        headers: response.headers().clone(),
        expected_content_length: response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(UNKNOWN_LENGTH),
    }
}

/// Realm of a Basic `WWW-Authenticate` challenge; `Some(None)` if it has none
fn basic_realm(response: &Response) -> Option<Option<String>> {
    let header = response.headers.get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let realm = params.split(',').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("realm")
            .then(|| value.trim_matches('"').to_string())
    });
    Some(realm)
}

/// Map a reqwest error, telling TLS failures apart from other connect errors
fn classify(err: reqwest::Error) -> TransportError {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("certificate") || text.contains("tls") {
            return TransportError::Tls(cause.to_string());
        }
        source = cause.source();
    }
    TransportError::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Delegate that answers with defaults and records what it saw
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        body: Mutex<BytesMut>,
        credential: Option<Credential>,
        done: mpsc::UnboundedSender<(TaskId, Option<TransportError>)>,
    }

    impl SessionDelegate for Recorder {
        fn task_event(&self, task: TaskId, event: TaskEvent) {
            self.events.lock().push(event.name());
            match event {
                TaskEvent::ResponseReceived { reply, .. } => reply.respond(ResponseDisposition::Allow),
                TaskEvent::DataReceived { chunk } => self.body.lock().extend_from_slice(&chunk),
                TaskEvent::WillRedirect { request, reply, .. } => reply.respond(Some(request)),
                TaskEvent::NeedNewBodyStream { reply } => reply.respond(None),
                TaskEvent::WillCacheResponse { proposed, reply } => reply.respond(Some(proposed)),
                TaskEvent::Challenge { reply, .. } => match self.credential.clone() {
                    Some(credential) => reply.respond(ChallengeReply::use_credential(credential)),
                    None => reply.respond(ChallengeReply::cancel()),
                },
                TaskEvent::Completed { error } => {
                    let _ = self.done.send((task, error));
                }
                TaskEvent::SentBodyData(_) | TaskEvent::BecameDownload { .. } => {}
            }
        }

        fn session_challenge(&self, _challenge: Challenge, reply: Responder<ChallengeReply>) {
            reply.respond(ChallengeReply::default_handling());
        }

        fn session_invalidated(&self, _error: Option<TransportError>) {}

        fn background_events_finished(&self) {}
    }

    fn recorder(
        credential: Option<Credential>,
    ) -> (Arc<Recorder>, mpsc::UnboundedReceiver<(TaskId, Option<TransportError>)>) {
        let (done, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            body: Mutex::new(BytesMut::new()),
            credential,
            done,
        });
        (recorder, rx)
    }

    /// One-request-per-connection server answering by path
    async fn serve(routes: fn(&str, &str) -> Option<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    match routes(&path, &head) {
                        Some(reply) => {
                            let _ = socket.write_all(reply.as_bytes()).await;
                        }
                        // hang until the client gives up
                        None => tokio::time::sleep(Duration::from_secs(30)).await,
                    }
                });
            }
        });
        format!("http://{}", addr)
    }

    fn ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn make_transport(delegate: &Arc<Recorder>, cache: bool) -> Arc<HttpTransport> {
        let config = HttpTransportConfig {
            cache_responses: cache,
            ..HttpTransportConfig::default()
        };
        let transport = HttpTransport::current(config).unwrap();
        let delegate: Arc<dyn SessionDelegate> = delegate.clone();
        transport.attach(Arc::downgrade(&delegate));
        transport
    }

    #[tokio::test]
    async fn test_fetch_reports_events_in_order() {
        let base = serve(|path, _| (path == "/hello").then(|| ok("hello world"))).await;
        let (delegate, mut done) = recorder(None);
        let transport = make_transport(&delegate, true);

        let request = Request::parse(Method::GET, &format!("{}/hello", base)).unwrap();
        let task = transport.create_task(&request, TaskKind::Data).unwrap();
        transport.start_task(task).unwrap();

        let (finished, error) = done.recv().await.unwrap();
        assert_eq!(finished, task);
        assert_eq!(error, None);
        assert_eq!(&delegate.body.lock()[..], b"hello world");

        let events = delegate.events.lock().clone();
        assert_eq!(events.first(), Some(&"response-received"));
        assert_eq!(events.last(), Some(&"completed"));
        assert!(events.contains(&"will-cache-response"));
        assert!(transport.cached_response(request.url.as_str()).is_some());
    }

    #[tokio::test]
    async fn test_follows_redirects() {
        let base = serve(|path, _| match path {
            "/old" => Some(
                "HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string(),
            ),
            "/new" => Some(ok("moved")),
            _ => None,
        })
        .await;
        let (delegate, mut done) = recorder(None);
        let transport = make_transport(&delegate, false);

        let request = Request::parse(Method::GET, &format!("{}/old", base)).unwrap();
        let task = transport.create_task(&request, TaskKind::Data).unwrap();
        transport.start_task(task).unwrap();

        let (_, error) = done.recv().await.unwrap();
        assert_eq!(error, None);
        assert_eq!(&delegate.body.lock()[..], b"moved");
        assert!(delegate.events.lock().contains(&"will-redirect"));
    }

    #[tokio::test]
    async fn test_basic_challenge() {
        fn routes(_: &str, head: &str) -> Option<String> {
            let expected = format!("authorization: Basic {}", STANDARD.encode("user:secret"));
            if head.to_lowercase().contains(&expected.to_lowercase()) {
                Some(ok("welcome"))
            } else {
                Some(
                    "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"api\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                )
            }
        }
        let base = serve(routes).await;
        let url = format!("{}/private", base);

        let (delegate, mut done) = recorder(Some(Credential::password("user", "secret")));
        let transport = make_transport(&delegate, false);
        let task = transport
            .create_task(&Request::parse(Method::GET, &url).unwrap(), TaskKind::Data)
            .unwrap();
        transport.start_task(task).unwrap();
        let (_, error) = done.recv().await.unwrap();
        assert_eq!(error, None);
        assert_eq!(&delegate.body.lock()[..], b"welcome");

        let (delegate, mut done) = recorder(None);
        let transport = make_transport(&delegate, false);
        let task = transport
            .create_task(&Request::parse(Method::GET, &url).unwrap(), TaskKind::Data)
            .unwrap();
        transport.start_task(task).unwrap();
        let (_, error) = done.recv().await.unwrap();
        assert!(matches!(error, Some(TransportError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let base = serve(|_, _| None).await;
        let (delegate, mut done) = recorder(None);
        let transport = make_transport(&delegate, false);

        let request = Request::parse(Method::GET, &format!("{}/slow", base)).unwrap();
        let task = transport.create_task(&request, TaskKind::Data).unwrap();
        transport.start_task(task).unwrap();
        transport.cancel_task(task);

        let (_, error) = done.recv().await.unwrap();
        assert_eq!(error, Some(TransportError::Cancelled));
        assert_eq!(transport.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_discarded_task_never_reports() {
        let (delegate, mut done) = recorder(None);
        let transport = make_transport(&delegate, false);

        let request = Request::parse(Method::GET, "http://127.0.0.1:9/idle").unwrap();
        let task = transport.create_task(&request, TaskKind::Data).unwrap();
        assert_eq!(transport.active_task_count(), 1);

        transport.discard_task(task);
        assert_eq!(transport.active_task_count(), 0);

        transport.invalidate(InvalidationMode::CancelTasks);
        assert!(done.try_recv().is_err());
        assert!(delegate.events.lock().is_empty());
        assert!(matches!(
            transport.start_task(task),
            Err(TransportError::SessionInvalidated | TransportError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let transport =
            HttpTransport::new(HttpTransportConfig::default(), runtime.handle().clone()).unwrap();
        let request = Request::parse(Method::GET, "file:///etc/hosts").unwrap();
        assert!(matches!(
            transport.create_task(&request, TaskKind::Data),
            Err(TransportError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_basic_realm_parsing() {
        let url = url::Url::parse("http://example.com").unwrap();
        let response = Response::new(url.clone(), StatusCode::UNAUTHORIZED).with_header(
            WWW_AUTHENTICATE,
            reqwest::header::HeaderValue::from_static("Basic realm=\"files\", charset=\"UTF-8\""),
        );
        assert_eq!(basic_realm(&response), Some(Some("files".to_string())));

        let bearer = Response::new(url, StatusCode::UNAUTHORIZED).with_header(
            WWW_AUTHENTICATE,
            reqwest::header::HeaderValue::from_static("Bearer"),
        );
        assert_eq!(basic_realm(&bearer), None);
    }
}
