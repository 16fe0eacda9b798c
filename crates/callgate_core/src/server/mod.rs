//! The receiving side: registration, accepting streams, and matching arrived
//! calls with application requests.

mod admission;
mod call_data;
mod matcher;
mod registry;
mod requested_call;

pub use registry::{PayloadHandling, RegisteredMethod};
pub use requested_call::{CallDetails, CallRequest, RegisteredCallRequest};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::call::{CancelHandle, ServerCall};
use crate::completion_queue::{CompletionQueue, Tag};
use crate::config::{MatchingMode, ServerConfig};
use crate::error::{CallError, ServerError};
use crate::party::Party;
use crate::spine::{CallHandler, new_call};
use crate::transport::{
    BatchBuilder, InitialMetadata, SharedTransport, StreamId, Target, spawn_server_stream,
};

use admission::AdmissionControl;
use call_data::CallData;
use matcher::RequestMatcher;
use registry::{MethodKey, MethodRegistry};
use requested_call::RequestedCall;

struct Registration {
    cqs: Vec<Arc<CompletionQueue>>,
    started: bool,
}

/// Fixed at start: the queues calls can be requested on and the fallback
/// matcher for methods nobody registered.
struct Started {
    cqs: Vec<Arc<CompletionQueue>>,
    unregistered: Arc<RequestMatcher>,
}

impl Started {
    fn cq_index(&self, cq: &Arc<CompletionQueue>) -> Option<usize> {
        self.cqs.iter().position(|c| Arc::ptr_eq(c, cq))
    }
}

#[derive(Default)]
struct ShutdownState {
    requested: bool,
    published: bool,
    tags: Vec<(Arc<CompletionQueue>, Tag)>,
}

struct ServerInner {
    config: ServerConfig,
    registry: MethodRegistry,
    registration: Mutex<Registration>,
    started: OnceLock<Started>,
    // Taken before any matcher lock.
    shutdown: Mutex<ShutdownState>,
    shutting_down: AtomicBool,
    next_start: AtomicUsize,
    calls: Mutex<Vec<Weak<dyn CancelHandle>>>,
    active_calls: AtomicUsize,
    calls_done: Notify,
}

/// A server accepting calls from transports and handing them to the
/// application through completion queues.
///
/// ```ignore
/// let server = Server::new(ServerConfig::default());
/// server.register_completion_queue(&cq)?;
/// let echo = server.register_method("/echo.Echo/Say", None, PayloadHandling::None)?;
/// server.start()?;
///
/// let request = RegisteredCallRequest::new();
/// server.request_registered_call(&echo, &cq, Tag(1), &request)?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry: MethodRegistry::new(),
                registration: Mutex::new(Registration {
                    cqs: Vec::new(),
                    started: false,
                }),
                started: OnceLock::new(),
                shutdown: Mutex::new(ShutdownState::default()),
                shutting_down: AtomicBool::new(false),
                next_start: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                active_calls: AtomicUsize::new(0),
                calls_done: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Make `cq` a server completion queue. Only allowed before `start`.
    pub fn register_completion_queue(&self, cq: &Arc<CompletionQueue>) -> Result<(), ServerError> {
        let mut registration = self.inner.registration.lock();
        if registration.started {
            return Err(ServerError::RegistrationClosed);
        }
        if !registration.cqs.iter().any(|c| Arc::ptr_eq(c, cq)) {
            registration.cqs.push(Arc::clone(cq));
        }
        Ok(())
    }

    /// Register a method. A `None` host serves the method for every authority
    /// that has no exact registration. Only allowed before `start`.
    pub fn register_method(
        &self,
        method: &str,
        host: Option<&str>,
        payload_handling: PayloadHandling,
    ) -> Result<RegisteredMethod, ServerError> {
        let registration = self.inner.registration.lock();
        if registration.started {
            return Err(ServerError::RegistrationClosed);
        }
        let key = MethodKey::new(method, host);
        debug!(method = %key, ?payload_handling, "Registering method");
        let registered = self.inner.registry.register(key, payload_handling)?;
        drop(registration);
        Ok(registered)
    }

    /// Freeze registration and build the matchers.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut registration = self.inner.registration.lock();
        if registration.started {
            return Err(ServerError::AlreadyStarted);
        }
        registration.started = true;

        let config = &self.inner.config;
        let make_matcher = |cq_count: usize| {
            RequestMatcher::new(
                cq_count,
                AdmissionControl::new(config.pending_soft_limit, config.pending_hard_limit),
                config.max_pending_duration,
            )
        };
        let cqs = registration.cqs.clone();
        if cqs.is_empty() {
            warn!("Server started without a completion queue, calls can never be requested");
        }
        for entry in self.inner.registry.entries() {
            entry.install_matcher(make_matcher(cqs.len()));
        }
        let unregistered = Arc::new(make_matcher(cqs.len()));
        let cq_count = cqs.len();
        let _ = self.inner.started.set(Started { cqs, unregistered });

        info!(
            completion_queues = cq_count,
            methods = self.inner.registry.len(),
            matching = ?config.matching,
            "Server started"
        );
        Ok(())
    }

    /// Ask for the next call to a method that was not registered.
    ///
    /// `tag` is notified on `cq` once the out-parameters in `request` are
    /// filled, or with an error if the server shuts down first.
    pub fn request_call(
        &self,
        cq: &Arc<CompletionQueue>,
        tag: Tag,
        request: &CallRequest,
    ) -> Result<(), CallError> {
        let (started, cq_idx) = self.inner.validate_request(cq)?;
        if !cq.begin_op(tag) {
            return Err(CallError::CompletionQueueShutdown);
        }
        let rc = RequestedCall::unregistered(cq, tag, request);
        self.inner
            .queue_requested_call(&started.unregistered, cq_idx, rc);
        Ok(())
    }

    /// Ask for the next call to `method`.
    ///
    /// `request.payload` must be present exactly when the method was
    /// registered with [`PayloadHandling::ReadInitialPayload`].
    pub fn request_registered_call(
        &self,
        method: &RegisteredMethod,
        cq: &Arc<CompletionQueue>,
        tag: Tag,
        request: &RegisteredCallRequest,
    ) -> Result<(), CallError> {
        let wants_payload = method.payload_handling() == PayloadHandling::ReadInitialPayload;
        if request.payload.is_some() != wants_payload {
            return Err(CallError::PayloadTypeMismatch);
        }
        let (_, cq_idx) = self.inner.validate_request(cq)?;
        let Some(matcher) = method.entry().matcher() else {
            return Err(CallError::Error);
        };
        if !cq.begin_op(tag) {
            return Err(CallError::CompletionQueueShutdown);
        }
        let rc = RequestedCall::registered(cq, tag, request);
        self.inner.queue_requested_call(matcher, cq_idx, rc);
        Ok(())
    }

    /// Accept a new incoming stream on `transport`. Must be called from
    /// within a tokio runtime.
    pub fn accept_stream(&self, transport: SharedTransport, stream: StreamId) {
        let party = Party::new(format!("server-{stream}"));
        let target = Target {
            transport,
            stream,
            party: Arc::clone(&party),
        };
        let server = Arc::clone(&self.inner);
        party.spawn("accept", async move { server.accept(target).await });
    }

    /// Accept every stream announced on `incoming` until the sender goes away.
    pub fn serve(
        &self,
        transport: SharedTransport,
        mut incoming: mpsc::UnboundedReceiver<StreamId>,
    ) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                server.accept_stream(Arc::clone(&transport), stream);
            }
            debug!("Incoming stream source closed");
        })
    }

    /// Begin shutting down; `tag` is notified on `cq` once every accepted
    /// call has finished.
    ///
    /// The first call fails all outstanding requests and pending arrivals
    /// with `UNAVAILABLE`. Later calls only add their tag. Must be called
    /// from within a tokio runtime.
    pub fn shutdown_and_notify(&self, cq: &Arc<CompletionQueue>, tag: Tag) {
        let mut state = self.inner.shutdown.lock();
        if !cq.begin_op(tag) {
            warn!(%tag, "Shutdown tag rejected by its completion queue");
            return;
        }
        if state.published {
            drop(state);
            cq.end_op(tag, Ok(()));
            return;
        }
        state.tags.push((Arc::clone(cq), tag));
        if state.requested {
            return;
        }
        state.requested = true;
        self.inner.shutting_down.store(true, Ordering::Release);
        info!(active_calls = self.inner.active_calls.load(Ordering::Acquire), "Server shutting down");
        self.inner
            .kill_pending_work(&Status::unavailable("Server Shutdown"));
        drop(state);

        let server = Arc::clone(&self.inner);
        tokio::spawn(async move {
            server.wait_for_calls().await;
            server.publish_shutdown();
        });
    }

    /// Cancel every call this server has accepted and not yet finished.
    pub fn cancel_all_calls(&self) {
        let calls = std::mem::take(&mut *self.inner.calls.lock());
        let live: Vec<_> = calls.iter().filter_map(Weak::upgrade).collect();
        info!(calls = live.len(), "Cancelling all calls");
        for call in live {
            call.cancel_with_status(Status::unavailable("Cancelling all calls"));
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Accepted calls that have not finished yet.
    pub fn active_calls(&self) -> usize {
        self.inner.active_calls.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.inner.registry)
            .field("started", &self.inner.started.get().is_some())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ServerInner {
    fn validate_request(&self, cq: &Arc<CompletionQueue>) -> Result<(&Started, usize), CallError> {
        let Some(started) = self.started.get() else {
            debug!(cq = cq.id(), "Call requested before the server started");
            return Err(CallError::Error);
        };
        let cq_idx = started
            .cq_index(cq)
            .ok_or(CallError::NotServerCompletionQueue)?;
        Ok((started, cq_idx))
    }

    fn queue_requested_call(&self, matcher: &RequestMatcher, cq_idx: usize, rc: RequestedCall) {
        let state = self.shutdown.lock();
        if state.requested {
            drop(state);
            rc.fail(Status::unavailable("Server Shutdown"));
            return;
        }
        matcher.request_call_with_possible_publish(cq_idx, rc);
    }

    fn matchers(&self) -> Vec<Arc<RequestMatcher>> {
        let Some(started) = self.started.get() else {
            return Vec::new();
        };
        let mut matchers = vec![Arc::clone(&started.unregistered)];
        matchers.extend(
            self.registry
                .entries()
                .iter()
                .filter_map(|entry| entry.matcher().cloned()),
        );
        matchers
    }

    fn kill_pending_work(&self, status: &Status) {
        for matcher in self.matchers() {
            matcher.kill_requests(status);
            matcher.zombify_pending();
        }
    }

    async fn wait_for_calls(&self) {
        loop {
            let notified = self.calls_done.notified();
            if self.active_calls.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn publish_shutdown(&self) {
        let tags = {
            let mut state = self.shutdown.lock();
            state.published = true;
            std::mem::take(&mut state.tags)
        };
        info!(tags = tags.len(), "Server shutdown complete");
        for (cq, tag) in tags {
            cq.end_op(tag, Ok(()));
        }
    }

    fn track(self: &Arc<Self>, call: &ServerCall, handler: CallHandler, party: &Party) {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
        {
            let mut calls = self.calls.lock();
            calls.retain(|c| c.strong_count() > 0);
            calls.push(call.cancel_handle());
        }
        let server = Arc::downgrade(self);
        party.spawn("track-call", async move {
            handler.pull_trailing_metadata().await;
            if let Some(server) = server.upgrade() {
                if server.active_calls.fetch_sub(1, Ordering::AcqRel) == 1 {
                    server.calls_done.notify_waiters();
                }
            }
        });
    }

    async fn accept(self: Arc<Self>, target: Target) {
        let builder = BatchBuilder::new();
        let metadata = match builder.receive_initial_metadata(&target).await {
            Ok(Some(InitialMetadata::Client(metadata))) => metadata,
            Ok(_) => {
                warn!(stream = %target.stream, "Stream opened without client initial metadata");
                let _ = builder
                    .cancel(&target, Status::internal("missing client initial metadata"))
                    .await;
                return;
            }
            Err(status) => {
                debug!(stream = %target.stream, error = %status, "Stream failed before initial metadata");
                return;
            }
        };

        let Some(started) = self.started.get() else {
            let _ = builder
                .cancel(&target, Status::unavailable("server not started"))
                .await;
            return;
        };
        if self.shutting_down.load(Ordering::Acquire) {
            let _ = builder
                .cancel(&target, Status::unavailable("Server Shutdown"))
                .await;
            return;
        }

        let method = metadata.path.clone();
        let host = metadata.authority.clone();
        let (initiator, handler) = new_call(metadata);
        let call = ServerCall::new(
            handler.clone(),
            Arc::clone(&target.party),
            target.transport.peer(),
            self.config.max_metadata_entries,
        );
        self.track(&call, handler.clone(), &target.party);
        spawn_server_stream(initiator, target.clone());

        let (matcher, payload_handling) = match self
            .registry
            .lookup(&method, host.as_deref())
            .and_then(|entry| {
                entry
                    .matcher()
                    .map(|matcher| (Arc::clone(matcher), entry.payload_handling()))
            }) {
            Some(found) => found,
            None => (Arc::clone(&started.unregistered), PayloadHandling::None),
        };

        let payload = match payload_handling {
            PayloadHandling::None => None,
            PayloadHandling::ReadInitialPayload => match handler.pull_message().await {
                Ok(Some(message)) => {
                    call.receiver().on_message(&message);
                    Some(message.payload)
                }
                Ok(None) => None,
                Err(status) => {
                    debug!(call_id = %call.id(), error = %status, "Call ended before its initial payload");
                    return;
                }
            },
        };

        let start = self.next_start.fetch_add(1, Ordering::Relaxed);
        match self.config.matching {
            MatchingMode::Legacy => {
                matcher.match_or_queue(start, Arc::new(CallData::new(call, payload)));
            }
            MatchingMode::Promise => {
                let mut rng = StdRng::from_rng(&mut rand::rng());
                let matched = tokio::select! {
                    matched = matcher.match_request(start, &mut rng) => matched,
                    _ = handler.was_cancelled() => {
                        Err(Status::cancelled("call ended before it was matched"))
                    }
                };
                match matched {
                    Ok(matched) => {
                        debug!(call_id = %call.id(), cq_idx = matched.cq_idx(), "Call matched");
                        matched.into_requested_call().complete(call, payload);
                    }
                    Err(status) => {
                        debug!(call_id = %call.id(), error = %status, "Call not matched");
                        call.cancel_with_status(status);
                    }
                }
            }
        }
    }
}
