use std::sync::{Arc, Weak};

use futures::future;
use parking_lot::Mutex;
use tokio::time::Instant;
use tonic::Status;
use tonic::metadata::MetadataMap;
use uuid::Uuid;

use crate::call::batch::{BatchCompletion, Direction, ValidatedBatch, validate};
use crate::call::{CallCommon, CancelHandle, MessageReceiver, Operation};
use crate::completion_queue::{CompletionQueue, Tag};
use crate::error::CallError;
use crate::metadata::{ClientMetadata, TrailingMetadata};
use crate::party::Party;
use crate::spine::{CallInitiator, new_call};
use crate::transport::{ClientTransport, SharedTransport, Target, spawn_client_stream};

/// A batch committed before the call started, run once the start outcome is known.
type DeferredBatch = Box<dyn FnOnce(Result<CallInitiator, Status>) + Send>;

enum StartState {
    Unstarted,
    Deferred(Vec<DeferredBatch>),
    Started(CallInitiator),
    Cancelled(Status),
}

/// Everything a channel hands to a new client call.
pub(crate) struct ClientCallSetup {
    pub client: Arc<dyn ClientTransport>,
    pub transport: SharedTransport,
    pub path: String,
    pub authority: Option<String>,
    pub deadline: Option<Instant>,
    pub max_metadata_entries: usize,
}

struct ClientCallInner {
    common: CallCommon,
    client: Arc<dyn ClientTransport>,
    transport: SharedTransport,
    party: Arc<Party>,
    path: String,
    authority: Option<String>,
    max_metadata_entries: usize,
    state: Mutex<StartState>,
    receiver: MessageReceiver,
}

/// The client side of one RPC.
///
/// The call starts when a batch containing `SEND_INITIAL_METADATA` is
/// committed. Batches committed earlier are deferred and run, in order, right
/// after the start. Dropping an unfinished call cancels it.
pub struct ClientCall {
    inner: Arc<ClientCallInner>,
}

impl ClientCall {
    pub(crate) fn new(setup: ClientCallSetup) -> Self {
        let common = CallCommon::new(true, String::new());
        let party = Party::new(format!("client-call-{}", common.id()));
        let inner = Arc::new(ClientCallInner {
            common,
            client: setup.client,
            transport: setup.transport,
            party,
            path: setup.path,
            authority: setup.authority,
            max_metadata_entries: setup.max_metadata_entries,
            state: Mutex::new(StartState::Unstarted),
            receiver: MessageReceiver::default(),
        });
        if let Some(deadline) = setup.deadline {
            let handle: Weak<dyn CancelHandle> = Arc::downgrade(&inner) as Weak<dyn CancelHandle>;
            inner.common.arm_deadline(deadline, handle);
        }
        tracing::debug!(call_id = %inner.common.id(), method = %inner.path, "Client call created");
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.common.id()
    }

    pub fn method(&self) -> &str {
        &self.inner.path
    }

    /// Remote address, known once the call has started.
    pub fn peer(&self) -> String {
        self.inner.common.peer()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.common.deadline()
    }

    pub fn receiver(&self) -> &MessageReceiver {
        &self.inner.receiver
    }

    /// Validate and commit a batch; `tag` is notified on `cq` when it completes.
    pub fn start_batch(
        &self,
        ops: &[Operation],
        cq: &Arc<CompletionQueue>,
        tag: Tag,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut batch = validate(ops, Direction::Client, inner.max_metadata_entries)?;

        let mut state = inner.state.lock();
        if batch.send_initial_metadata.is_some() && matches!(*state, StartState::Started(_)) {
            return Err(CallError::TooManyOperations);
        }
        let completion = BatchCompletion::begin(cq, tag)?;
        if batch.is_empty() {
            drop(state);
            completion.finish(Ok(()));
            return Ok(());
        }

        if let StartState::Cancelled(status) = &*state {
            let status = status.clone();
            drop(state);
            inner.run(Err(status), batch, completion);
            return Ok(());
        }

        if let Some((metadata, flags)) = batch.send_initial_metadata.take() {
            let started = inner.start(metadata, flags);
            let next = match &started {
                Ok(initiator) => StartState::Started(initiator.clone()),
                Err(status) => StartState::Cancelled(status.clone()),
            };
            let previous = std::mem::replace(&mut *state, next);
            // Still holding the state: batches committed after this one
            // cannot be scheduled ahead of the deferred ones.
            if let StartState::Deferred(deferred) = previous {
                tracing::debug!(call_id = %inner.common.id(), count = deferred.len(), "Running deferred batches");
                for run in deferred {
                    run(started.clone());
                }
            }
            inner.run(started, batch, completion);
            return Ok(());
        }

        if let StartState::Started(initiator) = &*state {
            let initiator = initiator.clone();
            inner.run(Ok(initiator), batch, completion);
            return Ok(());
        }

        let call = Arc::clone(inner);
        let deferred: DeferredBatch = Box::new(move |started| call.run(started, batch, completion));
        match &mut *state {
            StartState::Deferred(list) => list.push(deferred),
            _ => *state = StartState::Deferred(vec![deferred]),
        }
        Ok(())
    }

    /// Cancel with `CANCELLED`.
    pub fn cancel(&self) {
        self.inner.cancel_with_status(Status::cancelled("Cancelled"));
    }

    /// Cancel with an explicit status. Only the first cancellation counts.
    pub fn cancel_with_status(&self, status: Status) {
        self.inner.cancel_with_status(status);
    }

    pub(crate) fn cancel_handle(&self) -> Weak<dyn CancelHandle> {
        Arc::downgrade(&self.inner) as Weak<dyn CancelHandle>
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        let unfinished = match &*self.inner.state.lock() {
            StartState::Started(initiator) => initiator.trailing_metadata().is_none(),
            StartState::Cancelled(_) => false,
            StartState::Unstarted | StartState::Deferred(_) => true,
        };
        if unfinished {
            tracing::debug!(call_id = %self.inner.common.id(), "Client call dropped before finishing");
            self.inner
                .cancel_with_status(Status::cancelled("client call dropped before finishing"));
        }
    }
}

impl ClientCallInner {
    fn start(&self, metadata: MetadataMap, flags: u32) -> Result<CallInitiator, Status> {
        let stream = self.client.open_stream()?;
        self.common.set_peer(self.transport.peer());

        let client_metadata = ClientMetadata {
            path: self.path.clone(),
            authority: self.authority.clone(),
            deadline: self.common.deadline(),
            flags,
            entries: metadata,
        };
        let (initiator, handler) = new_call(client_metadata);
        spawn_client_stream(
            handler,
            Target {
                transport: Arc::clone(&self.transport),
                stream,
                party: Arc::clone(&self.party),
            },
        );
        tracing::debug!(call_id = %self.common.id(), method = %self.path, %stream, "Client call started");
        Ok(initiator)
    }

    fn run(
        self: &Arc<Self>,
        started: Result<CallInitiator, Status>,
        batch: ValidatedBatch,
        completion: BatchCompletion,
    ) {
        match started {
            Ok(initiator) => {
                let call = Arc::clone(self);
                self.party.spawn("client-batch", async move {
                    call.execute(initiator, batch, completion).await;
                });
            }
            // The cancellation already produced the call's result.
            Err(status) => {
                if let Some(out) = batch.recv_initial_metadata {
                    out.set(MetadataMap::new());
                }
                if let Some(out) = batch.recv_message {
                    out.set(None);
                }
                if let Some(out) = batch.recv_status_on_client {
                    out.set(TrailingMetadata::cancelled(&status));
                }
                completion.finish(Ok(()));
            }
        }
    }

    async fn execute(
        &self,
        initiator: CallInitiator,
        batch: ValidatedBatch,
        completion: BatchCompletion,
    ) {
        let ValidatedBatch {
            send_message,
            send_close_from_client,
            recv_initial_metadata,
            recv_message,
            recv_status_on_client,
            ..
        } = batch;

        let sends = async {
            if let Some(message) = send_message {
                initiator.push_message(message).await?;
            }
            if send_close_from_client {
                initiator.finish_sends();
            }
            Ok::<(), Status>(())
        };
        let receives = async {
            if let Some(out) = recv_initial_metadata {
                let metadata = initiator
                    .pull_server_initial_metadata()
                    .await
                    .unwrap_or_default();
                self.receiver.on_initial_metadata(&metadata);
                out.set(metadata);
            }
            if let Some(out) = recv_message {
                let message = initiator.pull_message().await?;
                if let Some(message) = &message {
                    self.receiver.on_message(message);
                }
                out.set(message.map(|m| m.payload));
            }
            Ok::<(), Status>(())
        };
        let primary = async { future::try_join(sends, receives).await.map(|_| ()) };

        match recv_status_on_client {
            Some(out) => {
                let status = async {
                    let trailing = initiator.pull_trailing_metadata().await;
                    self.common.reset_deadline();
                    tracing::debug!(
                        call_id = %self.common.id(),
                        code = ?trailing.code,
                        cancelled = trailing.was_cancelled,
                        "Client call finished"
                    );
                    out.set(trailing);
                };
                let (result, ()) = future::join(primary, status).await;
                if let Err(status) = result {
                    tracing::debug!(call_id = %self.common.id(), error = %status, "Batch failed alongside status");
                }
                completion.finish(Ok(()));
            }
            None => completion.finish(primary.await),
        }
    }
}

impl CancelHandle for ClientCallInner {
    fn cancel_with_status(&self, status: Status) {
        let deferred = {
            let mut state = self.state.lock();
            let started = match &*state {
                StartState::Started(initiator) => Some(initiator.clone()),
                StartState::Cancelled(_) => return,
                StartState::Unstarted | StartState::Deferred(_) => None,
            };
            if let Some(initiator) = started {
                drop(state);
                if initiator.cancel(status.clone()) {
                    tracing::debug!(call_id = %self.common.id(), code = ?status.code(), "Client call cancelled");
                }
                return;
            }
            match std::mem::replace(&mut *state, StartState::Cancelled(status.clone())) {
                StartState::Deferred(deferred) => deferred,
                _ => Vec::new(),
            }
        };
        tracing::debug!(call_id = %self.common.id(), code = ?status.code(), deferred = deferred.len(), "Client call cancelled before start");
        for run in deferred {
            run(Err(status.clone()));
        }
    }
}
