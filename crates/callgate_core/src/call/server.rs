use std::sync::atomic::{AtomicBool, Ordering};
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
use crate::party::Party;
use crate::spine::CallHandler;
use crate::sync::Latch;

struct ServerCallInner {
    common: CallCommon,
    handler: CallHandler,
    party: Arc<Party>,
    receiver: MessageReceiver,
    max_metadata_entries: usize,
    saw_cancellation: AtomicBool,
    saw_trailing_metadata: AtomicBool,
    initial_metadata_committed: AtomicBool,
    initial_metadata_scheduled: Latch<()>,
    children: Mutex<Vec<Weak<dyn CancelHandle>>>,
}

/// The server side of one RPC, handed to the application by a matched
/// request. Dropping it before a status was committed cancels the call.
pub struct ServerCall {
    inner: Arc<ServerCallInner>,
}

impl ServerCall {
    pub(crate) fn new(
        handler: CallHandler,
        party: Arc<Party>,
        peer: String,
        max_metadata_entries: usize,
    ) -> Self {
        let receiver = MessageReceiver::default();
        receiver.on_initial_metadata(&handler.client_initial_metadata().entries);
        let deadline = handler.client_initial_metadata().deadline;

        let inner = Arc::new(ServerCallInner {
            common: CallCommon::new(false, peer),
            handler,
            party,
            receiver,
            max_metadata_entries,
            saw_cancellation: AtomicBool::new(false),
            saw_trailing_metadata: AtomicBool::new(false),
            initial_metadata_committed: AtomicBool::new(false),
            initial_metadata_scheduled: Latch::new(),
            children: Mutex::new(Vec::new()),
        });
        if let Some(deadline) = deadline {
            let handle: Weak<dyn CancelHandle> = Arc::downgrade(&inner) as Weak<dyn CancelHandle>;
            inner.common.arm_deadline(deadline, handle);
        }

        // Cancellation of this call reaches every child call.
        let weak = Arc::downgrade(&inner);
        let handler = inner.handler.clone();
        inner.party.spawn("propagate-cancellation", async move {
            let trailing = handler.pull_trailing_metadata().await;
            if !trailing.was_cancelled {
                return;
            }
            if let Some(call) = weak.upgrade() {
                call.saw_cancellation.store(true, Ordering::Release);
                call.common.reset_deadline();
                call.cancel_children(&trailing.to_status());
            }
        });

        tracing::debug!(
            call_id = %inner.common.id(),
            method = %inner.handler.client_initial_metadata().path,
            "Server call created"
        );
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.common.id()
    }

    pub fn method(&self) -> &str {
        &self.inner.handler.client_initial_metadata().path
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.handler.client_initial_metadata().authority.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.common.deadline()
    }

    pub fn peer(&self) -> String {
        self.inner.common.peer()
    }

    /// The client's initial metadata.
    pub fn client_metadata(&self) -> &MetadataMap {
        &self.inner.handler.client_initial_metadata().entries
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
        let batch = validate(ops, Direction::Server, inner.max_metadata_entries)?;
        let sends_initial_metadata = batch.send_initial_metadata.is_some();
        let sends_status = batch.send_status_from_server.is_some();

        // Trailing metadata committed in a later batch must not overtake
        // initial metadata committed in an earlier one.
        let wait_for_initial_metadata =
            !sends_initial_metadata && inner.initial_metadata_committed.load(Ordering::Acquire);

        // Each flag is claimed by exactly one batch; a failed claim undoes
        // the claims made before it.
        if sends_initial_metadata && inner.initial_metadata_committed.swap(true, Ordering::AcqRel) {
            return Err(CallError::TooManyOperations);
        }
        if sends_status && inner.saw_trailing_metadata.swap(true, Ordering::AcqRel) {
            inner.release_claims(sends_initial_metadata, false);
            return Err(CallError::TooManyOperations);
        }
        let completion = match BatchCompletion::begin(cq, tag) {
            Ok(completion) => completion,
            Err(err) => {
                inner.release_claims(sends_initial_metadata, sends_status);
                return Err(err);
            }
        };
        if batch.is_empty() {
            completion.finish(Ok(()));
            return Ok(());
        }

        let call = Arc::clone(inner);
        inner.party.spawn("server-batch", async move {
            call.execute(batch, wait_for_initial_metadata, completion)
                .await;
        });
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

    /// Register a call that is cancelled together with this one.
    pub(crate) fn add_child(&self, child: Weak<dyn CancelHandle>) {
        if let Some(trailing) = self.inner.handler.trailing_metadata() {
            if trailing.was_cancelled {
                if let Some(child) = child.upgrade() {
                    child.cancel_with_status(trailing.to_status());
                }
                return;
            }
        }
        let mut children = self.inner.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(child);
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        let inner = &self.inner;
        if !inner.saw_trailing_metadata.load(Ordering::Acquire)
            && !inner.saw_cancellation.load(Ordering::Acquire)
        {
            tracing::debug!(call_id = %inner.common.id(), "Server call orphaned without a status");
            inner.cancel_with_status(Status::cancelled("server call dropped without a status"));
        }
    }
}

impl ServerCallInner {
    fn release_claims(&self, initial_metadata: bool, status: bool) {
        if initial_metadata {
            self.initial_metadata_committed.store(false, Ordering::Release);
        }
        if status {
            self.saw_trailing_metadata.store(false, Ordering::Release);
        }
    }

    async fn execute(
        &self,
        batch: ValidatedBatch,
        wait_for_initial_metadata: bool,
        completion: BatchCompletion,
    ) {
        let trailers_only = batch.is_trailers_only();
        let ValidatedBatch {
            send_initial_metadata,
            send_message,
            send_status_from_server,
            recv_message,
            recv_close_on_server,
            ..
        } = batch;

        let sends = async {
            match send_initial_metadata {
                // The empty initial metadata is implied by trailers-only.
                Some(_) if trailers_only => {
                    self.initial_metadata_scheduled.set(());
                }
                Some((metadata, _)) => {
                    self.handler.push_server_initial_metadata(metadata);
                    self.initial_metadata_scheduled.set(());
                }
                None => {}
            }
            if let Some(message) = send_message {
                self.handler.push_message(message).await?;
            }
            if let Some(trailing) = send_status_from_server {
                if wait_for_initial_metadata {
                    self.initial_metadata_scheduled.wait().await;
                }
                tracing::debug!(call_id = %self.common.id(), code = ?trailing.code, trailers_only, "Sending status");
                self.handler.push_trailing_metadata(trailing);
            }
            Ok::<(), Status>(())
        };
        let receives = async {
            if let Some(out) = recv_message {
                let message = self.handler.pull_message().await?;
                if let Some(message) = &message {
                    self.receiver.on_message(message);
                }
                out.set(message.map(|m| m.payload));
            }
            Ok::<(), Status>(())
        };
        let primary = async { future::try_join(sends, receives).await.map(|_| ()) };

        match recv_close_on_server {
            Some(out) => {
                if let Err(status) = primary.await {
                    tracing::debug!(call_id = %self.common.id(), error = %status, "Batch failed before close");
                }
                let cancelled = self.handler.was_cancelled().await;
                self.common.reset_deadline();
                if cancelled {
                    self.saw_cancellation.store(true, Ordering::Release);
                }
                out.set(cancelled);
                completion.finish(Ok(()));
            }
            None => completion.finish(primary.await),
        }
    }

    fn cancel_children(&self, status: &Status) {
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel_with_status(status.clone());
        }
    }
}

impl CancelHandle for ServerCallInner {
    fn cancel_with_status(&self, status: Status) {
        if self.handler.cancel(status.clone()) {
            tracing::debug!(call_id = %self.common.id(), code = ?status.code(), "Server call cancelled");
            self.saw_cancellation.store(true, Ordering::Release);
        }
    }
}
