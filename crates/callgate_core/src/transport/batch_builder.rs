//! Coalescing of logical stream operations into physical transport batches.
//!
//! Operations staged for the same stream during one poll of the call's party
//! share one [`StreamOp`], which is handed to the transport when that poll
//! ends. The transport completes each part of the op once; every completion
//! re-enters the call's party and resolves the logical waiters of its part.
//! A batch is kept alive by the futures waiting on it, so it is only freed
//! after the last waiter has observed its result.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tonic::{Code, Status};

use crate::metadata::{Message, TrailingMetadata};
use crate::party::Party;
use crate::sync::Latch;
use crate::transport::{
    InitialMetadata, OpCompletion, OpPart, StreamId, StreamOp, StreamOpResults, Transport,
};

/// Where a batch goes: one stream on one transport, completed on one party.
#[derive(Clone)]
pub(crate) struct Target {
    pub transport: Arc<dyn Transport>,
    pub stream: StreamId,
    pub party: Arc<Party>,
}

impl Target {
    fn same_stream(&self, other: &Target) -> bool {
        self.stream == other.stream
            && std::ptr::addr_eq(Arc::as_ptr(&self.transport), Arc::as_ptr(&other.transport))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    SendInitialMetadata,
    SendMessage,
    SendTrailingMetadata,
    RecvInitialMetadata,
    RecvMessage,
    RecvTrailingMetadata,
}

impl Part {
    fn present_in(self, op: &StreamOp) -> bool {
        match self {
            Part::SendInitialMetadata => op.send_initial_metadata.is_some(),
            Part::SendMessage => op.send_message.is_some(),
            Part::SendTrailingMetadata => op.send_trailing_metadata.is_some(),
            Part::RecvInitialMetadata => op.recv_initial_metadata,
            Part::RecvMessage => op.recv_message,
            Part::RecvTrailingMetadata => op.recv_trailing_metadata,
        }
    }
}

#[derive(Debug, Clone)]
enum Completed {
    Sent { trailing_metadata_sent: bool },
    InitialMetadata(Option<InitialMetadata>),
    Message(Option<Message>),
    TrailingMetadata(Option<TrailingMetadata>),
}

struct PendingCompletion {
    done: Latch<Result<Completed, Status>>,
}

/// The logical waiters of a batch, one slot per [`OpPart`].
#[derive(Default)]
struct BatchState {
    op: StreamOp,
    dispatched: bool,
    pending: [Option<Arc<PendingCompletion>>; 4],
}

impl BatchState {
    fn completion(&mut self, part: OpPart) -> Arc<PendingCompletion> {
        let slot = &mut self.pending[part as usize];
        Arc::clone(slot.get_or_insert_with(|| {
            Arc::new(PendingCompletion {
                done: Latch::new(),
            })
        }))
    }

    fn pending(&self, part: OpPart) -> Option<&Arc<PendingCompletion>> {
        self.pending[part as usize].as_ref()
    }
}

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

struct Batch {
    id: u64,
    target: Target,
    state: Mutex<BatchState>,
}

impl Batch {
    fn new(target: Target) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed),
            target,
            state: Mutex::new(BatchState::default()),
        })
    }

    /// Hand the batch to the transport. Idempotent.
    fn dispatch(self: &Arc<Self>) {
        let op = {
            let mut state = self.state.lock();
            if state.dispatched {
                return;
            }
            state.dispatched = true;
            std::mem::take(&mut state.op)
        };

        tracing::trace!(
            batch = self.id,
            stream = %self.target.stream,
            send_initial_metadata = op.send_initial_metadata.is_some(),
            send_message = op.send_message.is_some(),
            send_trailing_metadata = op.send_trailing_metadata.is_some(),
            recv_initial_metadata = op.recv_initial_metadata,
            recv_message = op.recv_message,
            recv_trailing_metadata = op.recv_trailing_metadata,
            cancel = op.cancel.is_some(),
            "Dispatching stream op"
        );

        let (completion, receivers) = OpCompletion::new(&op);
        for (part, rx) in receivers {
            let batch = Arc::clone(self);
            self.target.party.spawn("batch-completion", async move {
                let result = rx
                    .await
                    .unwrap_or_else(|_| Err(Status::cancelled("transport lost the stream op")));
                batch.complete(part, result);
            });
        }
        self.target
            .transport
            .perform_stream_op(self.target.stream, op, completion);
    }

    fn complete(&self, part: OpPart, result: Result<StreamOpResults, Status>) {
        let state = self.state.lock();
        let Some(pending) = state.pending(part) else {
            return;
        };
        let completed = result.map(|mut results| match part {
            OpPart::Sends => Completed::Sent {
                trailing_metadata_sent: results.trailing_metadata_sent,
            },
            OpPart::RecvInitialMetadata => {
                Completed::InitialMetadata(results.initial_metadata.take())
            }
            OpPart::RecvMessage => Completed::Message(results.message.take()),
            OpPart::RecvTrailingMetadata => {
                Completed::TrailingMetadata(results.trailing_metadata.take())
            }
        });
        if let Err(status) = &completed {
            tracing::debug!(batch = self.id, stream = %self.target.stream, ?part, error = %status, "Stream op failed");
        }
        pending.done.set(completed);
    }
}

/// Await one logical waiter of a batch.
fn await_completion(
    batch: Arc<Batch>,
    pending: Arc<PendingCompletion>,
) -> impl Future<Output = Result<Completed, Status>> + Send + 'static {
    async move {
        let result = pending.done.wait().await;
        // The batch reference is held until the result has been observed.
        drop(batch);
        result
    }
}

/// Per-call builder of transport batches.
pub(crate) struct BatchBuilder {
    open: Mutex<Option<Arc<Batch>>>,
    initial_metadata_sent: Mutex<HashSet<StreamId>>,
}

impl BatchBuilder {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(None),
            initial_metadata_sent: Mutex::new(HashSet::new()),
        }
    }

    /// Add `part` to the open batch for `target`, or to a fresh one if the
    /// open batch targets another stream, already has that part, was
    /// dispatched, or the transport does not coalesce. A fresh batch is
    /// dispatched when the current poll of the target's party ends.
    fn stage(
        &self,
        target: &Target,
        part: Part,
        kind: OpPart,
        fill: impl FnOnce(&mut StreamOp),
    ) -> (Arc<Batch>, Arc<PendingCompletion>) {
        let mut open = self.open.lock();
        if let Some(batch) = open.as_ref() {
            let mut state = batch.state.lock();
            let reusable = target.transport.supports_coalescing()
                && !state.dispatched
                && batch.target.same_stream(target)
                && !part.present_in(&state.op);
            if reusable {
                fill(&mut state.op);
                let pending = state.completion(kind);
                drop(state);
                return (Arc::clone(batch), pending);
            }
        }

        // Flush under the builder lock so physical ops keep staging order.
        if let Some(stale) = open.take() {
            stale.dispatch();
        }
        let batch = Batch::new(target.clone());
        let pending = {
            let mut state = batch.state.lock();
            fill(&mut state.op);
            state.completion(kind)
        };
        *open = Some(Arc::clone(&batch));
        let flush = Arc::clone(&batch);
        target.party.at_poll_end(move || flush.dispatch());
        (batch, pending)
    }

    fn initial_metadata_sent(&self, stream: StreamId) -> bool {
        self.initial_metadata_sent.lock().contains(&stream)
    }

    pub(crate) fn send_initial_metadata(
        &self,
        target: &Target,
        metadata: InitialMetadata,
    ) -> impl Future<Output = Result<(), Status>> + Send + 'static {
        self.initial_metadata_sent.lock().insert(target.stream);
        let (batch, pending) = self.stage(target, Part::SendInitialMetadata, OpPart::Sends, |op| {
            op.send_initial_metadata = Some(metadata)
        });
        let done = await_completion(batch, pending);
        async move { done.await.map(|_| ()) }
    }

    pub(crate) fn send_message(
        &self,
        target: &Target,
        message: Message,
    ) -> impl Future<Output = Result<(), Status>> + Send + 'static {
        let (batch, pending) = self.stage(target, Part::SendMessage, OpPart::Sends, |op| {
            op.send_message = Some(message)
        });
        let done = await_completion(batch, pending);
        async move { done.await.map(|_| ()) }
    }

    /// Send trailing metadata.
    ///
    /// With `convert_to_cancellation`, a stream on which no initial metadata
    /// was sent gets a cancellation carrying the same status instead. The
    /// returned metadata has `was_cancelled` set unless it reached the peer.
    pub(crate) fn send_trailing_metadata(
        &self,
        target: &Target,
        trailing: TrailingMetadata,
        convert_to_cancellation: bool,
    ) -> impl Future<Output = Result<TrailingMetadata, Status>> + Send + 'static {
        let converted = convert_to_cancellation && !self.initial_metadata_sent(target.stream);
        let (batch, pending) = if converted {
            tracing::debug!(
                stream = %target.stream,
                code = ?trailing.code,
                "Trailing metadata before initial metadata, sending cancellation"
            );
            self.cancel_batch(target, trailing.to_status())
        } else {
            let sent = trailing.clone();
            self.stage(target, Part::SendTrailingMetadata, OpPart::Sends, |op| {
                op.send_trailing_metadata = Some(sent)
            })
        };
        let done = await_completion(batch, pending);
        async move {
            let trailing_metadata_sent = match done.await? {
                Completed::Sent {
                    trailing_metadata_sent,
                } => trailing_metadata_sent,
                _ => false,
            };
            let mut trailing = trailing;
            trailing.was_cancelled = converted || !trailing_metadata_sent;
            Ok(trailing)
        }
    }

    /// Initial metadata from the peer, `None` if the peer answered with
    /// trailing metadata only.
    pub(crate) fn receive_initial_metadata(
        &self,
        target: &Target,
    ) -> impl Future<Output = Result<Option<InitialMetadata>, Status>> + Send + 'static {
        let (batch, pending) = self.stage(
            target,
            Part::RecvInitialMetadata,
            OpPart::RecvInitialMetadata,
            |op| op.recv_initial_metadata = true,
        );
        let done = await_completion(batch, pending);
        async move {
            match done.await? {
                Completed::InitialMetadata(metadata) => Ok(metadata),
                _ => Ok(None),
            }
        }
    }

    /// Next message, `None` at end of stream.
    pub(crate) fn receive_message(
        &self,
        target: &Target,
    ) -> impl Future<Output = Result<Option<Message>, Status>> + Send + 'static {
        let (batch, pending) =
            self.stage(target, Part::RecvMessage, OpPart::RecvMessage, |op| {
                op.recv_message = true
            });
        let done = await_completion(batch, pending);
        async move {
            match done.await? {
                Completed::Message(message) => Ok(message),
                _ => Ok(None),
            }
        }
    }

    /// Trailing metadata. Never fails: transport errors are turned into
    /// trailing metadata marked as cancelled.
    pub(crate) fn receive_trailing_metadata(
        &self,
        target: &Target,
    ) -> impl Future<Output = TrailingMetadata> + Send + 'static {
        let (batch, pending) = self.stage(
            target,
            Part::RecvTrailingMetadata,
            OpPart::RecvTrailingMetadata,
            |op| op.recv_trailing_metadata = true,
        );
        let done = await_completion(batch, pending);
        async move {
            match done.await {
                Ok(Completed::TrailingMetadata(Some(trailing))) => trailing,
                Ok(_) => TrailingMetadata::cancelled(&Status::new(
                    Code::Internal,
                    "stream completed without trailing metadata",
                )),
                Err(status) => TrailingMetadata::cancelled(&status),
            }
        }
    }

    /// Cancel the stream. Bypasses the open batch and dispatches at once.
    pub(crate) fn cancel(
        &self,
        target: &Target,
        status: Status,
    ) -> impl Future<Output = Result<(), Status>> + Send + 'static {
        let (batch, pending) = self.cancel_batch(target, status);
        let done = await_completion(batch, pending);
        async move { done.await.map(|_| ()) }
    }

    fn cancel_batch(
        &self,
        target: &Target,
        status: Status,
    ) -> (Arc<Batch>, Arc<PendingCompletion>) {
        let batch = Batch::new(target.clone());
        let pending = {
            let mut state = batch.state.lock();
            state.op.cancel = Some(status);
            state.completion(OpPart::Sends)
        };
        batch.dispatch();
        (batch, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClientMetadata;
    use crate::transport::recording::RecordingTransport;
    use tonic::metadata::MetadataMap;

    fn target(transport: &Arc<RecordingTransport>, stream: u64) -> Target {
        Target {
            transport: Arc::clone(transport) as Arc<dyn Transport>,
            stream: StreamId(stream),
            party: Party::new("batch-test"),
        }
    }

    #[tokio::test]
    async fn test_ops_staged_together_share_one_batch() {
        let transport = RecordingTransport::new();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let initial = builder.send_initial_metadata(
            &target,
            InitialMetadata::Client(ClientMetadata::new("/a.B/C")),
        );
        let message = builder.send_message(&target, Message::new("hi"));
        let (a, b) = futures::join!(initial, message);
        a.unwrap();
        b.unwrap();

        let ops = transport.ops();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].op.send_initial_metadata.is_some());
        assert!(ops[0].op.send_message.is_some());
    }

    #[tokio::test]
    async fn test_steps_of_one_poll_share_one_batch() {
        let transport = RecordingTransport::manual();
        let target = target(&transport, 1);
        let builder = Arc::new(BatchBuilder::new());

        let (message_tx, message_rx) = tokio::sync::oneshot::channel();
        target.party.spawn("recv-message", {
            let builder = Arc::clone(&builder);
            let target = target.clone();
            async move {
                let _ = message_tx.send(builder.receive_message(&target).await);
            }
        });
        target.party.spawn("recv-close", {
            let builder = Arc::clone(&builder);
            let target = target.clone();
            async move {
                builder.receive_trailing_metadata(&target).await;
            }
        });

        transport.wait_for_ops(1).await;
        let ops = transport.ops();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].op.recv_message);
        assert!(ops[0].op.recv_trailing_metadata);

        // The message part completes without waiting for the close.
        let mut completion = transport.take_completion(0);
        completion.complete_part(
            OpPart::RecvMessage,
            Ok(StreamOpResults {
                message: Some(Message::new("early")),
                ..Default::default()
            }),
        );
        assert_eq!(message_rx.await.unwrap().unwrap(), Some(Message::new("early")));
        drop(completion);
    }

    #[tokio::test]
    async fn test_other_stream_flushes_open_batch() {
        let transport = RecordingTransport::new();
        let first = target(&transport, 1);
        let second = target(&transport, 2);
        let builder = BatchBuilder::new();

        let a = builder.send_message(&first, Message::new("one"));
        let b = builder.send_message(&second, Message::new("two"));
        // The first batch went out as soon as the second stream was staged.
        assert_eq!(transport.ops().len(), 1);
        assert_eq!(transport.ops()[0].stream, StreamId(1));

        let (a, b) = futures::join!(a, b);
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.ops().len(), 2);
        assert_eq!(transport.ops()[1].stream, StreamId(2));
    }

    #[tokio::test]
    async fn test_no_coalescing_when_transport_disables_it() {
        let transport = RecordingTransport::without_coalescing();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let a = builder.send_initial_metadata(&target, InitialMetadata::Server(MetadataMap::new()));
        let b = builder.send_message(&target, Message::new("x"));
        let (a, b) = futures::join!(a, b);
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.ops().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_part_starts_new_batch() {
        let transport = RecordingTransport::new();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let a = builder.send_message(&target, Message::new("1"));
        let b = builder.send_message(&target, Message::new("2"));
        let (a, b) = futures::join!(a, b);
        a.unwrap();
        b.unwrap();
        let ops = transport.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op.send_message, Some(Message::new("1")));
        assert_eq!(ops[1].op.send_message, Some(Message::new("2")));
    }

    #[tokio::test]
    async fn test_cancel_bypasses_open_batch() {
        let transport = RecordingTransport::new();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let _pending_send = builder.send_message(&target, Message::new("queued"));
        let cancel = builder.cancel(&target, Status::cancelled("stop"));
        // Dispatched immediately, while the send is still staged.
        let ops = transport.ops();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].op.cancel.is_some());
        assert!(ops[0].op.send_message.is_none());
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_trailing_without_initial_converts_to_cancel() {
        let transport = RecordingTransport::new();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let trailing = builder
            .send_trailing_metadata(
                &target,
                TrailingMetadata::new(Code::PermissionDenied, "nope"),
                true,
            )
            .await
            .unwrap();
        assert!(trailing.was_cancelled);

        let ops = transport.ops();
        assert_eq!(ops.len(), 1);
        let cancel = ops[0].op.cancel.as_ref().unwrap();
        assert_eq!(cancel.code(), Code::PermissionDenied);
        assert_eq!(cancel.message(), "nope");
        assert!(ops[0].op.send_trailing_metadata.is_none());
    }

    #[tokio::test]
    async fn test_trailing_after_initial_is_sent() {
        let transport = RecordingTransport::new();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        builder
            .send_initial_metadata(&target, InitialMetadata::Server(MetadataMap::new()))
            .await
            .unwrap();
        let trailing = builder
            .send_trailing_metadata(&target, TrailingMetadata::ok(), true)
            .await
            .unwrap();
        assert!(!trailing.was_cancelled);
        assert!(transport.ops()[1].op.send_trailing_metadata.is_some());
    }

    #[tokio::test]
    async fn test_receive_fans_out_single_completion() {
        let transport = RecordingTransport::manual();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let message = builder.receive_message(&target);
        let trailing = builder.receive_trailing_metadata(&target);
        let waiters = tokio::spawn(async move { futures::join!(message, trailing) });
        tokio::task::yield_now().await;
        transport.wait_for_ops(1).await;

        transport.complete(
            0,
            Ok(StreamOpResults {
                message: Some(Message::new("payload")),
                trailing_metadata: Some(TrailingMetadata::ok()),
                ..Default::default()
            }),
        );
        let (message, trailing) = waiters.await.unwrap();
        assert_eq!(message.unwrap(), Some(Message::new("payload")));
        assert!(trailing.is_ok());
        assert!(!trailing.was_cancelled);
    }

    #[tokio::test]
    async fn test_failed_receive_synthesizes_trailing_metadata() {
        let transport = RecordingTransport::manual();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let trailing = tokio::spawn(builder.receive_trailing_metadata(&target));
        transport.wait_for_ops(1).await;
        transport.complete(0, Err(Status::unavailable("connection reset")));

        let trailing = trailing.await.unwrap();
        assert_eq!(trailing.code, Code::Unavailable);
        assert_eq!(trailing.message, "connection reset");
        assert!(trailing.was_cancelled);
    }

    #[tokio::test]
    async fn test_batch_outlives_pending_waiters() {
        let transport = RecordingTransport::manual();
        let target = target(&transport, 1);
        let builder = BatchBuilder::new();

        let message = builder.receive_message(&target);
        let weak = {
            let open = builder.open.lock();
            Arc::downgrade(open.as_ref().unwrap())
        };
        let waiter = tokio::spawn(message);
        transport.wait_for_ops(1).await;
        drop(builder);

        // Dispatched and no longer held by the builder, yet alive while its waiter is pending.
        assert!(weak.upgrade().is_some());
        transport.complete(0, Ok(StreamOpResults::default()));
        assert_eq!(waiter.await.unwrap().unwrap(), None);

        // Completion step and waiter are both done.
        for _ in 0..10 {
            if weak.upgrade().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(weak.upgrade().is_none());
    }
}
