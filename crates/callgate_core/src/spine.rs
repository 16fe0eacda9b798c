//! The call spine: the pipes connecting the two ends of one call.
//!
//! The initiator end (client application, or the server-side transport
//! driver) pushes client messages and pulls the server's answer. The handler
//! end (server application, or the client-side transport driver) does the
//! opposite. Trailing metadata is single-assignment: whoever writes it first,
//! a sent status or a cancellation, decides how the call ends.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::metadata::{ClientMetadata, Message, TrailingMetadata};
use crate::sync::Latch;

const MESSAGE_PIPE_CAPACITY: usize = 1;

/// A bounded, closable message pipe with a single logical reader.
struct MessagePipe {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl MessagePipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_PIPE_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Wait for capacity and push. Returns false if the pipe is closed.
    async fn push(&self, message: Message) -> bool {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Close the writing side. Messages already pushed stay readable.
    fn close(&self) {
        self.tx.lock().take();
    }

    fn is_closed_for_writes(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Next message, or `None` once the pipe is closed and drained.
    async fn pull(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// True when the pipe is closed and nothing is left to read.
    fn is_finished(&self) -> bool {
        if !self.is_closed_for_writes() {
            return false;
        }
        match self.rx.try_lock() {
            Ok(rx) => rx.is_empty(),
            Err(_) => false,
        }
    }
}

pub(crate) struct CallSpine {
    client_initial_metadata: ClientMetadata,
    client_to_server: MessagePipe,
    server_initial_metadata: Latch<Option<MetadataMap>>,
    server_to_client: MessagePipe,
    server_trailing_metadata: Latch<TrailingMetadata>,
    local_cancel: Latch<Status>,
    // Serializes terminal writes so `local_cancel` is visible before the trailing metadata it caused.
    finish_lock: Mutex<()>,
}

impl CallSpine {
    fn new(client_initial_metadata: ClientMetadata) -> Self {
        Self {
            client_initial_metadata,
            client_to_server: MessagePipe::new(),
            server_initial_metadata: Latch::new(),
            server_to_client: MessagePipe::new(),
            server_trailing_metadata: Latch::new(),
            local_cancel: Latch::new(),
            finish_lock: Mutex::new(()),
        }
    }

    /// Record the end of the call. Only the first writer wins.
    fn finish(&self, trailing: TrailingMetadata) -> bool {
        let _guard = self.finish_lock.lock();
        self.finish_locked(trailing)
    }

    fn finish_locked(&self, trailing: TrailingMetadata) -> bool {
        // A call that ends without initial metadata is trailers-only.
        self.server_initial_metadata.set(None);
        let won = self.server_trailing_metadata.set(trailing);
        if won {
            self.client_to_server.close();
            self.server_to_client.close();
        }
        won
    }

    fn cancel(&self, status: Status) -> bool {
        let _guard = self.finish_lock.lock();
        if self.server_trailing_metadata.is_set() {
            return false;
        }
        self.local_cancel.set(status.clone());
        self.finish_locked(TrailingMetadata::cancelled(&status))
    }

    async fn pull_from(&self, pipe: &MessagePipe) -> Result<Option<Message>, Status> {
        tokio::select! {
            biased;
            message = pipe.pull() => Ok(message),
            trailing = self.server_trailing_metadata.wait() => {
                if trailing.was_cancelled {
                    Err(trailing.to_status())
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn push_to(&self, pipe: &MessagePipe, message: Message) -> Result<(), Status> {
        tokio::select! {
            biased;
            trailing = self.server_trailing_metadata.wait() => Err(ended_status(&trailing)),
            pushed = pipe.push(message) => {
                if pushed {
                    Ok(())
                } else {
                    Err(Status::cancelled("message pipe closed"))
                }
            }
        }
    }
}

fn ended_status(trailing: &TrailingMetadata) -> Status {
    if trailing.is_ok() {
        Status::cancelled("call already finished")
    } else {
        trailing.to_status()
    }
}

/// Create a fresh spine and return both of its ends.
pub(crate) fn new_call(client_initial_metadata: ClientMetadata) -> (CallInitiator, CallHandler) {
    let spine = Arc::new(CallSpine::new(client_initial_metadata));
    (
        CallInitiator {
            spine: Arc::clone(&spine),
        },
        CallHandler { spine },
    )
}

/// The end of a call that started it.
#[derive(Clone)]
pub(crate) struct CallInitiator {
    spine: Arc<CallSpine>,
}

impl CallInitiator {
    pub(crate) fn client_initial_metadata(&self) -> &ClientMetadata {
        &self.spine.client_initial_metadata
    }

    pub(crate) async fn push_message(&self, message: Message) -> Result<(), Status> {
        self.spine
            .push_to(&self.spine.client_to_server, message)
            .await
    }

    /// Half-close: no more client messages.
    pub(crate) fn finish_sends(&self) {
        self.spine.client_to_server.close();
    }

    /// Server initial metadata; `None` means the server answered trailers-only.
    pub(crate) async fn pull_server_initial_metadata(&self) -> Option<MetadataMap> {
        self.spine.server_initial_metadata.wait().await
    }

    pub(crate) async fn pull_message(&self) -> Result<Option<Message>, Status> {
        self.spine.pull_from(&self.spine.server_to_client).await
    }

    pub(crate) fn server_messages_finished(&self) -> bool {
        self.spine.server_to_client.is_finished()
    }

    pub(crate) async fn pull_trailing_metadata(&self) -> TrailingMetadata {
        self.spine.server_trailing_metadata.wait().await
    }

    pub(crate) fn trailing_metadata(&self) -> Option<TrailingMetadata> {
        self.spine.server_trailing_metadata.get()
    }

    pub(crate) fn cancel(&self, status: Status) -> bool {
        self.spine.cancel(status)
    }

    // Used by the server-side driver when the remote client cancels.
    pub(crate) fn cancel_from_remote(&self, status: &Status) -> bool {
        self.spine.finish(TrailingMetadata::cancelled(status))
    }
}

/// The end of a call that answers it.
#[derive(Clone)]
pub(crate) struct CallHandler {
    spine: Arc<CallSpine>,
}

impl CallHandler {
    pub(crate) fn client_initial_metadata(&self) -> &ClientMetadata {
        &self.spine.client_initial_metadata
    }

    pub(crate) async fn pull_message(&self) -> Result<Option<Message>, Status> {
        self.spine.pull_from(&self.spine.client_to_server).await
    }

    pub(crate) fn client_messages_finished(&self) -> bool {
        self.spine.client_to_server.is_finished()
    }

    /// Returns false if initial metadata (or the end of the call) was already recorded.
    pub(crate) fn push_server_initial_metadata(&self, metadata: MetadataMap) -> bool {
        self.spine.server_initial_metadata.set(Some(metadata))
    }

    pub(crate) async fn push_message(&self, message: Message) -> Result<(), Status> {
        self.spine
            .push_to(&self.spine.server_to_client, message)
            .await
    }

    /// Returns false if the call had already ended.
    pub(crate) fn push_trailing_metadata(&self, trailing: TrailingMetadata) -> bool {
        self.spine.finish(trailing)
    }

    pub(crate) async fn pull_trailing_metadata(&self) -> TrailingMetadata {
        self.spine.server_trailing_metadata.wait().await
    }

    /// Resolves once the call has ended; true if it ended by cancellation.
    pub(crate) async fn was_cancelled(&self) -> bool {
        self.spine.server_trailing_metadata.wait().await.was_cancelled
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.spine.server_trailing_metadata.is_set()
    }

    pub(crate) fn trailing_metadata(&self) -> Option<TrailingMetadata> {
        self.spine.server_trailing_metadata.get()
    }

    pub(crate) fn cancel(&self, status: Status) -> bool {
        self.spine.cancel(status)
    }

    /// Resolves with the status of a cancellation raised on this side.
    /// Returns `None` if the call ended any other way.
    pub(crate) async fn local_cancellation(&self) -> Option<Status> {
        local_cancellation(&self.spine).await
    }

    // Used by the client-side driver, which plays the handler role on behalf of the remote server.
    pub(crate) fn cancel_from_remote(&self, status: &Status) -> bool {
        self.spine.finish(TrailingMetadata::cancelled(status))
    }
}

async fn local_cancellation(spine: &CallSpine) -> Option<Status> {
    tokio::select! {
        biased;
        status = spine.local_cancel.wait() => Some(status),
        _ = spine.server_trailing_metadata.wait() => {
            // A local cancel sets its latch before the trailing metadata.
            spine.local_cancel.get()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn call() -> (CallInitiator, CallHandler) {
        new_call(ClientMetadata::new("/test.Service/Method"))
    }

    #[tokio::test]
    async fn test_messages_then_half_close() {
        let (initiator, handler) = call();
        initiator.push_message(Message::new("a")).await.unwrap();
        initiator.finish_sends();

        let first = handler.pull_message().await.unwrap();
        assert_eq!(first, Some(Message::new("a")));
        assert_eq!(handler.pull_message().await.unwrap(), None);
        assert!(handler.client_messages_finished());
    }

    #[tokio::test]
    async fn test_trailers_only_resolves_initial_metadata() {
        let (initiator, handler) = call();
        assert!(handler.push_trailing_metadata(TrailingMetadata::ok()));
        assert!(initiator.pull_server_initial_metadata().await.is_none());
        assert!(initiator.pull_trailing_metadata().await.is_ok());
        assert_eq!(initiator.pull_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_terminal_status_wins() {
        let (initiator, handler) = call();
        assert!(initiator.cancel(Status::deadline_exceeded("timeout")));
        assert!(!initiator.cancel(Status::cancelled("app")));
        assert!(!handler.push_trailing_metadata(TrailingMetadata::ok()));

        let trailing = initiator.pull_trailing_metadata().await;
        assert_eq!(trailing.code, Code::DeadlineExceeded);
        assert!(trailing.was_cancelled);
        assert!(handler.was_cancelled().await);
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_pull() {
        let (initiator, handler) = call();
        let puller = tokio::spawn(async move { handler.pull_message().await });
        tokio::task::yield_now().await;
        initiator.cancel(Status::cancelled("stop"));
        let result = puller.await.unwrap();
        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_local_cancellation_distinguishes_remote_end() {
        let (initiator, handler) = call();
        initiator.cancel_from_remote(&Status::cancelled("peer"));
        assert!(handler.local_cancellation().await.is_none());

        let (initiator, handler) = call();
        initiator.cancel(Status::cancelled("mine"));
        let status = handler.local_cancellation().await.unwrap();
        assert_eq!(status.message(), "mine");
    }

    #[tokio::test]
    async fn test_push_after_finish_fails() {
        let (initiator, handler) = call();
        handler.push_trailing_metadata(TrailingMetadata::new(Code::Internal, "boom"));
        let err = initiator.push_message(Message::new("late")).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
