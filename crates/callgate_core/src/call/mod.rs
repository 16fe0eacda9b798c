//! Application-facing calls and the state they share.

mod batch;
mod client;
mod receiver;
mod server;

pub use batch::{
    OpKind, OpType, Operation, INITIAL_METADATA_CORKED, INITIAL_METADATA_USED_MASK,
    INITIAL_METADATA_WAIT_FOR_READY, INITIAL_METADATA_WAIT_FOR_READY_EXPLICITLY_SET,
    WRITE_BUFFER_HINT, WRITE_NO_COMPRESS, WRITE_THROUGH, WRITE_USED_MASK,
};
pub use client::ClientCall;
pub use receiver::MessageReceiver;
pub use server::ServerCall;

pub(crate) use batch::{BatchCompletion, Direction, ValidatedBatch, validate};
pub(crate) use client::ClientCallSetup;

use std::sync::Weak;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::Status;
use uuid::Uuid;

/// Something a deadline timer or a parent call can cancel.
pub(crate) trait CancelHandle: Send + Sync {
    fn cancel_with_status(&self, status: Status);
}

#[derive(Default)]
struct DeadlineState {
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// State common to client and server calls.
pub(crate) struct CallCommon {
    id: Uuid,
    is_client: bool,
    deadline: Mutex<DeadlineState>,
    peer: Mutex<String>,
}

impl CallCommon {
    pub(crate) fn new(is_client: bool, peer: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            is_client,
            deadline: Mutex::new(DeadlineState::default()),
            peer: Mutex::new(peer),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline.lock().deadline
    }

    /// Arm (or re-arm) the deadline timer. On expiry `call` is cancelled
    /// with `DEADLINE_EXCEEDED`, the same path as an application cancel.
    pub(crate) fn arm_deadline(&self, deadline: Instant, call: Weak<dyn CancelHandle>) {
        let id = self.id;
        let is_client = self.is_client;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(call) = call.upgrade() {
                tracing::debug!(call_id = %id, is_client, "Deadline exceeded");
                call.cancel_with_status(Status::deadline_exceeded("Deadline Exceeded"));
            }
        });

        let mut state = self.deadline.lock();
        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
        state.deadline = Some(deadline);
    }

    /// Disarm the deadline timer once the call has reached its end.
    pub(crate) fn reset_deadline(&self) {
        let mut state = self.deadline.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn peer(&self) -> String {
        self.peer.lock().clone()
    }

    pub(crate) fn set_peer(&self, peer: impl Into<String>) {
        *self.peer.lock() = peer.into();
    }
}

impl Drop for CallCommon {
    fn drop(&mut self) {
        if let Some(timer) = self.deadline.get_mut().timer.take() {
            timer.abort();
        }
    }
}
