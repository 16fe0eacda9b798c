use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Status;

use crate::call::ServerCall;
use crate::server::requested_call::RequestedCall;

const NOT_STARTED: u8 = 0;
const PENDING: u8 = 1;
const ACTIVATED: u8 = 2;
const ZOMBIED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    NotStarted,
    Pending,
    Activated,
    Zombied,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            NOT_STARTED => CallState::NotStarted,
            PENDING => CallState::Pending,
            ACTIVATED => CallState::Activated,
            _ => CallState::Zombied,
        }
    }
}

/// An arrived call parked until an application request takes it.
///
/// Transitions: `NotStarted -> Pending -> Activated`, `NotStarted -> Activated`,
/// and `NotStarted | Pending -> Zombied`. `Activated` and `Zombied` are final.
pub(crate) struct CallData {
    state: AtomicU8,
    call: Mutex<Option<(ServerCall, Option<Bytes>)>>,
}

impl CallData {
    pub(crate) fn new(call: ServerCall, payload: Option<Bytes>) -> Self {
        Self {
            state: AtomicU8::new(NOT_STARTED),
            call: Mutex::new(Some((call, payload))),
        }
    }

    pub(crate) fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark the call as waiting in the pending queue.
    pub(crate) fn set_pending(&self) -> bool {
        self.transition(NOT_STARTED, PENDING)
    }

    /// Claim the call for publication. Fails once it was zombied.
    pub(crate) fn maybe_activate(&self) -> bool {
        self.transition(NOT_STARTED, ACTIVATED) || self.transition(PENDING, ACTIVATED)
    }

    /// Cancel a call that will never reach the application.
    ///
    /// Does nothing if the call was already activated.
    pub(crate) fn kill_zombie(&self, status: Status) {
        let zombied = self.transition(NOT_STARTED, ZOMBIED) || self.transition(PENDING, ZOMBIED);
        if !zombied {
            return;
        }
        if let Some((call, _)) = self.call.lock().take() {
            tracing::debug!(call_id = %call.id(), code = ?status.code(), "Killing zombie call");
            call.cancel_with_status(status);
        }
    }

    /// Hand an activated call to `rc`.
    pub(crate) fn publish(&self, rc: RequestedCall) {
        debug_assert_eq!(self.state(), CallState::Activated);
        match self.call.lock().take() {
            Some((call, payload)) => {
                tracing::debug!(call_id = %call.id(), tag = %rc.tag(), "Publishing call");
                rc.complete(call, payload);
            }
            None => rc.fail(Status::internal("call already published")),
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_queue::{CompletionQueue, Tag};
    use crate::metadata::ClientMetadata;
    use crate::party::Party;
    use crate::server::requested_call::CallRequest;
    use crate::spine::{CallInitiator, new_call};
    use tonic::Code;

    fn call_data() -> (CallInitiator, CallData) {
        let (initiator, handler) = new_call(ClientMetadata::new("/svc.S/M"));
        let call = ServerCall::new(handler, Party::new("call-data-test"), String::new(), 16);
        (initiator, CallData::new(call, None))
    }

    #[tokio::test]
    async fn test_pending_then_activated() {
        let (_initiator, data) = call_data();
        assert!(data.set_pending());
        assert!(!data.set_pending());
        assert!(data.maybe_activate());
        assert_eq!(data.state(), CallState::Activated);
        assert!(!data.maybe_activate());
    }

    #[tokio::test]
    async fn test_zombie_cannot_activate() {
        let (initiator, data) = call_data();
        assert!(data.set_pending());
        data.kill_zombie(Status::unavailable("shutdown"));
        assert_eq!(data.state(), CallState::Zombied);
        assert!(!data.maybe_activate());

        let trailing = initiator.pull_trailing_metadata().await;
        assert_eq!(trailing.code, Code::Unavailable);
    }

    #[tokio::test]
    async fn test_activated_call_is_not_killed() {
        let (initiator, data) = call_data();
        assert!(data.maybe_activate());
        data.kill_zombie(Status::unavailable("late"));
        assert_eq!(data.state(), CallState::Activated);
        assert!(initiator.trailing_metadata().is_none());

        let cq = CompletionQueue::new();
        assert!(cq.begin_op(Tag(1)));
        let request = CallRequest::new();
        data.publish(RequestedCall::unregistered(&cq, Tag(1), &request));
        assert!(cq.try_next().unwrap().is_ok());
        assert!(request.call.take().is_some());
    }
}
