use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::call::ServerCall;
use crate::completion_queue::{CompletionQueue, Tag};
use crate::sync::OutParam;

/// Method, host and deadline of a call delivered through `request_call`.
#[derive(Debug, Clone, Default)]
pub struct CallDetails {
    pub method: String,
    pub host: String,
    pub deadline: Option<Instant>,
}

/// Out-parameters of `request_call`, filled before the tag is notified.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub call: OutParam<ServerCall>,
    pub initial_metadata: OutParam<MetadataMap>,
    pub details: OutParam<CallDetails>,
}

impl CallRequest {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Out-parameters of `request_registered_call`.
///
/// `payload` must be present exactly when the method was registered to read
/// the initial payload.
#[derive(Debug, Clone, Default)]
pub struct RegisteredCallRequest {
    pub call: OutParam<ServerCall>,
    pub initial_metadata: OutParam<MetadataMap>,
    pub deadline: OutParam<Option<Instant>>,
    pub payload: Option<OutParam<Option<Bytes>>>,
}

impl RegisteredCallRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload() -> Self {
        Self {
            payload: Some(OutParam::new()),
            ..Self::default()
        }
    }
}

enum Outputs {
    Unregistered(CallRequest),
    Registered(RegisteredCallRequest),
}

/// An application's posted intent to receive the next call.
///
/// Consumed exactly once: by [`complete`](Self::complete) on a match, or by
/// [`fail`](Self::fail). Dropping it unconsumed fails the tag with a
/// cancellation, so the completion queue is never left waiting.
pub(crate) struct RequestedCall {
    tag: Tag,
    cq: Option<Arc<CompletionQueue>>,
    outputs: Outputs,
}

impl RequestedCall {
    /// The tag must already be reserved on `cq`.
    pub(crate) fn unregistered(cq: &Arc<CompletionQueue>, tag: Tag, request: &CallRequest) -> Self {
        Self {
            tag,
            cq: Some(Arc::clone(cq)),
            outputs: Outputs::Unregistered(request.clone()),
        }
    }

    /// The tag must already be reserved on `cq`.
    pub(crate) fn registered(
        cq: &Arc<CompletionQueue>,
        tag: Tag,
        request: &RegisteredCallRequest,
    ) -> Self {
        Self {
            tag,
            cq: Some(Arc::clone(cq)),
            outputs: Outputs::Registered(request.clone()),
        }
    }

    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    /// Hand `call` to the application and notify the tag.
    pub(crate) fn complete(mut self, call: ServerCall, payload: Option<Bytes>) {
        match &self.outputs {
            Outputs::Unregistered(request) => {
                request.details.set(CallDetails {
                    method: call.method().to_string(),
                    host: call.host().unwrap_or_default().to_string(),
                    deadline: call.deadline(),
                });
                request.initial_metadata.set(call.client_metadata().clone());
                request.call.set(call);
            }
            Outputs::Registered(request) => {
                request.deadline.set(call.deadline());
                if let Some(out) = &request.payload {
                    out.set(payload);
                }
                request.initial_metadata.set(call.client_metadata().clone());
                request.call.set(call);
            }
        }
        if let Some(cq) = self.cq.take() {
            cq.end_op(self.tag, Ok(()));
        }
    }

    pub(crate) fn fail(mut self, status: Status) {
        if let Some(cq) = self.cq.take() {
            cq.end_op(self.tag, Err(status));
        }
    }
}

impl Drop for RequestedCall {
    fn drop(&mut self) {
        if let Some(cq) = self.cq.take() {
            tracing::debug!(tag = %self.tag, "Requested call dropped without a match");
            cq.end_op(self.tag, Err(Status::cancelled("requested call dropped")));
        }
    }
}

impl fmt::Debug for RequestedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestedCall")
            .field("tag", &self.tag)
            .field("registered", &matches!(self.outputs, Outputs::Registered(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClientMetadata;
    use crate::party::Party;
    use crate::spine::new_call;
    use tonic::Code;

    fn server_call(path: &str, authority: &str) -> ServerCall {
        let mut metadata = ClientMetadata::new(path);
        metadata.authority = Some(authority.to_string());
        let (_initiator, handler) = new_call(metadata);
        ServerCall::new(handler, Party::new("rc-test"), String::new(), 16)
    }

    #[tokio::test]
    async fn test_complete_fills_details() {
        let cq = CompletionQueue::new();
        assert!(cq.begin_op(Tag(1)));
        let request = CallRequest::new();
        let rc = RequestedCall::unregistered(&cq, Tag(1), &request);

        rc.complete(server_call("/svc.S/M", "example.com"), None);
        assert!(cq.try_next().unwrap().is_ok());
        let details = request.details.take().unwrap();
        assert_eq!(details.method, "/svc.S/M");
        assert_eq!(details.host, "example.com");
        assert!(request.call.take().is_some());
        assert!(request.initial_metadata.is_set());
    }

    #[tokio::test]
    async fn test_registered_payload_is_delivered() {
        let cq = CompletionQueue::new();
        assert!(cq.begin_op(Tag(1)));
        let request = RegisteredCallRequest::with_payload();
        let rc = RequestedCall::registered(&cq, Tag(1), &request);

        rc.complete(
            server_call("/svc.S/M", "h"),
            Some(Bytes::from_static(b"payload")),
        );
        assert!(cq.try_next().unwrap().is_ok());
        let payload = request.payload.as_ref().unwrap().take().unwrap();
        assert_eq!(payload, Some(Bytes::from_static(b"payload")));
    }

    #[test]
    fn test_drop_fails_with_cancellation() {
        let cq = CompletionQueue::new();
        assert!(cq.begin_op(Tag(5)));
        drop(RequestedCall::unregistered(&cq, Tag(5), &CallRequest::new()));

        let event = cq.try_next().unwrap();
        assert_eq!(event.tag, Tag(5));
        assert_eq!(event.result.unwrap_err().code(), Code::Cancelled);
    }

    #[test]
    fn test_fail_delivers_status_once() {
        let cq = CompletionQueue::new();
        assert!(cq.begin_op(Tag(2)));
        RequestedCall::unregistered(&cq, Tag(2), &CallRequest::new())
            .fail(Status::unavailable("shutdown"));
        assert_eq!(
            cq.try_next().unwrap().result.unwrap_err().code(),
            Code::Unavailable
        );
        assert!(cq.try_next().is_none());
    }
}
