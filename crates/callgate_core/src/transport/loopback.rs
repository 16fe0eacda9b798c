//! An in-process transport connecting a client and a server directly.
//!
//! Sends are applied to the shared stream state as soon as an op arrives.
//! Receives complete once everything they ask for is available.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tonic::Status;

use crate::metadata::{Message, TrailingMetadata};
use crate::transport::{
    ClientTransport, InitialMetadata, OpCompletion, OpPart, StreamId, StreamOp, StreamOpResults,
    Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Debug, Default)]
struct Half {
    initial_metadata: Option<InitialMetadata>,
    messages: VecDeque<Message>,
    trailing_metadata: Option<TrailingMetadata>,
}

#[derive(Debug, Default)]
struct StreamState {
    to_server: Half,
    to_client: Half,
    cancelled: Option<Status>,
}

#[derive(Debug, Clone, Copy)]
struct Receives {
    initial_metadata: bool,
    message: bool,
    trailing_metadata: bool,
}

impl Receives {
    /// The receive carried by `part`, `None` for sends.
    fn only(part: OpPart) -> Option<Self> {
        let none = Self {
            initial_metadata: false,
            message: false,
            trailing_metadata: false,
        };
        match part {
            OpPart::Sends => None,
            OpPart::RecvInitialMetadata => Some(Self {
                initial_metadata: true,
                ..none
            }),
            OpPart::RecvMessage => Some(Self {
                message: true,
                ..none
            }),
            OpPart::RecvTrailingMetadata => Some(Self {
                trailing_metadata: true,
                ..none
            }),
        }
    }
}

impl StreamState {
    /// The server has sent its status; nothing more flows in either direction.
    fn finished(&self) -> bool {
        self.to_client.trailing_metadata.is_some()
    }

    fn outgoing(&mut self, side: Side) -> &mut Half {
        match side {
            Side::Client => &mut self.to_server,
            Side::Server => &mut self.to_client,
        }
    }

    fn incoming(&mut self, side: Side) -> &mut Half {
        match side {
            Side::Client => &mut self.to_client,
            Side::Server => &mut self.to_server,
        }
    }

    fn try_receive(
        &mut self,
        side: Side,
        wants: Receives,
    ) -> Result<Option<StreamOpResults>, Status> {
        if let Some(status) = &self.cancelled {
            return Err(status.clone());
        }
        let finished = self.finished();
        let incoming = self.incoming(side);
        let closed = finished || incoming.trailing_metadata.is_some();

        let initial_ready = incoming.initial_metadata.is_some() || closed;
        let message_ready = !incoming.messages.is_empty() || closed;
        let trailing_ready = match side {
            Side::Client => incoming.trailing_metadata.is_some(),
            Side::Server => finished,
        };
        if (wants.initial_metadata && !initial_ready)
            || (wants.message && !message_ready)
            || (wants.trailing_metadata && !trailing_ready)
        {
            return Ok(None);
        }

        Ok(Some(StreamOpResults {
            initial_metadata: wants
                .initial_metadata
                .then(|| incoming.initial_metadata.clone())
                .flatten(),
            message: wants
                .message
                .then(|| incoming.messages.pop_front())
                .flatten(),
            trailing_metadata: wants.trailing_metadata.then(|| {
                incoming
                    .trailing_metadata
                    .clone()
                    .unwrap_or_else(TrailingMetadata::ok)
            }),
            trailing_metadata_sent: false,
        }))
    }
}

#[derive(Debug, Default)]
struct LoopbackStream {
    state: Mutex<StreamState>,
    notify: Notify,
}

impl LoopbackStream {
    async fn receive(&self, side: Side, wants: Receives) -> Result<StreamOpResults, Status> {
        loop {
            let notified = self.notify.notified();
            if let Some(results) = self.state.lock().try_receive(side, wants)? {
                return Ok(results);
            }
            notified.await;
        }
    }
}

struct Shared {
    streams: Mutex<HashMap<StreamId, Arc<LoopbackStream>>>,
    next_stream: AtomicU64,
    incoming: mpsc::UnboundedSender<StreamId>,
}

impl Shared {
    fn stream(&self, id: StreamId) -> Option<Arc<LoopbackStream>> {
        self.streams.lock().get(&id).cloned()
    }

    fn forget(&self, id: StreamId) {
        self.streams.lock().remove(&id);
    }
}

/// One end of a loopback connection.
pub struct LoopbackTransport {
    side: Side,
    shared: Arc<Shared>,
}

/// Create a connected pair of transports.
///
/// Returns the client end, the server end, and the receiver on which the
/// server learns about new streams opened by the client.
pub fn loopback_pair() -> (
    Arc<LoopbackTransport>,
    Arc<LoopbackTransport>,
    mpsc::UnboundedReceiver<StreamId>,
) {
    let (incoming, incoming_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        streams: Mutex::new(HashMap::new()),
        next_stream: AtomicU64::new(1),
        incoming,
    });
    let client = Arc::new(LoopbackTransport {
        side: Side::Client,
        shared: Arc::clone(&shared),
    });
    let server = Arc::new(LoopbackTransport {
        side: Side::Server,
        shared,
    });
    (client, server, incoming_rx)
}

impl LoopbackTransport {
    /// Fail every open stream as if the connection had dropped.
    pub fn disconnect(&self) {
        let streams: Vec<_> = self.shared.streams.lock().drain().collect();
        tracing::debug!(streams = streams.len(), "Loopback transport disconnected");
        for (_, stream) in streams {
            {
                let mut state = stream.state.lock();
                if !state.finished() && state.cancelled.is_none() {
                    state.cancelled = Some(Status::unavailable("transport disconnected"));
                }
            }
            stream.notify.notify_waiters();
        }
    }

    /// Number of streams still tracked by the connection.
    pub fn open_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }
}

impl Transport for LoopbackTransport {
    fn perform_stream_op(&self, id: StreamId, op: StreamOp, mut on_complete: OpCompletion) {
        let Some(stream) = self.shared.stream(id) else {
            on_complete.complete(Err(Status::cancelled(format!("{id} is closed"))));
            return;
        };

        let StreamOp {
            send_initial_metadata,
            send_message,
            send_trailing_metadata,
            cancel,
            ..
        } = op;

        if let Some(status) = cancel {
            {
                let mut state = stream.state.lock();
                if !state.finished() && state.cancelled.is_none() {
                    tracing::debug!(stream = %id, side = ?self.side, code = ?status.code(), "Loopback stream cancelled");
                    state.cancelled = Some(status);
                }
            }
            stream.notify.notify_waiters();
            on_complete.complete(Ok(StreamOpResults::default()));
            return;
        }

        let mut announce = false;
        let trailing_metadata_sent = {
            let mut state = stream.state.lock();
            if let Some(status) = state.cancelled.clone() {
                drop(state);
                if self.side == Side::Client {
                    self.shared.forget(id);
                }
                on_complete.complete(Err(status));
                return;
            }
            let outgoing = state.outgoing(self.side);
            if let Some(metadata) = send_initial_metadata {
                announce = self.side == Side::Client;
                outgoing.initial_metadata = Some(metadata);
            }
            if let Some(message) = send_message {
                outgoing.messages.push_back(message);
            }
            match send_trailing_metadata {
                Some(trailing) => {
                    outgoing.trailing_metadata = Some(trailing);
                    true
                }
                None => false,
            }
        };
        if announce && self.shared.incoming.send(id).is_err() {
            tracing::warn!(stream = %id, "No server listening on loopback transport");
        }
        stream.notify.notify_waiters();

        on_complete.complete_part(
            OpPart::Sends,
            Ok(StreamOpResults {
                trailing_metadata_sent,
                ..Default::default()
            }),
        );

        // Each receive completes on its own, as soon as its data is there.
        for part in OpPart::ALL {
            let Some(wants) = Receives::only(part) else {
                continue;
            };
            let Some(completion) = on_complete.take_part(part) else {
                continue;
            };
            let side = self.side;
            let stream = Arc::clone(&stream);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let result = stream.receive(side, wants).await;
                // The client observing the end is the last thing to happen on a stream.
                if side == Side::Client
                    && (part == OpPart::RecvTrailingMetadata || result.is_err())
                {
                    shared.forget(id);
                }
                completion.complete(result);
            });
        }
    }

    fn peer(&self) -> String {
        match self.side {
            Side::Client => "loopback:server".to_string(),
            Side::Server => "loopback:client".to_string(),
        }
    }
}

impl ClientTransport for LoopbackTransport {
    fn open_stream(&self) -> Result<StreamId, Status> {
        if self.side != Side::Client {
            return Err(Status::failed_precondition(
                "streams are opened from the client end",
            ));
        }
        let id = StreamId(self.shared.next_stream.fetch_add(1, Ordering::Relaxed));
        self.shared
            .streams
            .lock()
            .insert(id, Arc::new(LoopbackStream::default()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClientMetadata;
    use crate::transport::join_parts;
    use std::future::Future;
    use tonic::Code;
    use tonic::metadata::MetadataMap;

    fn submit(
        transport: &LoopbackTransport,
        id: StreamId,
        op: StreamOp,
    ) -> impl Future<Output = Result<StreamOpResults, Status>> + use<> {
        let (completion, receivers) = OpCompletion::new(&op);
        transport.perform_stream_op(id, op, completion);
        join_parts(receivers)
    }

    async fn perform(
        transport: &LoopbackTransport,
        id: StreamId,
        op: StreamOp,
    ) -> Result<StreamOpResults, Status> {
        submit(transport, id, op).await
    }

    #[tokio::test]
    async fn test_request_response() {
        let (client, server, mut incoming) = loopback_pair();
        let id = client.open_stream().unwrap();

        perform(
            &client,
            id,
            StreamOp {
                send_initial_metadata: Some(InitialMetadata::Client(ClientMetadata::new("/a.B/C"))),
                send_message: Some(Message::new("ping")),
                send_trailing_metadata: Some(TrailingMetadata::ok()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(incoming.recv().await, Some(id));

        let received = perform(
            &server,
            id,
            StreamOp {
                recv_initial_metadata: true,
                recv_message: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(matches!(received.initial_metadata, Some(InitialMetadata::Client(_))));
        assert_eq!(received.message, Some(Message::new("ping")));

        let sent = perform(
            &server,
            id,
            StreamOp {
                send_initial_metadata: Some(InitialMetadata::Server(MetadataMap::new())),
                send_message: Some(Message::new("pong")),
                send_trailing_metadata: Some(TrailingMetadata::ok()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(sent.trailing_metadata_sent);

        let answer = perform(
            &client,
            id,
            StreamOp {
                recv_message: true,
                recv_trailing_metadata: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(answer.message, Some(Message::new("pong")));
        assert!(answer.trailing_metadata.unwrap().is_ok());
        assert_eq!(client.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_trailers_only_resolves_initial_metadata_as_none() {
        let (client, server, _incoming) = loopback_pair();
        let id = client.open_stream().unwrap();

        perform(
            &server,
            id,
            StreamOp {
                send_trailing_metadata: Some(TrailingMetadata::new(Code::Unimplemented, "")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let answer = perform(
            &client,
            id,
            StreamOp {
                recv_initial_metadata: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(answer.initial_metadata.is_none());
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_receives() {
        let (client, server, _incoming) = loopback_pair();
        let id = client.open_stream().unwrap();

        let close = submit(
            &server,
            id,
            StreamOp {
                recv_trailing_metadata: true,
                ..Default::default()
            },
        );
        perform(
            &client,
            id,
            StreamOp {
                cancel: Some(Status::cancelled("bye")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = close.await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(err.message(), "bye");
    }

    #[tokio::test]
    async fn test_disconnect_reports_unavailable() {
        let (client, _server, _incoming) = loopback_pair();
        let id = client.open_stream().unwrap();

        let initial = submit(
            &client,
            id,
            StreamOp {
                recv_initial_metadata: true,
                ..Default::default()
            },
        );
        client.disconnect();
        assert_eq!(initial.await.unwrap_err().code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_sends_complete_before_receives() {
        let (client, server, _incoming) = loopback_pair();
        let id = client.open_stream().unwrap();

        let op = StreamOp {
            send_initial_metadata: Some(InitialMetadata::Client(ClientMetadata::new("/a.B/C"))),
            recv_initial_metadata: true,
            ..Default::default()
        };
        let (completion, mut receivers) = OpCompletion::new(&op);
        client.perform_stream_op(id, op, completion);
        let (part, sends) = receivers.remove(0);
        assert_eq!(part, OpPart::Sends);
        sends.await.unwrap().unwrap();

        perform(
            &server,
            id,
            StreamOp {
                send_initial_metadata: Some(InitialMetadata::Server(MetadataMap::new())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let answer = join_parts(receivers).await.unwrap();
        assert!(matches!(answer.initial_metadata, Some(InitialMetadata::Server(_))));
    }
}
