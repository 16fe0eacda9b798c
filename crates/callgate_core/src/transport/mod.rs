//! The transport seam.
//!
//! A transport accepts physical stream operations and completes each one
//! exactly once. Framing, encryption and flow control live behind this trait.

mod batch_builder;
mod connected;
pub mod loopback;

#[cfg(test)]
pub(crate) mod recording;

pub(crate) use batch_builder::{BatchBuilder, Target};
pub(crate) use connected::{spawn_client_stream, spawn_server_stream};

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::metadata::{ClientMetadata, Message, TrailingMetadata};

/// Identifies one stream on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Initial metadata as carried on a stream.
#[derive(Debug, Clone)]
pub enum InitialMetadata {
    Client(ClientMetadata),
    Server(MetadataMap),
}

/// One physical stream operation. Any combination of parts may be present.
#[derive(Debug, Clone, Default)]
pub struct StreamOp {
    pub send_initial_metadata: Option<InitialMetadata>,
    pub send_message: Option<Message>,
    /// On a client stream this is the half-close; on a server stream the status.
    pub send_trailing_metadata: Option<TrailingMetadata>,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
    pub cancel: Option<Status>,
}

impl StreamOp {
    pub fn is_empty(&self) -> bool {
        self.send_initial_metadata.is_none()
            && self.send_message.is_none()
            && self.send_trailing_metadata.is_none()
            && !self.recv_initial_metadata
            && !self.recv_message
            && !self.recv_trailing_metadata
            && self.cancel.is_none()
    }

    pub fn has_sends(&self) -> bool {
        self.send_initial_metadata.is_some()
            || self.send_message.is_some()
            || self.send_trailing_metadata.is_some()
    }
}

/// What the transport hands back when a stream operation completes.
#[derive(Debug, Default)]
pub struct StreamOpResults {
    pub initial_metadata: Option<InitialMetadata>,
    /// `None` at end of stream.
    pub message: Option<Message>,
    pub trailing_metadata: Option<TrailingMetadata>,
    /// Whether trailing metadata was actually written to the peer.
    pub trailing_metadata_sent: bool,
}

/// The independently completing parts of a [`StreamOp`].
///
/// Sends complete once they are written, each receive once its data is
/// available. A receive must never wait for sends of the same op, nor the
/// other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPart {
    /// All send parts, or the cancellation.
    Sends,
    RecvInitialMetadata,
    RecvMessage,
    RecvTrailingMetadata,
}

impl OpPart {
    pub const ALL: [OpPart; 4] = [
        OpPart::Sends,
        OpPart::RecvInitialMetadata,
        OpPart::RecvMessage,
        OpPart::RecvTrailingMetadata,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Whether `op` carries this part. An empty op still has a send part so
    /// that it completes.
    pub fn present_in(self, op: &StreamOp) -> bool {
        match self {
            OpPart::Sends => op.has_sends() || op.cancel.is_some() || op.is_empty(),
            OpPart::RecvInitialMetadata => op.recv_initial_metadata,
            OpPart::RecvMessage => op.recv_message,
            OpPart::RecvTrailingMetadata => op.recv_trailing_metadata,
        }
    }

    /// Keep only the fields of `results` that belong to this part.
    fn select(self, results: &mut StreamOpResults) -> StreamOpResults {
        match self {
            OpPart::Sends => StreamOpResults {
                trailing_metadata_sent: results.trailing_metadata_sent,
                ..Default::default()
            },
            OpPart::RecvInitialMetadata => StreamOpResults {
                initial_metadata: results.initial_metadata.take(),
                ..Default::default()
            },
            OpPart::RecvMessage => StreamOpResults {
                message: results.message.take(),
                ..Default::default()
            },
            OpPart::RecvTrailingMetadata => StreamOpResults {
                trailing_metadata: results.trailing_metadata.take(),
                ..Default::default()
            },
        }
    }
}

pub(crate) type PartReceiver = oneshot::Receiver<Result<StreamOpResults, Status>>;

/// The completion of one [`OpPart`].
///
/// Dropping it without completing reports a cancellation.
pub struct PartCompletion {
    tx: Option<oneshot::Sender<Result<StreamOpResults, Status>>>,
}

impl PartCompletion {
    pub fn complete(mut self, result: Result<StreamOpResults, Status>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for PartCompletion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Status::cancelled("stream operation dropped by transport")));
        }
    }
}

/// The completions of every part of a [`StreamOp`].
///
/// Each part completes exactly once: through [`complete_part`],
/// [`complete`], a [`PartCompletion`] taken out with [`take_part`], or with a
/// cancellation when dropped.
///
/// [`complete_part`]: Self::complete_part
/// [`complete`]: Self::complete
/// [`take_part`]: Self::take_part
pub struct OpCompletion {
    parts: [Option<PartCompletion>; 4],
}

impl OpCompletion {
    pub(crate) fn new(op: &StreamOp) -> (Self, Vec<(OpPart, PartReceiver)>) {
        let mut completion = Self {
            parts: [None, None, None, None],
        };
        let mut receivers = Vec::new();
        for part in OpPart::ALL {
            if part.present_in(op) {
                let (tx, rx) = oneshot::channel();
                completion.parts[part.index()] = Some(PartCompletion { tx: Some(tx) });
                receivers.push((part, rx));
            }
        }
        (completion, receivers)
    }

    /// Detach one part so it can be completed elsewhere.
    pub fn take_part(&mut self, part: OpPart) -> Option<PartCompletion> {
        self.parts[part.index()].take()
    }

    pub fn complete_part(&mut self, part: OpPart, result: Result<StreamOpResults, Status>) {
        if let Some(completion) = self.take_part(part) {
            completion.complete(result);
        }
    }

    /// Complete every part not completed yet, each with its share of `result`.
    pub fn complete(mut self, result: Result<StreamOpResults, Status>) {
        self.complete_remaining(result);
    }

    pub(crate) fn complete_remaining(&mut self, result: Result<StreamOpResults, Status>) {
        match result {
            Ok(mut results) => {
                for part in OpPart::ALL {
                    let share = part.select(&mut results);
                    self.complete_part(part, Ok(share));
                }
            }
            Err(status) => {
                for part in OpPart::ALL {
                    self.complete_part(part, Err(status.clone()));
                }
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.parts.iter().any(Option::is_some)
    }
}

impl fmt::Debug for OpCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: Vec<_> = OpPart::ALL
            .into_iter()
            .filter(|part| self.parts[part.index()].is_some())
            .collect();
        f.debug_struct("OpCompletion")
            .field("pending", &pending)
            .finish()
    }
}

/// Wait for every part and fold the results back into one.
#[cfg(test)]
pub(crate) async fn join_parts(
    receivers: Vec<(OpPart, PartReceiver)>,
) -> Result<StreamOpResults, Status> {
    let mut joined = StreamOpResults::default();
    for (part, rx) in receivers {
        let mut results = rx
            .await
            .unwrap_or_else(|_| Err(Status::cancelled("completion lost")))?;
        match part {
            OpPart::Sends => joined.trailing_metadata_sent = results.trailing_metadata_sent,
            OpPart::RecvInitialMetadata => joined.initial_metadata = results.initial_metadata.take(),
            OpPart::RecvMessage => joined.message = results.message.take(),
            OpPart::RecvTrailingMetadata => {
                joined.trailing_metadata = results.trailing_metadata.take()
            }
        }
    }
    Ok(joined)
}

/// The transport interface consumed by the call engine.
pub trait Transport: Send + Sync + 'static {
    /// Submit a stream operation. Every part of `on_complete` must be
    /// completed (or dropped) exactly once.
    fn perform_stream_op(&self, stream: StreamId, op: StreamOp, on_complete: OpCompletion);

    /// Whether several logical operations may share one physical operation.
    fn supports_coalescing(&self) -> bool {
        true
    }

    /// Address of the remote peer.
    fn peer(&self) -> String {
        String::new()
    }
}

/// A transport on which new outgoing streams can be opened.
pub trait ClientTransport: Transport {
    fn open_stream(&self) -> Result<StreamId, Status>;
}

/// A transport shared between calls.
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_op() -> StreamOp {
        StreamOp {
            send_message: Some(Message::new("x")),
            recv_message: true,
            recv_trailing_metadata: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_cancellation() {
        let (completion, receivers) = OpCompletion::new(&recv_op());
        assert_eq!(receivers.len(), 3);
        drop(completion);
        for (_, rx) in receivers {
            assert_eq!(rx.await.unwrap().unwrap_err().code(), tonic::Code::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_parts_complete_independently() {
        let (mut completion, mut receivers) = OpCompletion::new(&recv_op());
        completion.complete_part(
            OpPart::Sends,
            Ok(StreamOpResults {
                trailing_metadata_sent: true,
                ..Default::default()
            }),
        );
        let (part, sends) = receivers.remove(0);
        assert_eq!(part, OpPart::Sends);
        assert!(sends.await.unwrap().unwrap().trailing_metadata_sent);
        assert!(completion.is_pending());

        completion.complete(Ok(StreamOpResults {
            message: Some(Message::new("m")),
            trailing_metadata: Some(TrailingMetadata::ok()),
            ..Default::default()
        }));
        let joined = join_parts(receivers).await.unwrap();
        assert_eq!(joined.message, Some(Message::new("m")));
        assert!(joined.trailing_metadata.unwrap().is_ok());
    }

    #[test]
    fn test_empty_op_still_completes() {
        let (completion, receivers) = OpCompletion::new(&StreamOp::default());
        assert_eq!(receivers.len(), 1);
        assert_eq!(receivers[0].0, OpPart::Sends);
        assert!(completion.is_pending());
    }

    #[test]
    fn test_stream_op_parts() {
        let op = StreamOp::default();
        assert!(op.is_empty());
        let op = StreamOp {
            recv_message: true,
            ..Default::default()
        };
        assert!(!op.is_empty());
        assert!(!op.has_sends());
    }
}
