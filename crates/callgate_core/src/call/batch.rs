//! The application batch ABI and its validation.

use std::sync::Arc;

use bytes::Bytes;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::completion_queue::{CompletionQueue, Tag};
use crate::error::CallError;
use crate::metadata::{Message, MetadataEntry, TrailingMetadata, validate_metadata};
use crate::sync::OutParam;

/// Hint that the write may be buffered.
pub const WRITE_BUFFER_HINT: u32 = 0x1;
/// Do not compress this message.
pub const WRITE_NO_COMPRESS: u32 = 0x2;
/// Write through to the transport without delay.
pub const WRITE_THROUGH: u32 = 0x4;
/// Every flag valid on `SEND_MESSAGE`.
pub const WRITE_USED_MASK: u32 = WRITE_BUFFER_HINT | WRITE_NO_COMPRESS | WRITE_THROUGH;

pub const INITIAL_METADATA_WAIT_FOR_READY: u32 = 0x20;
pub const INITIAL_METADATA_WAIT_FOR_READY_EXPLICITLY_SET: u32 = 0x40;
pub const INITIAL_METADATA_CORKED: u32 = 0x80;
/// Every flag valid on `SEND_INITIAL_METADATA`.
pub const INITIAL_METADATA_USED_MASK: u32 = INITIAL_METADATA_WAIT_FOR_READY
    | INITIAL_METADATA_WAIT_FOR_READY_EXPLICITLY_SET
    | INITIAL_METADATA_CORKED
    | WRITE_THROUGH;

/// The eight operation types of the batch ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    SendStatusFromServer,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

impl OpType {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Payload of one operation. Receive operations carry the out-parameter
/// the result is written to before the batch's tag is notified.
#[derive(Debug, Clone)]
pub enum OpKind {
    SendInitialMetadata {
        metadata: Vec<MetadataEntry>,
    },
    SendMessage {
        message: Bytes,
    },
    SendCloseFromClient,
    SendStatusFromServer {
        code: Code,
        details: String,
        trailing_metadata: Vec<MetadataEntry>,
    },
    RecvInitialMetadata {
        metadata: OutParam<MetadataMap>,
    },
    /// Receives `None` at end of stream.
    RecvMessage {
        message: OutParam<Option<Bytes>>,
    },
    RecvStatusOnClient {
        status: OutParam<TrailingMetadata>,
    },
    /// Receives whether the call was cancelled.
    RecvCloseOnServer {
        cancelled: OutParam<bool>,
    },
}

/// One entry of an application batch.
#[derive(Debug, Clone)]
pub struct Operation {
    pub flags: u32,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(kind: OpKind) -> Self {
        Self { flags: 0, kind }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn send_initial_metadata(metadata: Vec<MetadataEntry>) -> Self {
        Self::new(OpKind::SendInitialMetadata { metadata })
    }

    pub fn send_message(message: impl Into<Bytes>) -> Self {
        Self::new(OpKind::SendMessage {
            message: message.into(),
        })
    }

    pub fn send_close_from_client() -> Self {
        Self::new(OpKind::SendCloseFromClient)
    }

    pub fn send_status_from_server(code: Code, details: impl Into<String>) -> Self {
        Self::new(OpKind::SendStatusFromServer {
            code,
            details: details.into(),
            trailing_metadata: Vec::new(),
        })
    }

    pub fn recv_initial_metadata(metadata: &OutParam<MetadataMap>) -> Self {
        Self::new(OpKind::RecvInitialMetadata {
            metadata: metadata.clone(),
        })
    }

    pub fn recv_message(message: &OutParam<Option<Bytes>>) -> Self {
        Self::new(OpKind::RecvMessage {
            message: message.clone(),
        })
    }

    pub fn recv_status_on_client(status: &OutParam<TrailingMetadata>) -> Self {
        Self::new(OpKind::RecvStatusOnClient {
            status: status.clone(),
        })
    }

    pub fn recv_close_on_server(cancelled: &OutParam<bool>) -> Self {
        Self::new(OpKind::RecvCloseOnServer {
            cancelled: cancelled.clone(),
        })
    }

    pub fn op_type(&self) -> OpType {
        match &self.kind {
            OpKind::SendInitialMetadata { .. } => OpType::SendInitialMetadata,
            OpKind::SendMessage { .. } => OpType::SendMessage,
            OpKind::SendCloseFromClient => OpType::SendCloseFromClient,
            OpKind::SendStatusFromServer { .. } => OpType::SendStatusFromServer,
            OpKind::RecvInitialMetadata { .. } => OpType::RecvInitialMetadata,
            OpKind::RecvMessage { .. } => OpType::RecvMessage,
            OpKind::RecvStatusOnClient { .. } => OpType::RecvStatusOnClient,
            OpKind::RecvCloseOnServer { .. } => OpType::RecvCloseOnServer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Client,
    Server,
}

/// A batch that passed validation, split by operation.
#[derive(Debug, Default)]
pub(crate) struct ValidatedBatch {
    pub send_initial_metadata: Option<(MetadataMap, u32)>,
    pub send_message: Option<Message>,
    pub send_close_from_client: bool,
    pub send_status_from_server: Option<TrailingMetadata>,
    pub recv_initial_metadata: Option<OutParam<MetadataMap>>,
    pub recv_message: Option<OutParam<Option<Bytes>>>,
    pub recv_status_on_client: Option<OutParam<TrailingMetadata>>,
    pub recv_close_on_server: Option<OutParam<bool>>,
}

impl ValidatedBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.send_initial_metadata.is_none()
            && self.send_message.is_none()
            && !self.send_close_from_client
            && self.send_status_from_server.is_none()
            && self.recv_initial_metadata.is_none()
            && self.recv_message.is_none()
            && self.recv_status_on_client.is_none()
            && self.recv_close_on_server.is_none()
    }

    /// Empty initial metadata plus a status and no message: the answer can
    /// go out as trailing metadata alone.
    pub(crate) fn is_trailers_only(&self) -> bool {
        matches!(&self.send_initial_metadata, Some((metadata, _)) if metadata.is_empty())
            && self.send_status_from_server.is_some()
            && self.send_message.is_none()
    }
}

/// Check a batch against the rules for `direction` and convert it.
///
/// Operations are checked in order; the first violation is returned and
/// nothing about the call changes.
pub(crate) fn validate(
    ops: &[Operation],
    direction: Direction,
    max_metadata_entries: usize,
) -> Result<ValidatedBatch, CallError> {
    let mut seen = 0u8;
    let mut batch = ValidatedBatch::default();

    for op in ops {
        match (&op.kind, direction) {
            (OpKind::SendInitialMetadata { metadata }, _) => {
                if op.flags & !INITIAL_METADATA_USED_MASK != 0 {
                    return Err(CallError::InvalidFlags);
                }
                let map = validate_metadata(metadata, max_metadata_entries)?;
                batch.send_initial_metadata = Some((map, op.flags));
            }
            (OpKind::SendMessage { message }, _) => {
                if op.flags & !WRITE_USED_MASK != 0 {
                    return Err(CallError::InvalidFlags);
                }
                batch.send_message = Some(Message::new(message.clone()).with_flags(op.flags));
            }
            (OpKind::SendCloseFromClient, Direction::Client) => {
                require_no_flags(op)?;
                batch.send_close_from_client = true;
            }
            (
                OpKind::SendStatusFromServer {
                    code,
                    details,
                    trailing_metadata,
                },
                Direction::Server,
            ) => {
                require_no_flags(op)?;
                let entries = validate_metadata(trailing_metadata, max_metadata_entries)?;
                batch.send_status_from_server =
                    Some(TrailingMetadata::new(*code, details.clone()).with_entries(entries));
            }
            (OpKind::RecvInitialMetadata { metadata }, Direction::Client) => {
                require_no_flags(op)?;
                batch.recv_initial_metadata = Some(metadata.clone());
            }
            (OpKind::RecvMessage { message }, _) => {
                require_no_flags(op)?;
                batch.recv_message = Some(message.clone());
            }
            (OpKind::RecvStatusOnClient { status }, Direction::Client) => {
                require_no_flags(op)?;
                batch.recv_status_on_client = Some(status.clone());
            }
            (OpKind::RecvCloseOnServer { cancelled }, Direction::Server) => {
                require_no_flags(op)?;
                batch.recv_close_on_server = Some(cancelled.clone());
            }
            (
                OpKind::SendCloseFromClient
                | OpKind::RecvInitialMetadata { .. }
                | OpKind::RecvStatusOnClient { .. },
                Direction::Server,
            ) => return Err(CallError::NotOnServer),
            (
                OpKind::SendStatusFromServer { .. } | OpKind::RecvCloseOnServer { .. },
                Direction::Client,
            ) => return Err(CallError::NotOnClient),
        }

        let bit = op.op_type().bit();
        if seen & bit != 0 {
            return Err(CallError::TooManyOperations);
        }
        seen |= bit;
    }

    Ok(batch)
}

fn require_no_flags(op: &Operation) -> Result<(), CallError> {
    if op.flags != 0 {
        return Err(CallError::InvalidFlags);
    }
    Ok(())
}

/// The pending notification of one accepted batch.
///
/// Delivered exactly once: explicitly through [`finish`](Self::finish), or
/// as a cancellation if dropped first.
pub(crate) struct BatchCompletion {
    cq: Arc<CompletionQueue>,
    tag: Option<Tag>,
}

impl BatchCompletion {
    /// Reserve `tag` on `cq`.
    pub(crate) fn begin(cq: &Arc<CompletionQueue>, tag: Tag) -> Result<Self, CallError> {
        if !cq.begin_op(tag) {
            return Err(CallError::CompletionQueueShutdown);
        }
        Ok(Self {
            cq: Arc::clone(cq),
            tag: Some(tag),
        })
    }

    pub(crate) fn finish(mut self, result: Result<(), Status>) {
        if let Some(tag) = self.tag.take() {
            self.cq.end_op(tag, result);
        }
    }
}

impl Drop for BatchCompletion {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.cq
                .end_op(tag, Err(Status::cancelled("batch dropped before completion")));
        }
    }
}
