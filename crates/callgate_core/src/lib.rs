//! Call admission and lifecycle engine.
//!
//! Applications drive calls with batches of operations and receive results
//! on completion queues. Server-side, arriving calls are matched with
//! application requests under round-robin fairness and random early
//! detection. Transports plug in through the [`transport::Transport`] trait.

pub mod call;
pub mod channel;
pub mod completion_queue;
pub mod config;
pub mod error;
pub mod metadata;
pub mod party;
pub mod server;
mod spine;
pub mod sync;
pub mod transport;

pub use call::{ClientCall, MessageReceiver, OpKind, OpType, Operation, ServerCall};
pub use channel::Channel;
pub use completion_queue::{CompletionQueue, Event, Tag};
pub use config::{ChannelConfig, MatchingMode, ServerConfig};
pub use error::{CallError, ServerError};
pub use metadata::{ClientMetadata, Message, MetadataEntry, TrailingMetadata};
pub use server::{
    CallDetails, CallRequest, PayloadHandling, RegisteredCallRequest, RegisteredMethod, Server,
};
pub use sync::OutParam;
pub use transport::loopback::{LoopbackTransport, loopback_pair};
pub use transport::{ClientTransport, SharedTransport, StreamId, Transport};
