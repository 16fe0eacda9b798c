use parking_lot::Mutex;
use tonic::metadata::MetadataMap;

use crate::metadata::{ENCODING_KEY, Message, metadata_str};

#[derive(Debug, Default)]
struct ReceiverState {
    incoming_compression: Option<String>,
    last_flags: u32,
    received: u64,
}

/// Bookkeeping for messages received on a call: the compression algorithm
/// announced by the peer and the flags of the latest message.
#[derive(Debug, Default)]
pub struct MessageReceiver {
    state: Mutex<ReceiverState>,
}

impl MessageReceiver {
    pub(crate) fn on_initial_metadata(&self, metadata: &MetadataMap) {
        let encoding = metadata_str(metadata, ENCODING_KEY)
            .filter(|e| *e != "identity")
            .map(str::to_string);
        self.state.lock().incoming_compression = encoding;
    }

    pub(crate) fn on_message(&self, message: &Message) {
        let mut state = self.state.lock();
        state.last_flags = message.flags;
        state.received += 1;
    }

    /// Compression the peer applies to its messages, `None` for identity.
    pub fn incoming_compression(&self) -> Option<String> {
        self.state.lock().incoming_compression.clone()
    }

    pub fn last_flags(&self) -> u32 {
        self.state.lock().last_flags
    }

    pub fn messages_received(&self) -> u64 {
        self.state.lock().received
    }
}
