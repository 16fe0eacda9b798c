use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::call::{ClientCall, ClientCallSetup, ServerCall};
use crate::config::ChannelConfig;
use crate::transport::{ClientTransport, SharedTransport};

/// The client side of a connection: creates calls on one transport.
#[derive(Clone)]
pub struct Channel {
    client: Arc<dyn ClientTransport>,
    transport: SharedTransport,
    config: ChannelConfig,
}

impl Channel {
    pub fn new<T: ClientTransport>(transport: Arc<T>, config: ChannelConfig) -> Self {
        let client: Arc<dyn ClientTransport> = Arc::clone(&transport) as Arc<dyn ClientTransport>;
        Self {
            client,
            transport,
            config,
        }
    }

    /// Remote address of the transport.
    pub fn target(&self) -> String {
        self.transport.peer()
    }

    /// Create a call to `method`.
    ///
    /// The call's deadline is the earliest of `deadline`, the configured
    /// default timeout and the deadline of `parent`. A call created with a
    /// parent is cancelled when the parent is.
    pub fn create_call(
        &self,
        method: impl Into<String>,
        deadline: Option<Instant>,
        parent: Option<&ServerCall>,
    ) -> ClientCall {
        let default_deadline = self
            .config
            .default_timeout
            .map(|timeout| Instant::now() + timeout);
        let parent_deadline = parent.and_then(ServerCall::deadline);
        let deadline = [deadline, default_deadline, parent_deadline]
            .into_iter()
            .flatten()
            .min();

        let call = ClientCall::new(ClientCallSetup {
            client: Arc::clone(&self.client),
            transport: Arc::clone(&self.transport),
            path: method.into(),
            authority: self
                .config
                .authority
                .clone()
                .or_else(|| Some(self.transport.peer()).filter(|peer| !peer.is_empty())),
            deadline,
            max_metadata_entries: self.config.max_metadata_entries,
        });
        if let Some(parent) = parent {
            tracing::debug!(call_id = %call.id(), parent_id = %parent.id(), "Linking child call");
            parent.add_child(call.cancel_handle());
        }
        call
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target())
            .field("config", &self.config)
            .finish()
    }
}
