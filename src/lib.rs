use callgate_core::{Channel, ChannelConfig, Server, loopback_pair};

pub use callgate_core;

pub const ECHO_METHOD: &str = "/echo.Echo/Say";

/// Connect an in-process client to `server`.
///
/// Streams opened on the returned channel are accepted by `server` as they
/// arrive. Must be called from within a tokio runtime.
pub fn connect_loopback(server: &Server, config: ChannelConfig) -> Channel {
    let (client, transport, incoming) = loopback_pair();
    server.serve(transport, incoming);
    Channel::new(client, config)
}
