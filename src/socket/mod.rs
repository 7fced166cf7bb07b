//! Message socket abstraction.
//!
//! `MessageSocket` is the seam between the connection/routing plane and the
//! actual transport: the cache and the gateway only ever hold
//! `Arc<dyn MessageSocket>` handles they obtained from a `SocketFactory`.
//! Production code dials TCP; tests inject scripted sockets.

use crate::config::SessionConfig;
use crate::error::{BusError, Result};
use crate::message::Message;
use crate::signal::Signal;
use crate::url::Url;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod server;
pub mod tcp;

#[cfg(test)]
pub(crate) mod testing;

pub use server::TransportServer;
pub use tcp::TcpMessageSocket;

/// Process-unique socket identity; routing tables key on it.
pub type SocketId = u64;

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh socket id.
pub fn next_socket_id() -> SocketId {
    SOCKET_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// An asynchronous, bidirectional frame transport.
#[async_trait]
pub trait MessageSocket: Send + Sync {
    /// Process-unique identity of this socket.
    fn id(&self) -> SocketId;

    fn state(&self) -> SocketState;

    fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// The url this socket was connected to, if any.
    fn url(&self) -> Option<Url>;

    /// Establish the stream. Resolves when connected; errors on refusal,
    /// unreachable host or timeout.
    async fn connect(&self, url: &Url) -> Result<()>;

    /// Enqueue a frame for transmission. Best-effort: delivery is only ever
    /// confirmed by a reply.
    fn send(&self, message: Message) -> Result<()>;

    /// Tear the connection down. Synchronous; fires `disconnected` if the
    /// socket was live.
    fn disconnect(&self);

    /// Fires exactly once per connection loss. Subscribers may receive it
    /// synchronously on the I/O task and must restrict themselves to table
    /// fix-up.
    fn disconnected(&self) -> &Signal<String>;

    /// Fires once per decoded incoming frame.
    fn message_received(&self) -> &Signal<Message>;
}

impl fmt::Debug for dyn MessageSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSocket")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Creates sockets for a given url scheme.
pub trait SocketFactory: Send + Sync {
    fn make_socket(&self, protocol: &str) -> Result<Arc<dyn MessageSocket>>;
}

/// Production factory: plain TCP message sockets.
pub struct TcpSocketFactory {
    config: SessionConfig,
}

impl TcpSocketFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl SocketFactory for TcpSocketFactory {
    fn make_socket(&self, protocol: &str) -> Result<Arc<dyn MessageSocket>> {
        match protocol {
            "tcp" => Ok(Arc::new(TcpMessageSocket::new(
                self.config.connect_timeout(),
                self.config.max_message_size,
            ))),
            "tcps" => Err(BusError::configuration(
                "tcps endpoints require TLS support, which this build does not provide",
                Some("protocol"),
            )),
            other => Err(BusError::configuration(
                format!("unknown url scheme '{}'", other),
                Some("protocol"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_ids_are_unique() {
        let a = next_socket_id();
        let b = next_socket_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_factory_refuses_tls_and_unknown_schemes() {
        let factory = TcpSocketFactory::new(SessionConfig::default());
        assert!(factory.make_socket("tcp").is_ok());
        assert!(factory.make_socket("tcps").is_err());
        assert!(factory.make_socket("udp").is_err());
    }
}
