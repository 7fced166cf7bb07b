//! Listening side of the transport: accepts inbound message sockets.

use crate::error::{BusError, Result};
use crate::signal::Signal;
use crate::socket::{MessageSocket, TcpMessageSocket};
use crate::url::Url;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Accepts inbound connections on a bound url and emits each accepted socket
/// through the `new_connection` signal.
pub struct TransportServer {
    endpoint: Url,
    new_connection: Arc<Signal<Arc<dyn MessageSocket>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl TransportServer {
    /// Bind a listener. Port 0 is supported; `endpoint()` reports the port
    /// actually bound.
    pub async fn bind(url: &Url, max_message_size: usize) -> Result<Self> {
        if !url.is_valid() {
            return Err(BusError::configuration(
                format!("cannot listen on invalid url '{}'", url),
                Some("listen"),
            ));
        }
        let listener = TcpListener::bind(url.authority())
            .await
            .map_err(|e| BusError::network_with_source(format!("failed to bind {}", url), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| BusError::network_with_source("failed to read local address", e))?
            .port();
        let endpoint = url.with_port(port);
        info!(endpoint = %endpoint, "transport server listening");

        let new_connection: Arc<Signal<Arc<dyn MessageSocket>>> = Arc::new(Signal::new());
        let signal = Arc::clone(&new_connection);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY on accepted stream: {}", e);
                        }
                        let peer_url = Url::new("tcp", &peer.ip().to_string(), peer.port());
                        info!(peer = %peer_url, "accepted connection");
                        let socket = Arc::new(TcpMessageSocket::from_stream(
                            stream,
                            peer_url,
                            max_message_size,
                        ));
                        // Let subscribers attach their handlers before the
                        // first frame can be read.
                        signal.fire(&(Arc::clone(&socket) as Arc<dyn MessageSocket>));
                        socket.activate();
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            endpoint,
            new_connection,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The bound endpoint, with the real port filled in.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Signal fired with every accepted socket.
    pub fn new_connection(&self) -> &Signal<Arc<dyn MessageSocket>> {
        &self.new_connection
    }

    /// Stop accepting. Already-accepted sockets stay alive.
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            info!(endpoint = %self.endpoint, "transport server closed");
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.close();
    }
}
