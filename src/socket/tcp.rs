//! TCP message socket.
//!
//! One spawned read loop decodes frames and fires `message_received`; one
//! spawned write loop drains an unbounded queue so `send` never blocks the
//! caller. Connection loss from either loop funnels through a latched
//! disconnect so the `disconnected` signal fires exactly once.

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::signal::Signal;
use crate::socket::{next_socket_id, MessageSocket, SocketId, SocketState};
use crate::url::Url;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct SocketCore {
    id: SocketId,
    max_message_size: usize,
    state: Mutex<SocketState>,
    url: Mutex<Option<Url>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disconnect_latch: AtomicBool,
    disconnected: Signal<String>,
    message_received: Signal<Message>,
}

impl SocketCore {
    fn trigger_disconnect(&self, reason: &str) {
        if self.disconnect_latch.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SocketState::Disconnected;
        self.writer.lock().take();
        debug!(socket = self.id, reason, "socket disconnected");
        self.disconnected.fire(&reason.to_string());
    }
}

/// A `MessageSocket` over a TCP stream.
pub struct TcpMessageSocket {
    core: Arc<SocketCore>,
    connect_timeout: Duration,
    accepted_stream: Mutex<Option<TcpStream>>,
}

impl TcpMessageSocket {
    /// Create an unconnected socket; dial with [`MessageSocket::connect`].
    pub fn new(connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            core: Arc::new(SocketCore {
                id: next_socket_id(),
                max_message_size,
                state: Mutex::new(SocketState::Disconnected),
                url: Mutex::new(None),
                writer: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                disconnect_latch: AtomicBool::new(false),
                disconnected: Signal::new(),
                message_received: Signal::new(),
            }),
            connect_timeout,
            accepted_stream: Mutex::new(None),
        }
    }

    /// Wrap a stream accepted by a listener; the socket is connected but does
    /// not read until [`TcpMessageSocket::activate`], so the acceptor can
    /// attach subscribers without losing the first frames.
    pub fn from_stream(stream: TcpStream, peer: Url, max_message_size: usize) -> Self {
        let socket = Self::new(Duration::from_secs(0), max_message_size);
        *socket.core.url.lock() = Some(peer);
        *socket.core.state.lock() = SocketState::Connected;
        *socket.accepted_stream.lock() = Some(stream);
        socket
    }

    /// Start I/O on an accepted stream. No-op on dialed sockets or when
    /// called twice.
    pub fn activate(&self) {
        if let Some(stream) = self.accepted_stream.lock().take() {
            Self::install(&self.core, stream);
        }
    }

    fn install(core: &Arc<SocketCore>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *core.writer.lock() = Some(tx);

        let read_task = tokio::spawn(Self::read_loop(Arc::clone(core), read_half));
        let write_task = tokio::spawn(Self::write_loop(Arc::clone(core), write_half, rx));
        let mut tasks = core.tasks.lock();
        tasks.push(read_task);
        tasks.push(write_task);
    }

    async fn read_loop(core: Arc<SocketCore>, mut read_half: OwnedReadHalf) {
        loop {
            match Message::read_from(&mut read_half, core.max_message_size).await {
                Ok(Some(message)) => {
                    debug!(
                        socket = core.id,
                        id = message.id,
                        service = message.service,
                        "received frame"
                    );
                    core.message_received.fire(&message);
                }
                Ok(None) => {
                    core.trigger_disconnect("connection closed by peer");
                    return;
                }
                Err(e) => {
                    core.trigger_disconnect(&e.to_string());
                    return;
                }
            }
        }
    }

    async fn write_loop(
        core: Arc<SocketCore>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = message.write_to(&mut write_half).await {
                core.trigger_disconnect(&e.to_string());
                return;
            }
        }
        // Sender gone: orderly local teardown.
        let _ = write_half.shutdown().await;
    }
}

#[async_trait]
impl MessageSocket for TcpMessageSocket {
    fn id(&self) -> SocketId {
        self.core.id
    }

    fn state(&self) -> SocketState {
        *self.core.state.lock()
    }

    fn url(&self) -> Option<Url> {
        self.core.url.lock().clone()
    }

    async fn connect(&self, url: &Url) -> Result<()> {
        {
            let mut state = self.core.state.lock();
            if *state != SocketState::Disconnected {
                return Err(BusError::connection(
                    format!("connect in state {:?}", *state),
                    None,
                ));
            }
            *state = SocketState::Connecting;
        }

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(url.authority()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *self.core.state.lock() = SocketState::Disconnected;
                return Err(BusError::network_with_source(
                    format!("failed to connect to {}", url),
                    e,
                ));
            }
            Err(_) => {
                *self.core.state.lock() = SocketState::Disconnected;
                return Err(BusError::timeout(
                    format!("connect to {}", url),
                    self.connect_timeout.as_millis() as u64,
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(socket = self.core.id, "failed to set TCP_NODELAY: {}", e);
        }

        *self.core.url.lock() = Some(url.clone());
        Self::install(&self.core, stream);
        {
            // The read loop may have observed an instant peer close already;
            // do not resurrect the state it latched.
            let mut state = self.core.state.lock();
            if !self.core.disconnect_latch.load(Ordering::SeqCst) {
                *state = SocketState::Connected;
            }
        }
        debug!(socket = self.core.id, url = %url, "connected");
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        let sender = self.core.writer.lock().clone();
        match sender {
            Some(tx) => tx
                .send(message)
                .map_err(|_| BusError::network("socket writer is gone")),
            None => Err(BusError::network("socket is not connected")),
        }
    }

    fn disconnect(&self) {
        {
            let mut state = self.core.state.lock();
            if *state == SocketState::Disconnected
                && self.core.disconnect_latch.load(Ordering::SeqCst)
            {
                return;
            }
            *state = SocketState::Closing;
        }
        let tasks: Vec<JoinHandle<()>> = self.core.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.core.trigger_disconnect("socket disconnected");
    }

    fn disconnected(&self) -> &Signal<String> {
        &self.core.disconnected
    }

    fn message_received(&self) -> &Signal<Message> {
        &self.core.message_received
    }
}

impl Drop for TcpMessageSocket {
    fn drop(&mut self) {
        // Last owner tears the connection down.
        let tasks: Vec<JoinHandle<()>> = self.core.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}
