//! Scripted sockets for cache and gateway unit tests.
//!
//! `MockFactory` hands out `MockSocket`s whose connect outcome is scripted
//! per url, so dial races, failures and stalls are reproduced without real
//! network timing.

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::signal::Signal;
use crate::socket::{next_socket_id, MessageSocket, SocketFactory, SocketId, SocketState};
use crate::url::Url;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted outcome of `connect` for one url.
#[derive(Debug, Clone)]
pub enum ConnectScript {
    /// Succeed immediately.
    Succeed,
    /// Fail immediately with this reason.
    Fail(String),
    /// Succeed after a delay.
    SucceedAfter(Duration),
    /// Fail after a delay.
    FailAfter(Duration, String),
    /// Never complete (the dial outlives the test).
    Stall,
}

pub struct MockSocket {
    id: SocketId,
    scripts: Arc<Mutex<HashMap<Url, ConnectScript>>>,
    state: Mutex<SocketState>,
    url: Mutex<Option<Url>>,
    disconnect_latch: AtomicBool,
    disconnected_signal: Signal<String>,
    message_received: Signal<Message>,
    /// Frames handed to `send`, in order.
    pub sent: Mutex<Vec<Message>>,
}

impl MockSocket {
    fn new(scripts: Arc<Mutex<HashMap<Url, ConnectScript>>>) -> Self {
        Self {
            id: next_socket_id(),
            scripts,
            state: Mutex::new(SocketState::Disconnected),
            url: Mutex::new(None),
            disconnect_latch: AtomicBool::new(false),
            disconnected_signal: Signal::new(),
            message_received: Signal::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A standalone socket that is already connected (gateway tests build
    /// clients and backends directly).
    pub fn connected(url: &Url) -> Arc<Self> {
        let socket = Self::new(Arc::new(Mutex::new(HashMap::new())));
        *socket.state.lock() = SocketState::Connected;
        *socket.url.lock() = Some(url.clone());
        Arc::new(socket)
    }

    /// Deliver an inbound frame as if it had been read off the wire.
    pub fn deliver(&self, message: Message) {
        self.message_received.fire(&message);
    }

    /// Simulate connection loss.
    pub fn drop_connection(&self, reason: &str) {
        if self.disconnect_latch.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SocketState::Disconnected;
        self.disconnected_signal.fire(&reason.to_string());
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnect_latch.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSocket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    fn url(&self) -> Option<Url> {
        self.url.lock().clone()
    }

    async fn connect(&self, url: &Url) -> Result<()> {
        *self.state.lock() = SocketState::Connecting;
        *self.url.lock() = Some(url.clone());
        let script = self
            .scripts
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(ConnectScript::Succeed);
        let outcome = match script {
            ConnectScript::Succeed => Ok(()),
            ConnectScript::Fail(reason) => Err(BusError::network(reason)),
            ConnectScript::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ConnectScript::FailAfter(delay, reason) => {
                tokio::time::sleep(delay).await;
                Err(BusError::network(reason))
            }
            ConnectScript::Stall => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        *self.state.lock() = match outcome {
            Ok(()) => SocketState::Connected,
            Err(_) => SocketState::Disconnected,
        };
        outcome
    }

    fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::network("mock socket is not connected"));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn disconnect(&self) {
        self.drop_connection("socket disconnected");
    }

    fn disconnected(&self) -> &Signal<String> {
        &self.disconnected_signal
    }

    fn message_received(&self) -> &Signal<Message> {
        &self.message_received
    }
}

/// Factory producing scripted sockets and recording every one it makes.
pub struct MockFactory {
    scripts: Arc<Mutex<HashMap<Url, ConnectScript>>>,
    pub created: Mutex<Vec<Arc<MockSocket>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Script the connect outcome for one url. Unscripted urls succeed.
    pub fn script(&self, url: &Url, script: ConnectScript) {
        self.scripts.lock().insert(url.clone(), script);
    }

    pub fn created_sockets(&self) -> Vec<Arc<MockSocket>> {
        self.created.lock().clone()
    }

    /// Sockets that ended up connected to the given url.
    pub fn socket_for(&self, url: &Url) -> Option<Arc<MockSocket>> {
        self.created
            .lock()
            .iter()
            .find(|s| s.url().as_ref() == Some(url))
            .cloned()
    }
}

impl SocketFactory for MockFactory {
    fn make_socket(&self, _protocol: &str) -> Result<Arc<dyn MessageSocket>> {
        let socket = Arc::new(MockSocket::new(Arc::clone(&self.scripts)));
        self.created.lock().push(Arc::clone(&socket));
        Ok(socket)
    }
}
