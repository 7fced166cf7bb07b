//! Gateway router.
//!
//! A gateway sits between clients and services: it accepts client sockets on
//! a bound address, keeps one persistent socket to the service directory,
//! lazily opens one socket per needed backend, and forwards traffic in both
//! directions while rewriting message ids. Ids on a backend link come from
//! the gateway's own counter; the `(backend socket, forwarded id)` pair maps
//! back to `(original id, client socket)` so replies can be routed home.
//! Directory replies it originated are rewritten to advertise the gateway's
//! endpoints instead of the backend's.
//!
//! Routing tables live behind one mutex held only across map manipulation;
//! sends and dials always happen after it is released.

use crate::codec;
use crate::config::SessionConfig;
use crate::error::{BusError, Result};
use crate::message::{
    Message, MessageKind, DIRECTORY_FUNCTION_SERVICE, OBJECT_MAIN, PROTOCOL_VERSION,
    SERVICE_DIRECTORY,
};
use crate::service::ServiceInfo;
use crate::socket::{MessageSocket, SocketFactory, SocketId, TransportServer};
use crate::url::Url;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// First id of the gateway's forwarded-request id space.
const FORWARD_ID_BASE: u32 = 500;

/// Where a backend message routes back to.
enum RouteOrigin {
    /// The gateway itself asked (a directory resolve).
    Router,
    /// A client asked; restore its id and send it the answer.
    Client {
        original_id: u32,
        client: Arc<dyn MessageSocket>,
    },
    /// The asking client disconnected; discard the answer.
    Dead,
}

struct ServiceEntry {
    socket: Arc<dyn MessageSocket>,
    connected: bool,
}

struct PendingMessage {
    message: Message,
    client: Arc<dyn MessageSocket>,
}

#[derive(Default)]
struct RouterState {
    /// serviceId → backend socket.
    services: HashMap<u32, ServiceEntry>,
    clients: Vec<Arc<dyn MessageSocket>>,
    /// backend socket → forwarded id → origin.
    routes: HashMap<SocketId, HashMap<u32, RouteOrigin>>,
    /// serviceId → messages waiting for the backend to come up, in arrival
    /// order.
    pending: HashMap<u32, Vec<PendingMessage>>,
    /// Urls advertised in rewritten directory replies.
    endpoints: Vec<Url>,
}

struct GatewayInner {
    factory: Arc<dyn SocketFactory>,
    next_forward_id: AtomicU32,
    state: Mutex<RouterState>,
    server: Mutex<Option<TransportServer>>,
}

/// Message-forwarding node between clients and services.
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                factory,
                next_forward_id: AtomicU32::new(FORWARD_ID_BASE),
                state: Mutex::new(RouterState::default()),
                server: Mutex::new(None),
            }),
        }
    }

    /// Bind `url` for clients and connect to the session's service directory.
    ///
    /// Returns the bound endpoint (port 0 resolved), which is also the
    /// endpoint advertised to clients in rewritten directory replies.
    pub async fn listen(&self, config: &SessionConfig, url: &Url) -> Result<Url> {
        let directory = self
            .inner
            .factory
            .make_socket(config.service_directory.protocol())?;
        self.inner.attach_directory(Arc::clone(&directory));
        directory.connect(&config.service_directory).await?;
        info!(directory = %config.service_directory, "connected to service directory");

        let server = TransportServer::bind(url, config.max_message_size).await?;
        let endpoint = server.endpoint().clone();
        self.inner.state.lock().endpoints.push(endpoint.clone());

        let weak = Arc::downgrade(&self.inner);
        server
            .new_connection()
            .connect(move |socket: &Arc<dyn MessageSocket>| {
                if let Some(inner) = weak.upgrade() {
                    inner.register_client(Arc::clone(socket));
                }
            });
        *self.inner.server.lock() = Some(server);
        info!(endpoint = %endpoint, "gateway listening");
        Ok(endpoint)
    }

    /// Stop accepting and tear every held socket down.
    pub fn close(&self) {
        if let Some(server) = self.inner.server.lock().take() {
            server.close();
        }
        let sockets: Vec<Arc<dyn MessageSocket>> = {
            let mut state = self.inner.state.lock();
            let mut sockets: Vec<Arc<dyn MessageSocket>> = state.clients.drain(..).collect();
            sockets.extend(state.services.drain().map(|(_, entry)| entry.socket));
            state.routes.clear();
            state.pending.clear();
            sockets
        };
        for socket in sockets {
            socket.disconnect();
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<GatewayInner> {
        &self.inner
    }
}

impl GatewayInner {
    fn next_forward_id(&self) -> u32 {
        self.next_forward_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Install the directory socket under its well-known service id and wire
    /// its traffic into the backend read path.
    fn attach_directory(self: &Arc<Self>, socket: Arc<dyn MessageSocket>) {
        self.subscribe_backend(&socket, SERVICE_DIRECTORY);
        let mut state = self.state.lock();
        state.services.insert(
            SERVICE_DIRECTORY,
            ServiceEntry {
                socket,
                connected: true,
            },
        );
    }

    /// Track a freshly accepted client socket.
    fn register_client(self: &Arc<Self>, socket: Arc<dyn MessageSocket>) {
        let client_id = socket.id();
        debug!(client = client_id, "client connected to gateway");

        let weak = Arc::downgrade(self);
        socket.message_received().connect(move |message: &Message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_client_read(client_id, message);
            }
        });
        let weak = Arc::downgrade(self);
        socket.disconnected().connect(move |_reason: &String| {
            if let Some(inner) = weak.upgrade() {
                inner.on_client_disconnected(client_id);
            }
        });

        self.state.lock().clients.push(socket);
    }

    /// Wire a backend socket's frames and loss into the routing plane.
    /// Handlers capture ids, not sockets, so a socket never owns itself
    /// through its own signal table.
    fn subscribe_backend(self: &Arc<Self>, socket: &Arc<dyn MessageSocket>, service_id: u32) {
        let socket_id = socket.id();
        let weak = Arc::downgrade(self);
        socket.message_received().connect(move |message: &Message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_service_read(socket_id, message);
            }
        });
        let weak = Arc::downgrade(self);
        socket.disconnected().connect(move |_reason: &String| {
            if let Some(inner) = weak.upgrade() {
                inner.on_service_disconnected(service_id);
            }
        });
    }

    /// Inbound from a client. A connected backend gets the message forwarded
    /// at once; an unknown service queues it and resolves through the
    /// directory, with at most one resolve in flight per service.
    fn handle_client_read(self: &Arc<Self>, client_id: SocketId, message: &Message) {
        let mut sends: Vec<(Arc<dyn MessageSocket>, Message)> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(client) = state
                .clients
                .iter()
                .find(|c| c.id() == client_id)
                .cloned()
            else {
                warn!(client = client_id, "message from unknown client socket");
                return;
            };

            let connected_backend = state
                .services
                .get(&message.service)
                .filter(|entry| entry.connected)
                .map(|entry| Arc::clone(&entry.socket));

            if let Some(backend) = connected_backend {
                self.forward_client_message(&mut state, &backend, &client, message, &mut sends);
            } else {
                let service_known = state.services.contains_key(&message.service);
                let queue = state.pending.entry(message.service).or_default();
                let needs_resolve = queue.is_empty() && !service_known;
                queue.push(PendingMessage {
                    message: message.clone(),
                    client: Arc::clone(&client),
                });
                debug!(
                    service = message.service,
                    id = message.id,
                    "queued message for unresolved service"
                );

                if needs_resolve {
                    let directory = state
                        .services
                        .get(&SERVICE_DIRECTORY)
                        .map(|entry| Arc::clone(&entry.socket));
                    let Some(directory) = directory else {
                        error!(
                            service = message.service,
                            "no directory socket, failing client request"
                        );
                        state.pending.remove(&message.service);
                        sends.push((
                            client,
                            Message::error_from(message, "service directory unavailable"),
                        ));
                        drop(state);
                        self.dispatch(sends);
                        return;
                    };

                    let resolve_id = self.next_forward_id();
                    let resolve = Message {
                        id: resolve_id,
                        version: PROTOCOL_VERSION,
                        kind: MessageKind::Call,
                        flags: 0,
                        service: SERVICE_DIRECTORY,
                        object: OBJECT_MAIN,
                        function: DIRECTORY_FUNCTION_SERVICE,
                        payload: codec::encode_u32(message.service),
                    };
                    state
                        .routes
                        .entry(directory.id())
                        .or_default()
                        .insert(resolve_id, RouteOrigin::Router);
                    debug!(
                        service = message.service,
                        resolve_id, "resolving service through directory"
                    );
                    sends.push((directory, resolve));
                }
            }
        }
        self.dispatch(sends);
    }

    /// Fresh id, record the reverse mapping, hand the frame to the backend.
    fn forward_client_message(
        &self,
        state: &mut RouterState,
        backend: &Arc<dyn MessageSocket>,
        client: &Arc<dyn MessageSocket>,
        message: &Message,
        sends: &mut Vec<(Arc<dyn MessageSocket>, Message)>,
    ) {
        let forward_id = self.next_forward_id();
        let forwarded = Message::forward_from(message, forward_id);
        state.routes.entry(backend.id()).or_default().insert(
            forward_id,
            RouteOrigin::Client {
                original_id: message.id,
                client: Arc::clone(client),
            },
        );
        debug!(
            service = message.service,
            original_id = message.id,
            forward_id,
            "forwarding client message"
        );
        sends.push((Arc::clone(backend), forwarded));
    }

    /// Inbound from a backend. A reply to a gateway-originated resolve opens
    /// the backend, rewrites the advertised endpoints and answers the
    /// triggering client; any other correlated reply has its original id
    /// restored and goes home.
    fn handle_service_read(self: &Arc<Self>, socket_id: SocketId, message: &Message) {
        let mut sends: Vec<(Arc<dyn MessageSocket>, Message)> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(route_map) = state.routes.get_mut(&socket_id) else {
                error!(
                    socket = socket_id,
                    id = message.id,
                    "cannot find client request for service reply"
                );
                return;
            };
            let Some(origin) = route_map.remove(&message.id) else {
                error!(
                    socket = socket_id,
                    id = message.id,
                    "no matching request for backend message, dropping"
                );
                return;
            };

            match origin {
                RouteOrigin::Router => {
                    if message.service == SERVICE_DIRECTORY
                        && message.function == DIRECTORY_FUNCTION_SERVICE
                        && message.kind == MessageKind::Reply
                    {
                        self.handle_resolve_reply(&mut state, message, &mut sends);
                    } else {
                        error!(
                            id = message.id,
                            kind = ?message.kind,
                            "unexpected answer to gateway-originated request, dropping"
                        );
                    }
                }
                RouteOrigin::Client {
                    original_id,
                    client,
                } => {
                    debug!(
                        forwarded_id = message.id,
                        original_id, "routing backend reply to client"
                    );
                    sends.push((client, message.with_id(original_id)));
                }
                RouteOrigin::Dead => {
                    debug!(
                        id = message.id,
                        "discarding reply destined for a disconnected client"
                    );
                }
            }
        }
        self.dispatch(sends);
    }

    /// Resolve-reply handling. A decode failure is a routing miss: logged,
    /// dropped.
    fn handle_resolve_reply(
        self: &Arc<Self>,
        state: &mut RouterState,
        message: &Message,
        sends: &mut Vec<(Arc<dyn MessageSocket>, Message)>,
    ) {
        let mut payload = message.payload.clone();
        let info = match ServiceInfo::decode(&mut payload) {
            Ok(info) => info,
            Err(e) => {
                error!("failed to decode directory resolve reply: {}", e);
                return;
            }
        };
        debug!(
            service = info.service_id,
            endpoints = info.endpoints.len(),
            "directory resolved service"
        );

        // Answer the client whose message triggered the resolve, steering it
        // back to this gateway instead of the backend.
        if let Some(first) = state
            .pending
            .get(&info.service_id)
            .and_then(|queue| queue.first())
        {
            let advertised = info.with_endpoints(state.endpoints.clone());
            let mut reply = Message::reply_from(message);
            reply.payload = advertised.encode();
            sends.push((Arc::clone(&first.client), reply.with_id(first.message.id)));
        }

        if state.services.contains_key(&info.service_id) {
            return;
        }

        let Some(backend_url) = info.endpoints.iter().find(|u| u.is_valid()).cloned() else {
            error!(
                service = info.service_id,
                "resolve reply carries no usable endpoint"
            );
            Self::fail_pending(state, info.service_id, "service has no usable endpoint", sends);
            return;
        };

        let backend = match self.factory.make_socket(backend_url.protocol()) {
            Ok(socket) => socket,
            Err(e) => {
                error!(service = info.service_id, "cannot open backend socket: {}", e);
                Self::fail_pending(state, info.service_id, &e.to_string(), sends);
                return;
            }
        };

        self.subscribe_backend(&backend, info.service_id);
        state.services.insert(
            info.service_id,
            ServiceEntry {
                socket: Arc::clone(&backend),
                connected: false,
            },
        );

        let inner = Arc::clone(self);
        let service_id = info.service_id;
        tokio::spawn(async move {
            match backend.connect(&backend_url).await {
                Ok(()) => inner.on_service_connected(service_id),
                Err(e) => inner.on_service_connect_failed(service_id, &e),
            }
        });
    }

    /// The backend came up: drain its queue in arrival order.
    fn on_service_connected(self: &Arc<Self>, service_id: u32) {
        let mut sends: Vec<(Arc<dyn MessageSocket>, Message)> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.services.get_mut(&service_id) else {
                error!(service = service_id, "connected backend is no longer installed");
                return;
            };
            entry.connected = true;
            let backend = Arc::clone(&entry.socket);
            info!(service = service_id, "backend connected, draining pending messages");

            let queue = state.pending.remove(&service_id).unwrap_or_default();
            for pending in queue {
                self.forward_client_message(
                    &mut state,
                    &backend,
                    &pending.client,
                    &pending.message,
                    &mut sends,
                );
            }
        }
        self.dispatch(sends);
    }

    /// The backend never came up: fail the queue instead of dropping it.
    fn on_service_connect_failed(self: &Arc<Self>, service_id: u32, error: &BusError) {
        warn!(service = service_id, "backend connection failed: {}", error);
        let mut sends: Vec<(Arc<dyn MessageSocket>, Message)> = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.services.remove(&service_id) {
                state.routes.remove(&entry.socket.id());
            }
            Self::fail_pending(&mut state, service_id, &error.to_string(), &mut sends);
        }
        self.dispatch(sends);
    }

    /// Backend socket loss. Queued messages (loss before the drain) are
    /// answered with an error; in-flight correlations are dropped with the
    /// routing table, so their replies can no longer arrive anyway.
    fn on_service_disconnected(self: &Arc<Self>, service_id: u32) {
        let mut sends: Vec<(Arc<dyn MessageSocket>, Message)> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(entry) = state.services.remove(&service_id) else {
                return;
            };
            warn!(service = service_id, "backend disconnected");
            state.routes.remove(&entry.socket.id());
            Self::fail_pending(
                &mut state,
                service_id,
                "service disconnected before answering",
                &mut sends,
            );
        }
        self.dispatch(sends);
    }

    /// A client went away: its correlation entries become tombstones and its
    /// queued messages are dropped.
    fn on_client_disconnected(&self, client_id: SocketId) {
        let mut state = self.state.lock();
        debug!(client = client_id, "client disconnected from gateway");
        state.clients.retain(|c| c.id() != client_id);
        for route_map in state.routes.values_mut() {
            for origin in route_map.values_mut() {
                if matches!(origin, RouteOrigin::Client { client, .. } if client.id() == client_id)
                {
                    *origin = RouteOrigin::Dead;
                }
            }
        }
        for queue in state.pending.values_mut() {
            queue.retain(|pending| pending.client.id() != client_id);
        }
    }

    fn fail_pending(
        state: &mut RouterState,
        service_id: u32,
        reason: &str,
        sends: &mut Vec<(Arc<dyn MessageSocket>, Message)>,
    ) {
        let queue = state.pending.remove(&service_id).unwrap_or_default();
        for pending in queue {
            sends.push((
                Arc::clone(&pending.client),
                Message::error_from(&pending.message, reason),
            ));
        }
    }

    /// Deliver collected frames with the routing lock released.
    fn dispatch(&self, sends: Vec<(Arc<dyn MessageSocket>, Message)>) {
        for (socket, message) in sends {
            if let Err(e) = socket.send(message) {
                warn!(socket = socket.id(), "failed to send routed message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{ConnectScript, MockFactory, MockSocket};
    use bytes::Bytes;
    use std::time::Duration;

    fn call_from_client(id: u32, service: u32, payload: &'static [u8]) -> Message {
        Message {
            id,
            version: PROTOCOL_VERSION,
            kind: MessageKind::Call,
            flags: 0,
            service,
            object: OBJECT_MAIN,
            function: 5,
            payload: Bytes::from_static(payload),
        }
    }

    fn test_gateway() -> (Gateway, Arc<MockFactory>, Arc<MockSocket>) {
        let factory = Arc::new(MockFactory::new());
        let gateway = Gateway::new(factory.clone());
        let directory = MockSocket::connected(&Url::parse("tcp://127.0.0.1:5555"));
        gateway.inner().attach_directory(directory.clone());
        gateway
            .inner()
            .state
            .lock()
            .endpoints
            .push(Url::parse("tcp://gateway-host:9559"));
        (gateway, factory, directory)
    }

    fn connect_client(gateway: &Gateway, url: &str) -> Arc<MockSocket> {
        let client = MockSocket::connected(&Url::parse(url));
        gateway.inner().register_client(client.clone());
        client
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// The full resolve flow: queue, resolve, rewritten reply, lazy backend,
    /// FIFO drain.
    #[tokio::test]
    async fn test_unknown_service_is_resolved_and_drained() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        client.deliver(call_from_client(7, 42, b"first"));

        // One resolve went to the directory, addressed to the well-known
        // resolve function, carrying the service id.
        let resolves = directory.sent_messages();
        assert_eq!(resolves.len(), 1);
        let resolve = &resolves[0];
        assert_eq!(resolve.service, SERVICE_DIRECTORY);
        assert_eq!(resolve.function, DIRECTORY_FUNCTION_SERVICE);
        assert_eq!(resolve.kind, MessageKind::Call);
        assert!(resolve.id >= FORWARD_ID_BASE);
        let mut payload = resolve.payload.clone();
        assert_eq!(codec::get_u32(&mut payload).unwrap(), 42);

        // A second message to the same unknown service queues silently.
        client.deliver(call_from_client(8, 42, b"second"));
        assert_eq!(directory.sent_messages().len(), 1);

        // Directory answers the resolve.
        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        // The triggering client got the reply with its own id and the
        // gateway's endpoints in place of the backend's.
        let to_client = client.sent_messages();
        assert!(!to_client.is_empty());
        assert_eq!(to_client[0].id, 7);
        assert_eq!(to_client[0].kind, MessageKind::Reply);
        let mut info_payload = to_client[0].payload.clone();
        let advertised = ServiceInfo::decode(&mut info_payload).unwrap();
        assert_eq!(advertised.service_id, 42);
        assert_eq!(
            advertised.endpoints,
            vec![Url::parse("tcp://gateway-host:9559")]
        );

        // The backend was opened lazily and drained in arrival order with
        // fresh ids.
        let backend = factory.socket_for(&backend_url).unwrap();
        let forwarded = backend.sent_messages();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].payload, Bytes::from_static(b"first"));
        assert_eq!(forwarded[1].payload, Bytes::from_static(b"second"));
        assert_ne!(forwarded[0].id, 7);
        assert_ne!(forwarded[1].id, 8);
        assert_ne!(forwarded[0].id, forwarded[1].id);
    }

    /// Backend replies come home with the original client id restored.
    #[tokio::test]
    async fn test_backend_reply_restores_client_id() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        client.deliver(call_from_client(7, 42, b"ping"));
        let resolve = directory.sent_messages()[0].clone();
        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        let backend = factory.socket_for(&backend_url).unwrap();
        let forwarded = backend.sent_messages()[0].clone();

        let mut backend_reply = Message::reply_from(&forwarded);
        backend_reply.payload = Bytes::from_static(b"pong");
        backend.deliver(backend_reply);

        let to_client = client.sent_messages();
        let last = to_client.last().unwrap();
        assert_eq!(last.id, 7);
        assert_eq!(last.payload, Bytes::from_static(b"pong"));
    }

    /// A connected backend short-circuits the queue entirely.
    #[tokio::test]
    async fn test_known_service_forwards_directly() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        client.deliver(call_from_client(7, 42, b"one"));
        let resolve = directory.sent_messages()[0].clone();
        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        let backend = factory.socket_for(&backend_url).unwrap();
        let before = backend.sent_messages().len();

        client.deliver(call_from_client(9, 42, b"two"));
        let after = backend.sent_messages();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last().unwrap().payload, Bytes::from_static(b"two"));
        // No second resolve was needed.
        assert_eq!(directory.sent_messages().len(), 1);
    }

    /// A backend frame with no recorded request is logged and dropped, not
    /// fatal.
    #[tokio::test]
    async fn test_routing_miss_is_tolerated() {
        let (gateway, _factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        let stray = Message {
            id: 9999,
            version: PROTOCOL_VERSION,
            kind: MessageKind::Reply,
            flags: 0,
            service: 42,
            object: OBJECT_MAIN,
            function: 5,
            payload: Bytes::new(),
        };
        directory.deliver(stray);
        assert!(client.sent_messages().is_empty());

        // The gateway still routes afterwards.
        client.deliver(call_from_client(7, 42, b"x"));
        assert_eq!(directory.sent_messages().len(), 1);
    }

    /// Replies for a client that went away are discarded.
    #[tokio::test]
    async fn test_dead_client_replies_are_discarded() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        client.deliver(call_from_client(7, 42, b"ping"));
        let resolve = directory.sent_messages()[0].clone();
        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        let backend = factory.socket_for(&backend_url).unwrap();
        let forwarded = backend.sent_messages()[0].clone();
        let sent_before = client.sent_messages().len();

        client.drop_connection("client went away");
        let mut late_reply = Message::reply_from(&forwarded);
        late_reply.payload = Bytes::from_static(b"too late");
        backend.deliver(late_reply);

        assert_eq!(client.sent_messages().len(), sent_before);
    }

    /// A backend that cannot be reached fails the queued requests instead of
    /// dropping them.
    #[tokio::test]
    async fn test_unreachable_backend_fails_queued_requests() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        let backend_url = Url::parse("tcp://backend-host:7000");
        factory.script(&backend_url, ConnectScript::Fail("refused".into()));

        client.deliver(call_from_client(7, 42, b"first"));
        client.deliver(call_from_client(8, 42, b"second"));
        let resolve = directory.sent_messages()[0].clone();
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        let to_client = client.sent_messages();
        let errors: Vec<&Message> = to_client
            .iter()
            .filter(|m| m.kind == MessageKind::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].id, 7);
        assert_eq!(errors[1].id, 8);

        // The failed entry is gone: a later message restarts resolution.
        client.deliver(call_from_client(10, 42, b"retry"));
        assert_eq!(directory.sent_messages().len(), 2);
    }

    /// Backend loss after connection answers still-queued messages with an
    /// error and forgets the service.
    #[tokio::test]
    async fn test_backend_disconnect_drains_pending_with_errors() {
        let (gateway, factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        client.deliver(call_from_client(7, 42, b"ping"));
        let resolve = directory.sent_messages()[0].clone();
        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&resolve);
        reply.payload = info.encode();
        directory.deliver(reply);
        settle().await;

        let backend = factory.socket_for(&backend_url).unwrap();
        backend.drop_connection("backend crashed");

        // The service is forgotten: next message resolves again.
        client.deliver(call_from_client(11, 42, b"again"));
        assert_eq!(directory.sent_messages().len(), 2);
    }

    /// Directory traffic a client originated itself takes the generic reply
    /// path: no endpoint rewriting.
    #[tokio::test]
    async fn test_client_originated_directory_call_is_not_rewritten() {
        let (gateway, _factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        let lookup = Message {
            id: 21,
            version: PROTOCOL_VERSION,
            kind: MessageKind::Call,
            flags: 0,
            service: SERVICE_DIRECTORY,
            object: OBJECT_MAIN,
            function: DIRECTORY_FUNCTION_SERVICE,
            payload: codec::encode_u32(42),
        };
        client.deliver(lookup);

        // Forwarded directly because the directory is installed and
        // connected.
        let forwarded = directory.sent_messages();
        assert_eq!(forwarded.len(), 1);
        assert_ne!(forwarded[0].id, 21);

        let backend_url = Url::parse("tcp://backend-host:7000");
        let info = ServiceInfo::new(42, "motion", "backend-machine", vec![backend_url.clone()]);
        let mut reply = Message::reply_from(&forwarded[0]);
        reply.payload = info.encode();
        directory.deliver(reply);

        let to_client = client.sent_messages();
        assert_eq!(to_client.len(), 1);
        assert_eq!(to_client[0].id, 21);
        let mut payload = to_client[0].payload.clone();
        let received = ServiceInfo::decode(&mut payload).unwrap();
        // Raw backend endpoints, untouched.
        assert_eq!(received.endpoints, vec![backend_url]);
    }

    #[tokio::test]
    async fn test_close_disconnects_everything() {
        let (gateway, _factory, directory) = test_gateway();
        let client = connect_client(&gateway, "tcp://client:1");

        gateway.close();
        assert!(client.was_disconnected());
        assert!(directory.was_disconnected());
    }
}
