//! Transport socket cache.
//!
//! Given the endpoint set a service advertises, the cache races one dial per
//! usable endpoint, hands every concurrent requester the same shared future,
//! reuses established sockets, and tracks disconnection. Peer identity is the
//! `(machine id, url)` pair: a directory may advertise many urls that all
//! lead to the same peer, and url-only keying is unsafe because two hosts on
//! disjoint subnets can carry the same private address.
//!
//! The state lock covers map manipulation only; socket calls (`connect`,
//! `disconnect`) always happen with the lock released.

use crate::error::{BusError, Result};
use crate::promise::{Promise, PromiseFuture};
use crate::service::{local_machine_id, ServiceInfo};
use crate::signal::SignalLink;
use crate::socket::{MessageSocket, SocketFactory};
use crate::url::Url;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Socket handle shared between the cache and its callers.
pub type SharedSocket = Arc<dyn MessageSocket>;

/// Future resolving to a connected socket.
pub type SocketFuture = PromiseFuture<SharedSocket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    Pending,
    Connected,
    Error,
}

/// One dial campaign toward a single logical peer. The record is installed
/// under every url it covers; all of them share the promise.
struct ConnectionAttempt {
    state: AttemptState,
    endpoint: Option<SharedSocket>,
    promise: Promise<SharedSocket>,
    related_urls: Vec<Url>,
    attempt_count: usize,
    disconnection_link: Option<SignalLink>,
}

type AttemptRef = Arc<Mutex<ConnectionAttempt>>;

struct CacheState {
    dying: bool,
    connections: HashMap<String, HashMap<Url, AttemptRef>>,
    all_pending: Vec<SharedSocket>,
}

struct CacheInner {
    state: Mutex<CacheState>,
    factory: Arc<dyn SocketFactory>,
}

/// Connection coordinator for outbound message sockets.
pub struct TransportSocketCache {
    inner: Arc<CacheInner>,
}

impl TransportSocketCache {
    pub fn new(factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    dying: false,
                    connections: HashMap::new(),
                    all_pending: Vec::new(),
                }),
                factory,
            }),
        }
    }

    /// Reset the dying latch; the cache is usable again after a `close`.
    pub fn init(&self) {
        self.inner.state.lock().dying = false;
    }

    /// Terminal transition: fail every pending promise, disconnect every held
    /// socket. Subsequent `socket` calls fail immediately until `init`.
    pub fn close(&self) {
        debug!("TransportSocketCache is closing");
        let (connections, pending) = {
            let mut state = self.inner.state.lock();
            state.dying = true;
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.all_pending),
            )
        };

        // One attempt may sit under several urls; handle each record once.
        let mut seen: Vec<*const Mutex<ConnectionAttempt>> = Vec::new();
        let mut to_disconnect: Vec<SharedSocket> = Vec::new();
        for (_, machine_map) in connections {
            for (_, attempt) in machine_map {
                let ptr = Arc::as_ptr(&attempt);
                if seen.contains(&ptr) {
                    continue;
                }
                seen.push(ptr);

                let mut record = attempt.lock();
                if let Some(endpoint) = record.endpoint.take() {
                    // Remove the tracking link first so the disconnect below
                    // does not re-enter the (already emptied) maps.
                    if let Some(link) = record.disconnection_link.take() {
                        endpoint.disconnected().disconnect(link);
                    }
                    to_disconnect.push(endpoint);
                } else {
                    record.state = AttemptState::Error;
                    record.promise.set_error(BusError::CacheClosed);
                }
            }
        }

        for socket in to_disconnect {
            socket.disconnect();
        }
        for socket in pending {
            socket.disconnect();
        }
    }

    /// Yield a future resolving to a connected socket for the given service.
    ///
    /// Reuses an in-flight or established attempt when one is installed under
    /// any candidate url; otherwise starts a dial campaign across every
    /// usable endpoint. `preferred` only orders the candidates.
    pub fn socket(&self, info: &ServiceInfo, preferred: Option<&Url>) -> SocketFuture {
        let machine_id = info.machine_id.clone();
        let local = machine_id == local_machine_id();

        // A local service is reached through loopback when it offers any;
        // a remote one through whatever it advertises.
        let mut candidates: Vec<Url> = if local {
            info.endpoints.iter().filter(|u| u.is_loopback()).cloned().collect()
        } else {
            Vec::new()
        };
        if candidates.is_empty() {
            candidates = info.endpoints.clone();
        }
        if let Some(preferred) = preferred {
            if let Some(pos) = candidates.iter().position(|u| u == preferred) {
                candidates.swap(0, pos);
            }
        }

        let mut state = self.inner.state.lock();

        if state.dying {
            let promise = Promise::new();
            let future = promise.future();
            promise.set_error(BusError::CacheClosed);
            return future;
        }

        // Same machine, same url: same connection.
        if let Some(machine_map) = state.connections.get(&machine_id) {
            for url in &candidates {
                if let Some(attempt) = machine_map.get(url) {
                    debug!(machine = %machine_id, url = %url, "reusing connection attempt");
                    return attempt.lock().promise.future();
                }
            }
        }

        // Build the dial set before counting: invalid urls are never dialed,
        // and loopback urls of a remote machine would reach the wrong host.
        let mut dials: Vec<(Url, SharedSocket)> = Vec::new();
        for url in &candidates {
            if !url.is_valid() {
                continue;
            }
            if !local && url.is_loopback() {
                continue;
            }
            match self.inner.factory.make_socket(url.protocol()) {
                Ok(socket) => dials.push((url.clone(), socket)),
                Err(e) => warn!(url = %url, "cannot dial endpoint: {}", e),
            }
        }

        let attempt = Arc::new(Mutex::new(ConnectionAttempt {
            state: AttemptState::Pending,
            endpoint: None,
            promise: Promise::new(),
            related_urls: info.endpoints.clone(),
            attempt_count: dials.len(),
            disconnection_link: None,
        }));
        let future = attempt.lock().promise.future();

        if dials.is_empty() {
            error!(
                service = info.service_id,
                machine = %machine_id,
                "no usable endpoint to dial"
            );
            let mut record = attempt.lock();
            record.state = AttemptState::Error;
            record.promise.set_error(BusError::NoEndpointReplied {
                service_id: info.service_id,
            });
            return future;
        }

        let machine_map = state.connections.entry(machine_id).or_default();
        for (url, _) in &dials {
            machine_map.insert(url.clone(), Arc::clone(&attempt));
            debug!(machine = %info.machine_id, url = %url, "inserted connection attempt");
        }

        for (url, socket) in dials {
            state.all_pending.push(Arc::clone(&socket));
            let inner = Arc::clone(&self.inner);
            let info = info.clone();
            tokio::spawn(async move {
                let result = socket.connect(&url).await;
                CacheInner::on_dial_complete(&inner, result, socket, url, info);
            });
        }

        future
    }

    /// Promote a socket established out-of-band (typically accepted by a
    /// server) so later `socket` calls reuse it.
    ///
    /// Callers must not insert over a live endpoint: an existing attempt here
    /// is either still pending (its waiters now resolve with this socket) or
    /// failed (it gets a fresh promise; futures holding the old one keep the
    /// error they already saw).
    pub fn insert(&self, machine_id: &str, url: Url, socket: SharedSocket) {
        let mut state = self.inner.state.lock();
        if state.dying {
            return;
        }

        let link = Self::track_disconnection(&self.inner, &socket, url.clone(), machine_id);

        if let Some(machine_map) = state.connections.get_mut(machine_id) {
            if let Some(attempt) = machine_map.get(&url).cloned() {
                let mut record = attempt.lock();
                debug_assert!(
                    record.endpoint.is_none(),
                    "insert over a live socket for {}",
                    url
                );
                if record.state != AttemptState::Pending {
                    record.promise = Promise::new();
                }
                record.state = AttemptState::Connected;
                record.endpoint = Some(Arc::clone(&socket));
                record.disconnection_link = Some(link);
                record.promise.set_value(socket);
                return;
            }
        }

        let promise = Promise::new();
        promise.set_value(Arc::clone(&socket));
        let attempt = Arc::new(Mutex::new(ConnectionAttempt {
            state: AttemptState::Connected,
            endpoint: Some(socket),
            promise,
            related_urls: vec![url.clone()],
            attempt_count: 0,
            disconnection_link: Some(link),
        }));
        state
            .connections
            .entry(machine_id.to_string())
            .or_default()
            .insert(url, attempt);
    }

    /// Subscribe the cache to a socket's disconnection, synchronously; the
    /// handler only fixes tables up. The weak back-reference keeps the socket
    /// from owning its cache.
    fn track_disconnection(
        inner: &Arc<CacheInner>,
        socket: &SharedSocket,
        url: Url,
        machine_id: &str,
    ) -> SignalLink {
        let weak: Weak<CacheInner> = Arc::downgrade(inner);
        let machine_id = machine_id.to_string();
        socket.disconnected().connect(move |_reason: &String| {
            if let Some(inner) = weak.upgrade() {
                inner.on_socket_disconnected(&url, &machine_id);
            }
        })
    }

    #[cfg(test)]
    fn pending_dial_count(&self) -> usize {
        self.inner.state.lock().all_pending.len()
    }

    #[cfg(test)]
    fn installed_url_count(&self, machine_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .get(machine_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl CacheInner {
    /// Completion handler of one parallel dial. Decides, under the lock,
    /// whether this socket is the winner, a loser, or the last failure.
    fn on_dial_complete(
        inner: &Arc<CacheInner>,
        result: Result<()>,
        socket: SharedSocket,
        url: Url,
        info: ServiceInfo,
    ) {
        let mut to_disconnect: Option<SharedSocket> = None;
        {
            let mut state = inner.state.lock();

            if state.dying {
                debug!("dial completed on a closed cache");
                if result.is_ok() {
                    state.all_pending.retain(|s| s.id() != socket.id());
                    to_disconnect = Some(socket);
                }
            } else {
                Self::settle_dial(inner, &mut state, result, socket, &url, &info, &mut to_disconnect);
            }
        }
        if let Some(socket) = to_disconnect {
            socket.disconnect();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_dial(
        inner: &Arc<CacheInner>,
        state: &mut CacheState,
        result: Result<()>,
        socket: SharedSocket,
        url: &Url,
        info: &ServiceInfo,
        to_disconnect: &mut Option<SharedSocket>,
    ) {
        let attempt = state
            .connections
            .get(&info.machine_id)
            .and_then(|machine_map| machine_map.get(url))
            .cloned();

        let Some(attempt) = attempt else {
            // The peer disconnected meanwhile and cleanup removed the
            // attempt; this socket has nowhere to go.
            state.all_pending.retain(|s| s.id() != socket.id());
            *to_disconnect = Some(socket);
            return;
        };

        let mut record = attempt.lock();
        record.attempt_count = record.attempt_count.saturating_sub(1);

        if record.state != AttemptState::Pending {
            debug!(url = %url, "already connected: rejecting redundant socket");
            state.all_pending.retain(|s| s.id() != socket.id());
            *to_disconnect = Some(socket);
            check_clear(&mut state.connections, &record, &info.machine_id);
            return;
        }

        if let Err(e) = result {
            // Individual endpoints failing is expected; only a fully
            // exhausted campaign is an error.
            debug!(
                service = info.service_id,
                url = %url,
                "could not connect endpoint: {}",
                e
            );
            state.all_pending.retain(|s| s.id() != socket.id());
            if record.attempt_count == 0 {
                error!(
                    service = info.service_id,
                    "could not connect to service: no endpoint replied"
                );
                record.promise.set_error(BusError::NoEndpointReplied {
                    service_id: info.service_id,
                });
                record.state = AttemptState::Error;
                check_clear(&mut state.connections, &record, &info.machine_id);
            }
            return;
        }

        state.all_pending.retain(|s| s.id() != socket.id());
        let link =
            TransportSocketCache::track_disconnection(inner, &socket, url.clone(), &info.machine_id);
        record.state = AttemptState::Connected;
        record.endpoint = Some(Arc::clone(&socket));
        record.disconnection_link = Some(link);
        debug!(service = info.service_id, url = %url, "connected to service");
        record.promise.set_value(socket);
    }

    /// Synchronous disconnection fix-up: mark the attempt failed and garbage
    /// collect its urls.
    fn on_socket_disconnected(&self, url: &Url, machine_id: &str) {
        let mut state = self.state.lock();
        let attempt = state
            .connections
            .get(machine_id)
            .and_then(|machine_map| machine_map.get(url))
            .cloned();
        let Some(attempt) = attempt else {
            return;
        };
        let mut record = attempt.lock();
        record.state = AttemptState::Error;
        check_clear(&mut state.connections, &record, machine_id);
    }
}

/// Erase an attempt that can no longer produce a socket: every dial finished
/// without a winner, or the connection it held is gone.
fn check_clear(
    connections: &mut HashMap<String, HashMap<Url, AttemptRef>>,
    record: &ConnectionAttempt,
    machine_id: &str,
) {
    let dead = (record.attempt_count == 0 && record.state != AttemptState::Connected)
        || record.state == AttemptState::Error;
    if !dead {
        return;
    }
    if let Some(machine_map) = connections.get_mut(machine_id) {
        for url in &record.related_urls {
            machine_map.remove(url);
        }
        if machine_map.is_empty() {
            connections.remove(machine_id);
        }
    }
}
