//! Signals with link-handle subscriptions.
//!
//! A subscriber is a sum type: either a functor (invoked inline, or spawned
//! onto the runtime when an executor is supplied) or a forward to a remote
//! object method. Each subscription carries two atomic flags: `enabled`
//! (cleared by `disconnect`, checked immediately before dispatch so a
//! subscriber removed mid-fire is skipped) and `active` (set while its
//! callback runs). Firing snapshots the subscriber list under a short lock
//! and dispatches outside it, so callbacks may themselves connect or
//! disconnect without deadlocking.

use crate::object::RemoteObject;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Handle identifying one subscription.
pub type SignalLink = u64;

/// Values a signal can carry to a remote peer.
pub trait SignalPayload {
    /// Encode the fired value as a parameter buffer.
    fn to_payload(&self) -> Bytes;
}

impl SignalPayload for String {
    fn to_payload(&self) -> Bytes {
        crate::codec::encode_string(self)
    }
}

impl SignalPayload for crate::message::Message {
    fn to_payload(&self) -> Bytes {
        self.encode()
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type PayloadEncoder<T> = Arc<dyn Fn(&T) -> Bytes + Send + Sync>;

enum Subscriber<T> {
    /// Local callback; `executor` spawns the invocation instead of running it
    /// inline on the firing task.
    Functor {
        callback: Callback<T>,
        executor: Option<Handle>,
    },
    /// Forward the encoded value to a remote object method.
    Forward {
        target: Arc<dyn RemoteObject>,
        method: u32,
        encode: PayloadEncoder<T>,
    },
}

struct Subscription<T> {
    subscriber: Subscriber<T>,
    enabled: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

/// A multi-subscriber signal carrying values of type `T`.
pub struct Signal<T> {
    subscriptions: Mutex<HashMap<SignalLink, Arc<Subscription<T>>>>,
    next_link: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        }
    }

    /// Subscribe a callback invoked inline on the firing task.
    ///
    /// Inline subscribers must not block; they are the direct-delivery path
    /// used for disconnection tracking, where only table fix-up is allowed.
    pub fn connect<F>(&self, callback: F) -> SignalLink
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.install(Subscriber::Functor {
            callback: Arc::new(callback),
            executor: None,
        })
    }

    /// Subscribe a callback dispatched as a task on the given runtime.
    pub fn connect_spawned<F>(&self, executor: Handle, callback: F) -> SignalLink
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.install(Subscriber::Functor {
            callback: Arc::new(callback),
            executor: Some(executor),
        })
    }

    /// Subscribe a forward posting fired values to a remote object method.
    pub fn connect_forward(&self, target: Arc<dyn RemoteObject>, method: u32) -> SignalLink
    where
        T: SignalPayload,
    {
        self.install(Subscriber::Forward {
            target,
            method,
            encode: Arc::new(|value: &T| value.to_payload()),
        })
    }

    fn install(&self, subscriber: Subscriber<T>) -> SignalLink {
        let link = self.next_link.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(Subscription {
            subscriber,
            enabled: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicBool::new(false)),
        });
        self.subscriptions.lock().insert(link, subscription);
        link
    }

    /// Remove a subscription. Returns whether the link was known. A
    /// subscriber disconnected while a fire is in flight will be skipped by
    /// that fire's enabled check.
    pub fn disconnect(&self, link: SignalLink) -> bool {
        let removed = self.subscriptions.lock().remove(&link);
        match removed {
            Some(subscription) => {
                subscription.enabled.store(false, Ordering::SeqCst);
                if subscription.active.load(Ordering::SeqCst) {
                    debug!(link, "subscriber disconnected while its callback runs");
                }
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Fire the signal with a value.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Arc<Subscription<T>>> =
            self.subscriptions.lock().values().cloned().collect();
        for subscription in snapshot {
            if !subscription.enabled.load(Ordering::SeqCst) {
                continue;
            }
            match &subscription.subscriber {
                Subscriber::Functor {
                    callback,
                    executor: None,
                } => {
                    subscription.active.store(true, Ordering::SeqCst);
                    callback(value);
                    subscription.active.store(false, Ordering::SeqCst);
                }
                Subscriber::Functor {
                    callback,
                    executor: Some(handle),
                } => {
                    let callback = Arc::clone(callback);
                    let value = value.clone();
                    let enabled = Arc::clone(&subscription.enabled);
                    let active = Arc::clone(&subscription.active);
                    handle.spawn(async move {
                        if enabled.load(Ordering::SeqCst) {
                            active.store(true, Ordering::SeqCst);
                            callback(&value);
                            active.store(false, Ordering::SeqCst);
                        }
                    });
                }
                Subscriber::Forward {
                    target,
                    method,
                    encode,
                } => {
                    subscription.active.store(true, Ordering::SeqCst);
                    target.meta_post(*method, encode(value));
                    subscription.active.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
