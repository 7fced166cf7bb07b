//! Single-fulfilment promises with cloneable shared futures.
//!
//! A dial campaign is driven once but observed by every concurrent requester:
//! the cache hands each caller a `PromiseFuture` cloned from the same
//! `Promise`, and the first completion (value or error) resolves them all.
//! A promise is fulfilled exactly once; later attempts are ignored.

use crate::error::{BusError, Result};
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone)]
enum PromiseState<T> {
    Pending,
    Ready(T),
    Failed(BusError),
}

/// The producing side. Owned by whoever drives the operation.
#[derive(Debug)]
pub struct Promise<T: Clone> {
    tx: watch::Sender<PromiseState<T>>,
}

/// The consuming side. Cheap to clone; every clone resolves to the same
/// outcome.
#[derive(Debug, Clone)]
pub struct PromiseFuture<T: Clone> {
    rx: watch::Receiver<PromiseState<T>>,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PromiseState::Pending);
        Self { tx }
    }

    /// Hand out a future observing this promise.
    pub fn future(&self) -> PromiseFuture<T> {
        PromiseFuture {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.tx.borrow(), PromiseState::Pending)
    }

    /// Fulfil with a value. Ignored (with a warning) if already fulfilled.
    pub fn set_value(&self, value: T) {
        self.fulfil(PromiseState::Ready(value));
    }

    /// Fulfil with an error. Ignored (with a warning) if already fulfilled.
    pub fn set_error(&self, error: BusError) {
        self.fulfil(PromiseState::Failed(error));
    }

    fn fulfil(&self, state: PromiseState<T>) {
        let mut stored = false;
        self.tx.send_modify(|current| {
            if matches!(current, PromiseState::Pending) {
                *current = state;
                stored = true;
            }
        });
        if !stored {
            warn!("promise fulfilled twice, second outcome dropped");
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PromiseFuture<T> {
    /// Wait for the outcome.
    ///
    /// If the promise is dropped while still pending, waiters resolve with a
    /// network error rather than hanging.
    pub async fn wait(mut self) -> Result<T> {
        loop {
            match &*self.rx.borrow_and_update() {
                PromiseState::Ready(value) => return Ok(value.clone()),
                PromiseState::Failed(error) => return Err(error.clone()),
                PromiseState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                return Err(BusError::network("promise dropped before fulfilment"));
            }
        }
    }

    /// Non-blocking probe: `None` while pending.
    pub fn try_result(&self) -> Option<Result<T>> {
        match &*self.rx.borrow() {
            PromiseState::Ready(value) => Some(Ok(value.clone())),
            PromiseState::Failed(error) => Some(Err(error.clone())),
            PromiseState::Pending => None,
        }
    }
}
