//! Cooperative cancellation
//!
//! One root token is created per synchronization-loop iteration and cloned
//! into every task the iteration spawns. Cancelling it unwinds in-flight
//! remote calls, retry sleeps and streaming connections.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::EngineError;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True when both tokens share the same underlying state.
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        // Register the waiter before re-checking the flag so a cancel racing
        // with this call is not lost.
        let mut notified = pin!(self.inner.notify.notified());
        loop {
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }

    /// Sleep that ends early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Bail out if the token is already cancelled.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
