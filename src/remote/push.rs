use std::time::Duration;

use async_trait::async_trait;

use super::RawEvent;
use crate::error::EngineError;

/// A registered push subscription for one mailbox.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub mailbox: String,
    /// Backend routing cookie. The primary's anchor is propagated to every
    /// other member of its group so all subscriptions land on the same
    /// backend partition.
    pub anchor: Option<String>,
}

/// Signals emitted by a live streaming connection.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    Events {
        mailbox: String,
        events: Vec<RawEvent>,
    },
    SubscriptionError {
        mailbox: String,
        message: String,
    },
    Disconnected {
        error: Option<String>,
    },
}

/// Push-subscription protocol.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Register a push subscription for one mailbox on the given backend.
    async fn subscribe(
        &self,
        endpoint: &str,
        mailbox: &str,
        folders: &[String],
        anchor: Option<&str>,
    ) -> Result<Subscription, EngineError>;

    /// Open a multiplexed streaming connection scoped to the primary
    /// subscription's session, lifetime-bounded by `recycle_period`.
    /// Signals are delivered on `signals`.
    async fn open_connection(
        &self,
        primary: &Subscription,
        recycle_period: Duration,
        signals: flume::Sender<ConnectionSignal>,
    ) -> Result<Box<dyn PushConnection>, EngineError>;
}

/// A live multiplexed streaming connection.
#[async_trait]
pub trait PushConnection: Send + Sync {
    /// Register an additional member subscription onto this connection.
    async fn add_subscription(&self, subscription: &Subscription) -> Result<(), EngineError>;

    /// Re-open after a disconnect.
    async fn reopen(&self) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    fn subscription_count(&self) -> usize;
}
