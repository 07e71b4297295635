//! Streaming subscription groups
//!
//! Subscribable mailboxes are partitioned by affinity into groups of at most
//! `max_batch_size`. Each group elects a primary, opens one multiplexed
//! streaming connection scoped to the primary's session, and registers the
//! remaining members onto it with the primary's anchor. A pump task per
//! group turns connection signals into ingestion work and drives reconnects.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ingest::ChangeIngestionPipeline;
use super::retry::RetryExecutor;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::remote::push::{ConnectionSignal, PushConnection, Subscription};
use crate::remote::Affinity;
use crate::store::mailboxes;

/// Mailboxes sharing one affinity, capped at `max_batch_size` members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionBatch {
    pub affinity: Affinity,
    pub members: Vec<String>,
}

/// Split an affinity-ordered mailbox list into batches. A new batch starts
/// whenever the affinity changes or the current batch is full.
pub fn partition_batches(
    mailboxes: &[(String, Affinity)],
    max_batch_size: usize,
) -> Vec<SubscriptionBatch> {
    let mut batches: Vec<SubscriptionBatch> = Vec::new();
    let mut current: Option<SubscriptionBatch> = None;
    for (email, affinity) in mailboxes {
        match current.as_mut() {
            Some(batch)
                if batch.affinity == *affinity && batch.members.len() < max_batch_size =>
            {
                batch.members.push(email.clone());
            }
            _ => {
                if let Some(finished) = current.take() {
                    batches.push(finished);
                }
                current = Some(SubscriptionBatch {
                    affinity: affinity.clone(),
                    members: vec![email.clone()],
                });
            }
        }
    }
    if let Some(finished) = current {
        batches.push(finished);
    }
    batches
}

enum PumpExit {
    Cancelled,
    Rebuild,
}

#[derive(Clone)]
pub struct SubscriptionGroupManager {
    ctx: Arc<EngineContext>,
    pipeline: ChangeIngestionPipeline,
    cancel: CancelToken,
    /// Global cap on in-flight subscription registrations, shared by every
    /// group so a burst of rebuilds cannot flood the backend.
    subscribe_permits: Arc<Semaphore>,
}

impl SubscriptionGroupManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        pipeline: ChangeIngestionPipeline,
        cancel: CancelToken,
    ) -> Self {
        let subscribe_permits = Arc::new(Semaphore::new(ctx.config.max_pending_subscribes));
        Self {
            ctx,
            pipeline,
            cancel,
            subscribe_permits,
        }
    }

    /// Partition the subscribable mailboxes and spawn one long-lived group
    /// task per batch. The returned handles complete on cancellation.
    pub fn establish_all(&self) -> Result<Vec<JoinHandle<()>>, EngineError> {
        let targets = mailboxes::subscribable(&self.ctx.pool)?;
        let batches = partition_batches(&targets, self.ctx.config.max_batch_size);
        if batches.is_empty() {
            debug!("No subscribable mailboxes");
            return Ok(Vec::new());
        }
        info!(
            "Establishing {} subscription group(s) over {} mailboxes",
            batches.len(),
            targets.len()
        );

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.run_group(batch).await;
            }));
        }
        Ok(handles)
    }

    /// Group lifecycle: build the connection, pump it until it dies, rebuild.
    /// Runs until cancellation or until every member has been dropped.
    async fn run_group(&self, batch: SubscriptionBatch) {
        while !self.cancel.is_cancelled() {
            match self.build_group(&batch).await {
                Ok(Some((connection, signals))) => {
                    match self.pump(connection.as_ref(), &signals).await {
                        PumpExit::Cancelled => return,
                        PumpExit::Rebuild => {
                            warn!(
                                "Rebuilding subscription group on {} ({})",
                                batch.affinity.endpoint, batch.affinity.grouping_key
                            );
                        }
                    }
                }
                Ok(None) => {
                    warn!(
                        "No member of group {} could subscribe, giving up until next cycle",
                        batch.affinity.grouping_key
                    );
                    return;
                }
                Err(EngineError::Cancelled) => return,
                Err(e) => {
                    warn!(
                        "Failed to build subscription group on {}: {}",
                        batch.affinity.endpoint, e
                    );
                    if self
                        .cancel
                        .sleep(self.ctx.config.busy_cooldown())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Elect a primary, open the connection, register the remaining members.
    /// Members whose subscribe fails permanently are dropped back to
    /// discovery. Returns `None` when no member could subscribe at all.
    async fn build_group(
        &self,
        batch: &SubscriptionBatch,
    ) -> Result<
        Option<(Box<dyn PushConnection>, flume::Receiver<ConnectionSignal>)>,
        EngineError,
    > {
        let mut primary: Option<Subscription> = None;
        let mut remaining: Vec<&String> = Vec::new();
        for email in &batch.members {
            if primary.is_some() {
                remaining.push(email);
                continue;
            }
            match self.subscribe_member(batch, email, None).await {
                Ok(subscription) => primary = Some(subscription),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => self.drop_member(email, &e)?,
            }
        }
        let Some(primary) = primary else {
            return Ok(None);
        };
        debug!(
            "Primary {} elected for group {} ({} further members)",
            primary.mailbox,
            batch.affinity.grouping_key,
            remaining.len()
        );

        let (tx, rx) = flume::unbounded();
        let connection = self
            .ctx
            .push
            .open_connection(&primary, self.ctx.config.recycle_period(), tx)
            .await?;

        for email in remaining {
            self.cancel.check()?;
            match self
                .subscribe_member(batch, email, primary.anchor.as_deref())
                .await
            {
                Ok(subscription) => {
                    if let Err(e) = connection.add_subscription(&subscription).await {
                        warn!("Could not attach {} to connection: {}", email, e);
                    }
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => self.drop_member(email, &e)?,
            }
        }
        Ok(Some((connection, rx)))
    }

    async fn subscribe_member(
        &self,
        batch: &SubscriptionBatch,
        email: &str,
        anchor: Option<&str>,
    ) -> Result<Subscription, EngineError> {
        let permit = self
            .subscribe_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled)?;
        let retry = RetryExecutor::from_config(&self.ctx.config, self.cancel.clone());
        let result = retry
            .execute(
                "subscribe",
                email,
                self.ctx.config.retry_max_attempts,
                |_| {
                    self.ctx.push.subscribe(
                        &batch.affinity.endpoint,
                        email,
                        &self.ctx.config.folders,
                        anchor,
                    )
                },
            )
            .await;
        drop(permit);
        result
    }

    /// Send a failed member back through discovery on the next cycle.
    fn drop_member(&self, email: &str, err: &EngineError) -> Result<(), EngineError> {
        warn!("Dropping {} from its group, re-resolving next cycle: {}", email, err);
        mailboxes::clear_affinity(&self.ctx.pool, email)
    }

    async fn pump(
        &self,
        connection: &dyn PushConnection,
        signals: &flume::Receiver<ConnectionSignal>,
    ) -> PumpExit {
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(e) = connection.close().await {
                        debug!("Close on shutdown failed: {}", e);
                    }
                    return PumpExit::Cancelled;
                }
                signal = signals.recv_async() => match signal {
                    Ok(signal) => signal,
                    // sender dropped without a disconnect signal
                    Err(_) => return PumpExit::Rebuild,
                },
            };
            match signal {
                ConnectionSignal::Events { mailbox, events } => {
                    let count = events.len();
                    let pipeline = self.pipeline.clone();
                    // ingestion is database work; keep the pump responsive
                    tokio::spawn(async move {
                        if let Err(e) = pipeline.ingest(&mailbox, &events) {
                            warn!("Failed to ingest {} event(s) for {}: {}", count, mailbox, e);
                        }
                    });
                }
                ConnectionSignal::SubscriptionError { mailbox, message } => {
                    warn!("Subscription error for {}: {}", mailbox, message);
                    if let Err(e) = self.drop_member(&mailbox, &EngineError::Discovery(message)) {
                        warn!("Could not drop {}: {}", mailbox, e);
                    }
                }
                ConnectionSignal::Disconnected { error } => {
                    if self.cancel.is_cancelled() {
                        if let Err(e) = connection.close().await {
                            debug!("Close on shutdown failed: {}", e);
                        }
                        return PumpExit::Cancelled;
                    }
                    match &error {
                        Some(message) => info!("Connection dropped ({}), reopening", message),
                        None => info!("Connection recycled, reopening"),
                    }
                    if let Err(e) = connection.reopen().await {
                        warn!("Reopen failed, rebuilding group: {}", e);
                        return PumpExit::Rebuild;
                    }
                    if connection.subscription_count() == 0 {
                        warn!("Connection reopened with no live subscriptions, rebuilding");
                        return PumpExit::Rebuild;
                    }
                }
            }
        }
    }
}
