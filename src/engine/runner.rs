//! Top-level synchronization loop
//!
//! One iteration: expand groups, discover affinities, acquire baselines,
//! establish subscription groups, run a catch-up sync, then idle for a
//! recycle period before tearing everything down and starting over. The
//! teardown-and-rebuild cadence is the self-healing mechanism: whatever
//! drifted during the window (expired subscriptions, moved mailboxes,
//! poisoned connections) is rebuilt from the store on the next pass.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::baseline::SyncBaselineAcquirer;
use super::callbacks::CallbackDispatcher;
use super::discovery::MailboxDiscoveryOrchestrator;
use super::groups::GroupExpander;
use super::ingest::ChangeIngestionPipeline;
use super::subscriptions::SubscriptionGroupManager;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;

pub struct SynchronizationLoop {
    ctx: Arc<EngineContext>,
    shutdown: CancelToken,
}

impl SynchronizationLoop {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            shutdown: CancelToken::new(),
        }
    }

    /// Token that stops the loop at the next cancellation point.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Run iterations until shutdown. An iteration that fails is logged and
    /// the next one starts fresh after a full recycle period, so a
    /// persistent failure cannot spin the loop hot; the loop itself never
    /// gives up.
    pub async fn run(&self) {
        info!("Synchronization loop starting");
        while !self.shutdown.is_cancelled() {
            let iteration = CancelToken::new();
            // propagate shutdown into the running iteration
            let shutdown = self.shutdown.clone();
            let iteration_guard = iteration.clone();
            let guard = tokio::spawn(async move {
                shutdown.cancelled().await;
                iteration_guard.cancel();
            });

            let failed = match self.run_iteration(&iteration).await {
                Ok(()) => false,
                Err(EngineError::Cancelled) => false,
                Err(e) => {
                    error!("Synchronization iteration failed: {}", e);
                    true
                }
            };
            iteration.cancel();
            guard.abort();

            if failed
                && self
                    .shutdown
                    .sleep(self.ctx.config.recycle_period())
                    .await
                    .is_err()
            {
                break;
            }
        }
        info!("Synchronization loop stopped");
    }

    async fn run_iteration(&self, cancel: &CancelToken) -> Result<(), EngineError> {
        let iteration_id = uuid::Uuid::new_v4();
        info!("Starting synchronization iteration {}", iteration_id);

        let dispatcher = Arc::new(CallbackDispatcher::new(&self.ctx, cancel.clone())?);
        let pipeline =
            ChangeIngestionPipeline::new(self.ctx.clone(), dispatcher, cancel.clone());

        GroupExpander::new(self.ctx.clone(), cancel.clone())
            .expand_all()
            .await?;
        MailboxDiscoveryOrchestrator::new(self.ctx.clone(), cancel.clone())
            .discover_all()
            .await?;
        SyncBaselineAcquirer::new(self.ctx.clone(), cancel.clone())
            .ensure_baselines()
            .await?;

        let groups =
            SubscriptionGroupManager::new(self.ctx.clone(), pipeline.clone(), cancel.clone());
        let group_handles = groups.establish_all()?;

        // catch up on anything that happened while subscriptions were down,
        // then idle with live subscriptions until the recycle period elapses
        let outcome = match pipeline.sync_all().await {
            Ok(()) => cancel.sleep(self.ctx.config.recycle_period()).await,
            Err(e) => Err(e),
        };

        // tear down this iteration's subscription groups before rebuilding;
        // this runs on the error path too so a new iteration never overlaps
        // with pump tasks that are still closing connections
        cancel.cancel();
        for handle in group_handles {
            if let Err(e) = handle.await {
                warn!("Subscription group task panicked: {}", e);
            }
        }
        info!("Synchronization iteration {} finished", iteration_id);
        outcome
    }
}
