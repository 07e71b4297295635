//! Mailbox affinity discovery
//!
//! [`AffinityResolver`] chases the directory protocol's redirects and busy
//! responses to pin one address to a backend partition.
//! [`MailboxDiscoveryOrchestrator`] fans batches of unresolved mailboxes out
//! under a bounded-concurrency cap and persists the results.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::retry::RetryExecutor;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::remote::discovery::DiscoveryOutcome;
use crate::remote::Affinity;
use crate::store::mailboxes;

#[derive(Debug, Clone)]
pub struct ResolvedMailbox {
    pub email: String,
    pub affinity: Affinity,
}

/// Partial result of resolving one batch: addresses that failed permanently
/// land in `invalid`; addresses that merely could not be resolved this round
/// are absent from both lists and picked up again next cycle.
#[derive(Debug, Default)]
pub struct BatchResolution {
    pub resolved: Vec<ResolvedMailbox>,
    pub invalid: Vec<String>,
}

pub struct AffinityResolver {
    ctx: Arc<EngineContext>,
    cancel: CancelToken,
    retry: RetryExecutor,
}

impl AffinityResolver {
    pub fn new(ctx: Arc<EngineContext>, cancel: CancelToken) -> Self {
        let retry = RetryExecutor::from_config(&ctx.config, cancel.clone());
        Self { ctx, cancel, retry }
    }

    pub async fn resolve_batch(&self, emails: &[String]) -> Result<BatchResolution, EngineError> {
        let mut result = BatchResolution::default();
        for email in emails {
            self.cancel.check()?;
            let attempts = self.ctx.config.retry_max_attempts;
            match self
                .retry
                .execute("resolve mailbox", email, attempts, |_| {
                    self.resolve_single(email)
                })
                .await
            {
                Ok(affinity) => result.resolved.push(ResolvedMailbox {
                    email: email.clone(),
                    affinity,
                }),
                Err(EngineError::UnknownUser(_)) => {
                    warn!("Directory reports {} as unknown, marking invalid", email);
                    result.invalid.push(email.clone());
                }
                Err(EngineError::NoEndpointFound(_)) => {
                    warn!("No endpoint found for {}, marking invalid", email);
                    result.invalid.push(email.clone());
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    // transient this round; the mailbox stays unresolved
                    warn!("Discovery failed for {}: {}", email, e);
                }
            }
        }
        Ok(result)
    }

    /// Redirect-chase loop for one address. A busy response waits out the
    /// cool-down without consuming a hop.
    async fn resolve_single(&self, email: &str) -> Result<Affinity, EngineError> {
        let config = &self.ctx.config;
        let mut url = config.discovery_url.clone();
        let mut hops = 0;
        while hops < config.redirect_max_hops {
            self.cancel.check()?;
            let outcome = self
                .ctx
                .directory
                .resolve_user(&config.service_account, &url, email)
                .await?;
            match outcome {
                DiscoveryOutcome::Resolved(affinity) => return Ok(affinity),
                DiscoveryOutcome::Redirect(next) => {
                    debug!("Discovery redirect for {}: {} -> {}", email, url, next);
                    url = next;
                    hops += 1;
                }
                DiscoveryOutcome::Busy => {
                    warn!(
                        "Discovery busy for {}, cooling down {}s",
                        email, config.busy_cooldown_secs
                    );
                    self.cancel.sleep(config.busy_cooldown()).await?;
                }
            }
        }
        Err(EngineError::NoEndpointFound(email.to_string()))
    }
}

pub struct MailboxDiscoveryOrchestrator {
    ctx: Arc<EngineContext>,
    cancel: CancelToken,
}

impl MailboxDiscoveryOrchestrator {
    pub fn new(ctx: Arc<EngineContext>, cancel: CancelToken) -> Self {
        Self { ctx, cancel }
    }

    /// Resolve every mailbox lacking an affinity, at most
    /// `discovery_concurrency` batches in flight. Returns once all in-flight
    /// work has completed.
    pub async fn discover_all(&self) -> Result<(), EngineError> {
        let pending = mailboxes::unresolved(&self.ctx.pool)?;
        if pending.is_empty() {
            debug!("No mailboxes awaiting discovery");
            return Ok(());
        }
        info!("Discovering affinity for {} mailboxes", pending.len());

        let permits = Arc::new(Semaphore::new(self.ctx.config.discovery_concurrency()));
        let mut handles = Vec::new();

        for chunk in pending.chunks(self.ctx.config.discovery_batch_size) {
            self.cancel.check()?;
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Cancelled)?;
            let chunk = chunk.to_vec();
            let ctx = self.ctx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let resolver = AffinityResolver::new(ctx.clone(), cancel);
                match resolver.resolve_batch(&chunk).await {
                    Ok(resolution) => {
                        if let Err(e) = apply_resolution(&ctx, &resolution) {
                            error!("Failed to persist discovery results: {}", e);
                        }
                    }
                    Err(EngineError::Cancelled) => {}
                    Err(e) => error!("Discovery batch failed: {}", e),
                }
            }));
        }

        // drain barrier: every in-flight resolution completes before the
        // caller proceeds to baseline acquisition
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn apply_resolution(ctx: &EngineContext, resolution: &BatchResolution) -> Result<(), EngineError> {
    for resolved in &resolution.resolved {
        match mailboxes::get_mailbox(&ctx.pool, &resolved.email)? {
            Some(existing) if existing.affinity.as_ref() == Some(&resolved.affinity) => {}
            Some(existing) => {
                info!(
                    "Affinity changed for {}: {:?} -> {:?}",
                    resolved.email, existing.affinity, resolved.affinity
                );
                mailboxes::set_affinity(&ctx.pool, &resolved.email, &resolved.affinity)?;
            }
            None => {
                mailboxes::set_affinity(&ctx.pool, &resolved.email, &resolved.affinity)?;
            }
        }
    }
    for email in &resolution.invalid {
        mailboxes::mark_invalid(&ctx.pool, email)?;
    }
    Ok(())
}
