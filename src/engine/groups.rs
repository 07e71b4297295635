//! Distribution group expansion
//!
//! Remote subscriber systems are registered as directory distribution groups.
//! Each cycle the expander asks the directory for the current membership and
//! reconciles it against the stored roster, enrolling new addresses into the
//! mailbox table.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry::RetryExecutor;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::store::{groups, mailboxes};

pub struct GroupExpander {
    ctx: Arc<EngineContext>,
    cancel: CancelToken,
    retry: RetryExecutor,
}

impl GroupExpander {
    pub fn new(ctx: Arc<EngineContext>, cancel: CancelToken) -> Self {
        let retry = RetryExecutor::from_config(&ctx.config, cancel.clone());
        Self { ctx, cancel, retry }
    }

    /// Expand every remote system's group. A failure on one group does not
    /// stop the others; it is logged and the stored roster stays untouched.
    pub async fn expand_all(&self) -> Result<(), EngineError> {
        for system in groups::remote_systems(&self.ctx.pool)? {
            self.cancel.check()?;
            match self.expand(&system.group_name).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => warn!("Group expansion failed for {}: {}", system.group_name, e),
            }
        }
        Ok(())
    }

    pub async fn expand(&self, group_name: &str) -> Result<(), EngineError> {
        let config = &self.ctx.config;
        let fetched = self
            .retry
            .execute("expand group", group_name, config.retry_max_attempts, |_| {
                self.ctx
                    .directory
                    .expand_group(&config.service_account, group_name)
            })
            .await?;

        // addresses compare case-insensitively
        let fetched: HashSet<String> = fetched
            .iter()
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .collect();
        let stored: HashSet<String> = groups::members(&self.ctx.pool, group_name)?
            .into_iter()
            .collect();

        let added: Vec<&String> = fetched.difference(&stored).collect();
        let removed: Vec<&String> = stored.difference(&fetched).collect();
        if added.is_empty() && removed.is_empty() {
            debug!("Group {} unchanged ({} members)", group_name, stored.len());
            return Ok(());
        }

        for email in &added {
            groups::add_member(&self.ctx.pool, group_name, email)?;
            mailboxes::ensure_mailbox(&self.ctx.pool, email)?;
        }
        for email in &removed {
            groups::remove_member(&self.ctx.pool, group_name, email)?;
        }
        info!(
            "Group {} reconciled: {} added, {} removed, {} total",
            group_name,
            added.len(),
            removed.len(),
            fetched.len()
        );
        Ok(())
    }
}
