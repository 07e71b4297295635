//! Sync baseline acquisition
//!
//! Before a mailbox can stream incremental changes it needs a cursor that
//! marks 'current state'. The acquirer runs one initial sync call per
//! (mailbox, folder) pair that has never synchronized, keeps the returned
//! cursor, and discards the pre-existing item list it comes with.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use super::retry::RetryExecutor;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::store::cursors::{self, BaselineTarget};

pub struct SyncBaselineAcquirer {
    ctx: Arc<EngineContext>,
    cancel: CancelToken,
}

impl SyncBaselineAcquirer {
    pub fn new(ctx: Arc<EngineContext>, cancel: CancelToken) -> Self {
        Self { ctx, cancel }
    }

    /// Acquire baselines for every pair lacking one, bounded by
    /// `discovery_concurrency`. Individual failures are logged; the pair is
    /// retried on the next cycle.
    pub async fn ensure_baselines(&self) -> Result<(), EngineError> {
        let targets = cursors::targets_lacking_cursor(&self.ctx.pool, &self.ctx.config.folders)?;
        if targets.is_empty() {
            debug!("All mailbox folders have a sync baseline");
            return Ok(());
        }
        info!("Acquiring sync baseline for {} mailbox folders", targets.len());

        let permits = Arc::new(Semaphore::new(self.ctx.config.discovery_concurrency()));
        let mut handles = Vec::new();
        for target in targets {
            self.cancel.check()?;
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Cancelled)?;
            let ctx = self.ctx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match acquire_one(&ctx, &cancel, &target).await {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => {}
                    Err(e) => error!(
                        "Baseline acquisition failed for {}/{}: {}",
                        target.email, target.folder, e
                    ),
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn acquire_one(
    ctx: &EngineContext,
    cancel: &CancelToken,
    target: &BaselineTarget,
) -> Result<(), EngineError> {
    let retry = RetryExecutor::from_config(&ctx.config, cancel.clone());
    let label = format!("{}/{}", target.email, target.folder);
    let page = retry
        .execute("acquire baseline", &label, ctx.config.retry_max_attempts, |_| {
            ctx.sync.sync_folder(
                &target.endpoint,
                &target.email,
                &target.folder,
                None,
                ctx.config.sync_page_size,
            )
        })
        .await?;
    // the initial call enumerates existing items; only the cursor matters
    cursors::set_cursor(&ctx.pool, &target.email, &target.folder, Some(&page.cursor))?;
    debug!("Baseline acquired for {}", label);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::remote::discovery::{DirectoryClient, DiscoveryOutcome};
    use crate::remote::push::{ConnectionSignal, PushClient, PushConnection, Subscription};
    use crate::remote::sync::{SyncClient, SyncPage};
    use crate::remote::{Affinity, EventKind, RawEvent};
    use crate::store::{self, mailboxes, notifications};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct NoopDirectory;

    #[async_trait]
    impl DirectoryClient for NoopDirectory {
        async fn resolve_user(
            &self,
            _account: &str,
            _url: &str,
            email: &str,
        ) -> Result<DiscoveryOutcome, EngineError> {
            Err(EngineError::UnknownUser(email.to_string()))
        }

        async fn expand_group(
            &self,
            _account: &str,
            _group: &str,
        ) -> Result<Vec<String>, EngineError> {
            Ok(vec![])
        }
    }

    struct NoopPush;

    #[async_trait]
    impl PushClient for NoopPush {
        async fn subscribe(
            &self,
            _endpoint: &str,
            mailbox: &str,
            _folders: &[String],
            _anchor: Option<&str>,
        ) -> Result<Subscription, EngineError> {
            Ok(Subscription {
                id: mailbox.to_string(),
                mailbox: mailbox.to_string(),
                anchor: None,
            })
        }

        async fn open_connection(
            &self,
            _primary: &Subscription,
            _recycle: Duration,
            _signals: flume::Sender<ConnectionSignal>,
        ) -> Result<Box<dyn PushConnection>, EngineError> {
            Err(EngineError::ServiceUnavailable("not wired in this test".into()))
        }
    }

    /// Returns a page full of pre-existing items plus a cursor; fails the
    /// first `flaky` calls with a transient error.
    struct CountingSync {
        calls: AtomicU32,
        flaky: u32,
    }

    #[async_trait]
    impl SyncClient for CountingSync {
        async fn sync_folder(
            &self,
            _endpoint: &str,
            mailbox: &str,
            folder: &str,
            cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<SyncPage, EngineError> {
            assert!(cursor.is_none(), "baseline must sync from scratch");
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.flaky {
                return Err(EngineError::ServiceUnavailable("warming up".into()));
            }
            Ok(SyncPage {
                changes: vec![RawEvent {
                    folder: folder.to_string(),
                    item_id: format!("existing-{}", mailbox),
                    kind: EventKind::Created,
                    timestamp: Utc::now(),
                }],
                cursor: format!("baseline-{}-{}", mailbox, folder),
                more_available: false,
            })
        }
    }

    fn context(sync: Arc<CountingSync>) -> Arc<EngineContext> {
        let config = EngineConfig {
            retry_min_delay_ms: 1,
            retry_max_delay_ms: 2,
            folders: vec!["Inbox".to_string(), "Calendar".to_string()],
            ..Default::default()
        };
        let pool = store::open_in_memory().unwrap();
        Arc::new(EngineContext::new(
            config,
            pool,
            Arc::new(NoopDirectory),
            sync,
            Arc::new(NoopPush),
        ))
    }

    #[tokio::test]
    async fn test_baseline_persists_cursor_and_discards_items() {
        let sync = Arc::new(CountingSync {
            calls: AtomicU32::new(0),
            flaky: 0,
        });
        let ctx = context(sync.clone());
        let affinity = Affinity {
            endpoint: "https://b1".into(),
            grouping_key: "g1".into(),
        };
        mailboxes::set_affinity(&ctx.pool, "a@x.example", &affinity).unwrap();

        let acquirer = SyncBaselineAcquirer::new(ctx.clone(), CancelToken::new());
        acquirer.ensure_baselines().await.unwrap();

        assert_eq!(
            cursors::get_cursor(&ctx.pool, "a@x.example", "Inbox")
                .unwrap()
                .as_deref(),
            Some("baseline-a@x.example-Inbox")
        );
        assert_eq!(
            cursors::get_cursor(&ctx.pool, "a@x.example", "Calendar")
                .unwrap()
                .as_deref(),
            Some("baseline-a@x.example-Calendar")
        );
        // pre-existing items never enter the change log
        let changes =
            notifications::get_changes(&ctx.pool, &notifications::ChangeFilter::default()).unwrap();
        assert!(changes.is_empty());

        // a second run finds nothing left to do
        acquirer.ensure_baselines().await.unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_baseline_retries_transient_failures() {
        let sync = Arc::new(CountingSync {
            calls: AtomicU32::new(0),
            flaky: 1,
        });
        let ctx = context(sync);
        let affinity = Affinity {
            endpoint: "https://b1".into(),
            grouping_key: "g1".into(),
        };
        mailboxes::set_affinity(&ctx.pool, "a@x.example", &affinity).unwrap();

        let acquirer = SyncBaselineAcquirer::new(ctx.clone(), CancelToken::new());
        acquirer.ensure_baselines().await.unwrap();
        assert!(cursors::get_cursor(&ctx.pool, "a@x.example", "Inbox")
            .unwrap()
            .is_some());
    }
}
