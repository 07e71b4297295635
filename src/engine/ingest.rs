//! Change ingestion
//!
//! Two feeds converge here: events streamed over push connections and pages
//! pulled through incremental sync. Both are normalized into change log rows,
//! deduplicated against the (timestamp, mailbox, item) key, and fanned out to
//! the callback dispatcher.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::callbacks::CallbackDispatcher;
use super::retry::RetryExecutor;
use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::remote::{EventKind, RawEvent};
use crate::store::notifications::{self, ChangeType, NotificationRecord};
use crate::store::{cursors, groups, mailboxes};

#[derive(Clone)]
pub struct ChangeIngestionPipeline {
    ctx: Arc<EngineContext>,
    dispatcher: Arc<CallbackDispatcher>,
    cancel: CancelToken,
}

fn record_from_event(mailbox: &str, event: &RawEvent) -> NotificationRecord {
    let change_type = match event.kind {
        EventKind::Created | EventKind::Modified | EventKind::NewMail => ChangeType::Created,
        EventKind::Deleted => ChangeType::Deleted,
        _ => ChangeType::Updated,
    };
    NotificationRecord {
        timestamp: event.timestamp,
        email: mailbox.to_string(),
        folder: event.folder.clone(),
        item_id: event.item_id.clone(),
        change_type,
        details: serde_json::to_string(event).ok(),
    }
}

impl ChangeIngestionPipeline {
    pub fn new(
        ctx: Arc<EngineContext>,
        dispatcher: Arc<CallbackDispatcher>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            cancel,
        }
    }

    /// Persist a batch of push events for one mailbox and poke its
    /// subscribers if anything new landed.
    pub fn ingest(&self, mailbox: &str, events: &[RawEvent]) -> Result<usize, EngineError> {
        let inserted = self.persist(mailbox, events)?;
        if inserted > 0 {
            debug!("Ingested {} change(s) for {}", inserted, mailbox);
            self.notify_subscribers(mailbox)?;
        }
        Ok(inserted)
    }

    fn persist(&self, mailbox: &str, events: &[RawEvent]) -> Result<usize, EngineError> {
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            // cheap pre-filter; the unique index catches concurrent writers
            if notifications::exists(&self.ctx.pool, event.timestamp, mailbox, &event.item_id)? {
                continue;
            }
            records.push(record_from_event(mailbox, event));
        }
        notifications::insert_batch(&self.ctx.pool, &records)
    }

    fn notify_subscribers(&self, mailbox: &str) -> Result<(), EngineError> {
        let urls = groups::callback_urls_for_mailbox(&self.ctx.pool, mailbox)?;
        if !urls.is_empty() {
            self.dispatcher.notify(&urls);
        }
        Ok(())
    }

    /// Drain all pending changes for one (mailbox, folder) pair through
    /// incremental sync, following `more_available` across pages.
    ///
    /// Cursor handling on failure is asymmetric: a failed first call degrades
    /// the stored cursor to 'never synchronized' (the cursor may have been
    /// invalidated server-side), while a failure after at least one
    /// successful page keeps the progress made so far.
    pub async fn sync_mailbox_folder(
        &self,
        endpoint: &str,
        mailbox: &str,
        folder: &str,
    ) -> Result<usize, EngineError> {
        let retry = RetryExecutor::from_config(&self.ctx.config, self.cancel.clone());
        let label = format!("{}/{}", mailbox, folder);
        let starting_cursor = cursors::get_cursor(&self.ctx.pool, mailbox, folder)?;
        let mut cursor = starting_cursor.clone();
        let mut first_call = true;
        let mut total = 0;

        loop {
            self.cancel.check()?;
            let page = match retry
                .execute("sync folder", &label, self.ctx.config.retry_max_attempts, |_| {
                    self.ctx.sync.sync_folder(
                        endpoint,
                        mailbox,
                        folder,
                        cursor.as_deref(),
                        self.ctx.config.sync_page_size,
                    )
                })
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    if first_call && !matches!(e, EngineError::Cancelled) {
                        warn!("Sync failed for {}, resetting cursor: {}", label, e);
                        cursors::set_cursor(&self.ctx.pool, mailbox, folder, None)?;
                    }
                    return Err(e);
                }
            };
            first_call = false;

            total += self.persist(mailbox, &page.changes)?;
            if starting_cursor.as_deref() != Some(page.cursor.as_str()) {
                cursors::set_cursor(&self.ctx.pool, mailbox, folder, Some(&page.cursor))?;
            }
            cursor = Some(page.cursor);
            if !page.more_available {
                break;
            }
        }

        if total > 0 {
            info!("Synced {} change(s) for {}", total, label);
            self.notify_subscribers(mailbox)?;
        }
        Ok(total)
    }

    /// Catch-up sweep across every subscribable mailbox, bounded by
    /// `max_concurrency`. Folders within one mailbox sync sequentially.
    pub async fn sync_all(&self) -> Result<(), EngineError> {
        let targets = mailboxes::subscribable(&self.ctx.pool)?;
        if targets.is_empty() {
            return Ok(());
        }
        debug!("Catch-up sync across {} mailboxes", targets.len());

        let permits = Arc::new(Semaphore::new(self.ctx.config.max_concurrency));
        let mut handles = Vec::new();
        for (mailbox, affinity) in targets {
            self.cancel.check()?;
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Cancelled)?;
            let pipeline = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                for folder in &pipeline.ctx.config.folders {
                    match pipeline
                        .sync_mailbox_folder(&affinity.endpoint, &mailbox, folder)
                        .await
                    {
                        Ok(_) => {}
                        Err(EngineError::Cancelled) => return,
                        Err(e) => error!("Catch-up sync failed for {}/{}: {}", mailbox, folder, e),
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
