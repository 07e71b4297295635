//! Debounced HTTP callback dispatch
//!
//! Subscriber systems register a callback URL and get poked with a bare GET
//! whenever changes land for one of their mailboxes. Pokes are debounced per
//! URL: a new notification within the quiet window supersedes the pending
//! one, so a burst of changes produces a single delivery after the burst.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::EngineContext;
use crate::cancel::CancelToken;
use crate::error::EngineError;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CallbackDispatcher {
    client: reqwest::Client,
    debounce: Duration,
    /// Pending poke per URL; inserting cancels the token it replaces.
    pending: Mutex<HashMap<String, CancelToken>>,
    cancel: CancelToken,
}

impl CallbackDispatcher {
    pub fn new(ctx: &EngineContext, cancel: CancelToken) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            debounce: ctx.config.debounce(),
            pending: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Schedule a debounced poke for each URL. Returns immediately; delivery
    /// happens on a background task after the quiet window elapses without a
    /// superseding call.
    pub fn notify(self: &Arc<Self>, urls: &[String]) {
        let mut seen = std::collections::HashSet::new();
        for url in urls {
            if !seen.insert(url.as_str()) {
                continue;
            }
            self.schedule(url.clone());
        }
    }

    fn schedule(self: &Arc<Self>, url: String) {
        let token = CancelToken::new();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = dispatcher.cancel.cancelled() => return,
                _ = tokio::time::sleep(dispatcher.debounce) => {}
            }
            {
                let mut pending = dispatcher
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match pending.get(&url) {
                    Some(current) if current.same(&token) => {
                        pending.remove(&url);
                    }
                    // superseded between the sleep and the lock
                    _ => return,
                }
            }
            dispatcher.deliver(&url).await;
        });
    }

    /// One delivery attempt, never retried. The change log is the source of
    /// truth; a missed poke is recovered by the subscriber's next query.
    async fn deliver(&self, url: &str) {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Callback delivered to {}", url);
            }
            Ok(response) => {
                warn!("Callback to {} returned {}", url, response.status());
            }
            Err(e) => {
                warn!("Callback to {} failed: {}", url, e);
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
