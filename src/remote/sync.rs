use async_trait::async_trait;

use super::RawEvent;
use crate::error::EngineError;

/// One page of incremental changes for a (mailbox, folder) pair.
#[derive(Debug, Clone)]
pub struct SyncPage {
    pub changes: Vec<RawEvent>,
    /// Opaque cursor positioned after this page.
    pub cursor: String,
    pub more_available: bool,
}

/// Incremental change protocol.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Fetch one page of changes. `cursor = None` requests a full resync
    /// from the beginning of the folder's change history.
    async fn sync_folder(
        &self,
        endpoint: &str,
        mailbox: &str,
        folder: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<SyncPage, EngineError>;
}
