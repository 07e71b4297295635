//! Engine components
//!
//! The synchronization pipeline, leaves first: retry wrapper, affinity
//! discovery, group expansion, baseline acquisition, subscription groups,
//! change ingestion, callback dispatch, and the top-level driver.

pub mod baseline;
pub mod callbacks;
pub mod discovery;
pub mod groups;
pub mod ingest;
pub mod retry;
pub mod runner;
pub mod subscriptions;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::remote::discovery::DirectoryClient;
use crate::remote::push::PushClient;
use crate::remote::sync::SyncClient;
use crate::store::DbPool;

/// Explicit application context: constructed once at startup and passed by
/// reference to every component. Replaces any process-wide singleton state.
pub struct EngineContext {
    pub config: EngineConfig,
    pub pool: DbPool,
    pub directory: Arc<dyn DirectoryClient>,
    pub sync: Arc<dyn SyncClient>,
    pub push: Arc<dyn PushClient>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        pool: DbPool,
        directory: Arc<dyn DirectoryClient>,
        sync: Arc<dyn SyncClient>,
        push: Arc<dyn PushClient>,
    ) -> Self {
        Self {
            config,
            pool,
            directory,
            sync,
            push,
        }
    }
}
